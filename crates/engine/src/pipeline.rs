//! Clinical pipeline facade
//!
//! Owns every component of both flows and the shared state between them
//! (vector store, result caches). Created once per process and torn down
//! with `shutdown`; nothing lives in globals.

use crate::request::{AskRequest, AskResponse};
use crate::state::{self, StateSummary, EXTRACTION_CACHE_FILE, INDEX_FILE, NOTES_CACHE_FILE};
use medparse_common::config::AppConfig;
use medparse_common::documents::DirectoryDocumentStore;
use medparse_common::embeddings::create_embedder;
use medparse_common::llm::create_generator;
use medparse_common::metrics::OperationTimer;
use medparse_common::{AppError, Document, DocumentStore, Embedder, Result, TextGenerator};
use medparse_extraction::terminology::create_terminology;
use medparse_extraction::{
    transform, CodeMappings, CodeResolver, ExtractionResult, ExtractionSettings, InterchangeBundle,
    NoteAssistant, NoteOperation, NoteOutput, StructuredExtractor, TerminologyService,
};
use medparse_ingestion::{CorpusSnapshot, EmbeddingIndexer, IndexHandle, VectorStore};
use medparse_search::{Answer, AnswerSynthesizer, CorpusScope, RetrievalEngine, RetrievalSettings, SynthesisSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// External services the pipeline consumes
#[derive(Clone)]
pub struct Collaborators {
    pub documents: Arc<dyn DocumentStore>,
    pub embedder: Arc<dyn Embedder>,
    pub generator: Arc<dyn TextGenerator>,
    pub terminology: Arc<dyn TerminologyService>,
}

impl Collaborators {
    /// Production collaborators described by configuration
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            documents: Arc::new(DirectoryDocumentStore::new(config.documents.root.clone())),
            embedder: create_embedder(&config.embedding)?,
            generator: create_generator(&config.llm)?,
            terminology: create_terminology(&config.terminology)?,
        })
    }
}

/// Bundle with the extraction and code mappings it was built from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleReport {
    pub extraction: ExtractionResult,
    pub mappings: CodeMappings,
    pub bundle: InterchangeBundle,
}

pub struct ClinicalPipeline {
    config: AppConfig,
    documents: Arc<dyn DocumentStore>,
    store: Arc<VectorStore>,
    indexer: EmbeddingIndexer,
    retrieval: RetrievalEngine,
    synthesizer: AnswerSynthesizer,
    extractor: StructuredExtractor,
    resolver: CodeResolver,
    notes: NoteAssistant,
}

impl ClinicalPipeline {
    pub fn new(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        let Collaborators {
            documents,
            embedder,
            generator,
            terminology,
        } = collaborators;

        let store = Arc::new(VectorStore::new());
        let indexer = EmbeddingIndexer::from_config(&config, store.clone(), embedder.clone())?;
        let retrieval = RetrievalEngine::new(store.clone(), embedder, RetrievalSettings::from(&config));
        let synthesizer = AnswerSynthesizer::new(generator.clone(), SynthesisSettings::from_config(&config));
        let extractor = StructuredExtractor::new(generator.clone(), ExtractionSettings::from_config(&config));
        let resolver = CodeResolver::new(terminology, config.terminology_timeout());
        let notes = NoteAssistant::from_config(&config, generator);

        info!(
            corpus = %config.retrieval.default_corpus,
            metric = %config.embedding.metric,
            min_score = config.retrieval.min_score,
            "Clinical pipeline ready"
        );

        Ok(Self {
            config,
            documents,
            store,
            indexer,
            retrieval,
            synthesizer,
            extractor,
            resolver,
            notes,
        })
    }

    /// Pipeline with collaborators built from configuration alone
    pub fn from_config(config: AppConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config)?;
        Self::new(config, collaborators)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    async fn document(&self, document_id: &str) -> Result<Document> {
        if document_id.trim().is_empty() {
            return Err(AppError::validation("document_id", "document id must not be empty"));
        }
        self.documents.get(document_id).await
    }

    fn default_corpus(&self) -> &str {
        &self.config.retrieval.default_corpus
    }

    /// Index a document into the default corpus unless its content is already indexed
    #[instrument(skip(self))]
    pub async fn build_index(&self, document_id: &str) -> Result<IndexHandle> {
        let document = self.document(document_id).await?;
        self.indexer.index(self.default_corpus(), &document).await
    }

    /// Rebuild a document's index; readers keep the previous one until the swap
    #[instrument(skip(self))]
    pub async fn rebuild_index(&self, document_id: &str) -> Result<IndexHandle> {
        let document = self.document(document_id).await?;
        self.indexer.reindex(self.default_corpus(), &document).await
    }

    /// Retrieve evidence for a question and synthesize a cited answer.
    ///
    /// Unindexed scopes and invalid requests are errors. An embedder that
    /// stays unavailable degrades to the insufficient-evidence answer.
    #[instrument(skip(self, request), fields(top_k = ?request.top_k))]
    pub async fn retrieve_and_answer(&self, request: AskRequest) -> Result<AskResponse> {
        request.check()?;
        let timer = OperationTimer::start();

        let corpus = request
            .corpus
            .clone()
            .unwrap_or_else(|| self.default_corpus().to_string());
        let scope = CorpusScope {
            corpus: corpus.clone(),
            document_ids: request.document_ids.clone(),
        };
        let k = request.top_k.unwrap_or(self.config.retrieval.default_top_k);

        let (answer, retrieved) = match self.retrieval.retrieve(&request.query, k, &scope).await {
            Ok(result) => {
                let answer = self.synthesizer.answer(&request.query, &result).await;
                (answer, result.chunks)
            }
            Err(e) if e.is_retryable() => {
                warn!(corpus = %corpus, error = %e, "Retrieval unavailable, answering without evidence");
                (Answer::insufficient(), Vec::new())
            }
            Err(e) => return Err(e),
        };

        Ok(AskResponse {
            query: request.query,
            corpus,
            answer,
            retrieved,
            processing_time_ms: (timer.elapsed_secs() * 1000.0) as u64,
        })
    }

    /// Structured record of a document; `use_cache = false` forces a fresh extraction
    #[instrument(skip(self))]
    pub async fn extract_structured(&self, document_id: &str, use_cache: bool) -> Result<ExtractionResult> {
        let document = self.document(document_id).await?;
        self.extractor.extract(&document, use_cache).await
    }

    /// Extract, code and transform a document into an interchange bundle
    #[instrument(skip(self))]
    pub async fn to_interchange_bundle(&self, document_id: &str) -> Result<InterchangeBundle> {
        Ok(self.bundle_report(document_id).await?.bundle)
    }

    /// Like `to_interchange_bundle`, keeping the intermediate results
    pub async fn bundle_report(&self, document_id: &str) -> Result<BundleReport> {
        let mut extraction = self.extract_structured(document_id, true).await?;
        let mappings = self.resolver.resolve_all(&extraction).await;

        for (mention, mapping) in extraction.diagnoses.iter_mut().zip(&mappings.diagnoses) {
            if mapping.is_coded() {
                mention.code = mapping.code.clone();
            }
        }
        for (mention, mapping) in extraction.medications.iter_mut().zip(&mappings.medications) {
            if mapping.is_coded() {
                mention.code = mapping.code.clone();
            }
        }

        let bundle = transform(&extraction, &mappings)?;
        Ok(BundleReport {
            extraction,
            mappings,
            bundle,
        })
    }

    /// Summary, patient overview or plain-language rewrite of a document
    #[instrument(skip(self))]
    pub async fn run_note(&self, document_id: &str, operation: NoteOperation, use_cache: bool) -> Result<NoteOutput> {
        let document = self.document(document_id).await?;
        self.notes.run(&document, operation, use_cache).await
    }

    /// Write the vector store and caches under `dir`
    pub async fn save_state(&self, dir: &Path) -> Result<StateSummary> {
        let corpora = self.store.snapshot();
        let extractions = self.extractor.cache().snapshot();
        let notes = self.notes.cache().snapshot();
        let summary = StateSummary {
            corpora: corpora.len(),
            extractions: extractions.len(),
            notes: notes.len(),
        };

        state::write_json(dir, INDEX_FILE, &corpora).await?;
        state::write_json(dir, EXTRACTION_CACHE_FILE, &extractions).await?;
        state::write_json(dir, NOTES_CACHE_FILE, &notes).await?;

        info!(dir = %dir.display(), ?summary, "State saved");
        Ok(summary)
    }

    /// Restore whatever snapshots exist under `dir`
    pub async fn load_state(&self, dir: &Path) -> Result<StateSummary> {
        let mut summary = StateSummary::default();

        if let Some(corpora) = state::read_json::<Vec<CorpusSnapshot>>(dir, INDEX_FILE).await? {
            summary.corpora = self.store.restore(corpora)?;
        }
        if let Some(entries) = state::read_json(dir, EXTRACTION_CACHE_FILE).await? {
            summary.extractions = self.extractor.cache().restore(entries);
        }
        if let Some(entries) = state::read_json(dir, NOTES_CACHE_FILE).await? {
            summary.notes = self.notes.cache().restore(entries);
        }

        info!(dir = %dir.display(), ?summary, "State loaded");
        Ok(summary)
    }

    /// Persist state when a state directory is configured
    pub async fn shutdown(&self) -> Result<()> {
        match &self.config.persistence.state_dir {
            Some(dir) => {
                self.save_state(dir).await?;
            }
            None => info!("No state directory configured, nothing persisted"),
        }
        info!("Clinical pipeline shut down");
        Ok(())
    }
}
