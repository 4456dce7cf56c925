//! Similarity retrieval
//!
//! Embeds a query with the corpus' embedding provider, scores every indexed
//! chunk in scope under the corpus metric, drops results below the score
//! floor and returns the best `k` in deterministic order.

mod vector;

use medparse_common::config::AppConfig;
use medparse_common::metrics::{self, OperationTimer};
use medparse_common::retry::with_timeout;
use medparse_common::{AppError, Embedder, Result};
use medparse_ingestion::{DocumentIndex, VectorStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// Retrieved chunk with similarity score
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoredChunk {
    /// `{document_id}#{ordinal}`
    pub chunk_id: String,
    pub document_id: String,
    pub ordinal: u32,
    pub text: String,
    pub score: f32,
    /// Index generation the chunk was read from
    pub generation: u64,
}

/// Ranked chunks for one query, best first, at most `k`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub query: String,
    pub chunks: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }
}

/// Which indexed documents a query runs against
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CorpusScope {
    pub corpus: String,
    /// Restrict to these documents; `None` searches the whole corpus
    pub document_ids: Option<Vec<String>>,
}

impl CorpusScope {
    pub fn corpus(name: impl Into<String>) -> Self {
        Self {
            corpus: name.into(),
            document_ids: None,
        }
    }

    pub fn documents<I, S>(name: impl Into<String>, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            corpus: name.into(),
            document_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }
}

/// Retrieval parameters
#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    /// Results scoring below this floor are dropped
    pub min_score: f32,
    /// Deadline for embedding the query
    pub timeout: Duration,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            min_score: 0.7,
            timeout: Duration::from_secs(15),
        }
    }
}

impl From<&AppConfig> for RetrievalSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            min_score: config.retrieval.min_score,
            timeout: config.retrieval_timeout(),
        }
    }
}

/// Query-time reader over the vector store
pub struct RetrievalEngine {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    settings: RetrievalSettings,
}

impl RetrievalEngine {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn Embedder>, settings: RetrievalSettings) -> Self {
        Self {
            store,
            embedder,
            settings,
        }
    }

    pub fn settings(&self) -> &RetrievalSettings {
        &self.settings
    }

    /// Return up to `k` chunks most similar to `query` within `scope`.
    ///
    /// A scope without an index is `NotIndexed`; a scope whose results all
    /// fall below the score floor yields an empty result.
    #[instrument(skip(self, query, scope), fields(corpus = %scope.corpus))]
    pub async fn retrieve(&self, query: &str, k: usize, scope: &CorpusScope) -> Result<RetrievalResult> {
        if k == 0 {
            return Err(AppError::validation("top_k", "k must be positive"));
        }
        if query.trim().is_empty() {
            return Err(AppError::validation("query", "query must not be empty"));
        }

        let timer = OperationTimer::start();
        let (corpus, documents) = self.resolve_scope(scope)?;

        let model = self.embedder.model_name();
        if let Some(doc) = documents.iter().find(|d| d.model != model) {
            let err = AppError::ModelMismatch {
                expected: doc.model.clone(),
                actual: model.to_string(),
            };
            error!(document_id = %doc.document_id, error = %err, "Query embedder does not match index");
            return Err(err);
        }

        let query_vector = with_timeout(self.settings.timeout, "embedder", self.embedder.embed(query)).await?;
        if let Some(expected) = corpus.dimension() {
            if query_vector.len() != expected {
                let err = AppError::DimensionMismatch {
                    expected,
                    actual: query_vector.len(),
                };
                error!(error = %err, "Query embedding dimensionality mismatch");
                return Err(err);
            }
        }

        let candidates = vector::score_documents(&documents, corpus.metric(), &query_vector, self.settings.min_score);
        let candidate_count = candidates.len();
        let chunks = vector::top_k(candidates, k);

        debug!(
            documents = documents.len(),
            candidates = candidate_count,
            returned = chunks.len(),
            min_score = self.settings.min_score,
            "Retrieval complete"
        );
        metrics::record_retrieval(timer.elapsed_secs(), &scope.corpus, chunks.len());

        Ok(RetrievalResult {
            query: query.to_string(),
            chunks,
        })
    }

    fn resolve_scope(
        &self,
        scope: &CorpusScope,
    ) -> Result<(Arc<medparse_ingestion::CorpusIndex>, Vec<Arc<DocumentIndex>>)> {
        let not_indexed = |what: String| AppError::NotIndexed { scope: what };

        let corpus = self
            .store
            .corpus(&scope.corpus)
            .ok_or_else(|| not_indexed(scope.corpus.clone()))?;

        let documents = match &scope.document_ids {
            None => corpus.snapshot_documents(),
            Some(ids) => {
                let mut selected = Vec::with_capacity(ids.len());
                for id in ids {
                    let doc = corpus
                        .get(id)
                        .ok_or_else(|| not_indexed(format!("{}/{}", scope.corpus, id)))?;
                    if !selected.iter().any(|d: &Arc<DocumentIndex>| d.document_id == doc.document_id) {
                        selected.push(doc);
                    }
                }
                selected
            }
        };

        if documents.is_empty() {
            return Err(not_indexed(scope.corpus.clone()));
        }
        Ok((corpus, documents))
    }
}
