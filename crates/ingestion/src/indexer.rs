//! Embedding indexer
//!
//! Chunks a document, embeds every chunk and publishes the result as one
//! immutable `DocumentIndex`. Nothing is published unless every chunk was
//! embedded successfully.

use crate::chunker::{chunk_document, ChunkingConfig};
use crate::index::{CorpusIndex, DocumentIndex, IndexedChunk, VectorStore};
use chrono::Utc;
use medparse_common::config::AppConfig;
use medparse_common::metrics::{self, OperationTimer};
use medparse_common::retry::with_timeout;
use medparse_common::{AppError, DistanceMetric, Document, Embedder, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Result of an index build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexHandle {
    pub corpus: String,
    pub document_id: String,
    pub fingerprint: String,
    pub generation: u64,
    pub chunk_count: usize,
    pub model: String,
    /// False when this call published nothing: the index was up to date or a newer build won
    pub rebuilt: bool,
}

impl IndexHandle {
    fn from_index(corpus: &CorpusIndex, index: &DocumentIndex, rebuilt: bool) -> Self {
        Self {
            corpus: corpus.name().to_string(),
            document_id: index.document_id.clone(),
            fingerprint: index.fingerprint.clone(),
            generation: index.generation,
            chunk_count: index.entries.len(),
            model: index.model.clone(),
            rebuilt,
        }
    }
}

/// Builds and publishes document indices
pub struct EmbeddingIndexer {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    chunking: ChunkingConfig,
    metric: DistanceMetric,
    batch_size: usize,
    timeout: Duration,
}

impl EmbeddingIndexer {
    pub fn new(
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
        chunking: ChunkingConfig,
        metric: DistanceMetric,
    ) -> Self {
        Self {
            store,
            embedder,
            chunking,
            metric,
            batch_size: 16,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        store: Arc<VectorStore>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let metric: DistanceMetric = config.embedding.metric.parse()?;
        Ok(Self::new(store, embedder, ChunkingConfig::from(&config.chunking), metric)
            .with_batch_size(config.embedding.batch_size)
            .with_timeout(config.embedding_timeout()))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Deadline for each embedding batch
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    /// Index a document unless an index for the same content and model exists
    pub async fn index(&self, corpus: &str, document: &Document) -> Result<IndexHandle> {
        self.build(corpus, document, false).await
    }

    /// Rebuild a document's index and swap it in atomically
    pub async fn reindex(&self, corpus: &str, document: &Document) -> Result<IndexHandle> {
        self.build(corpus, document, true).await
    }

    #[instrument(skip(self, document), fields(document_id = %document.id, fingerprint = %document.fingerprint))]
    async fn build(&self, corpus_name: &str, document: &Document, force: bool) -> Result<IndexHandle> {
        if document.is_blank() {
            return Err(AppError::EmptyDocument {
                id: document.id.clone(),
            });
        }

        let corpus = self.store.ensure_corpus(corpus_name, self.metric)?;
        let model = self.embedder.model_name().to_string();

        if !force {
            if let Some(existing) = corpus.get(&document.id) {
                if existing.fingerprint == document.fingerprint && existing.model == model {
                    debug!(generation = existing.generation, "Index up to date");
                    return Ok(IndexHandle::from_index(&corpus, &existing, false));
                }
            }
        }

        let generation = corpus.next_generation();
        let timer = OperationTimer::start();
        let chunks = chunk_document(document, &self.chunking);

        let embeddings = match self.embed_chunks(&chunks).await {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "Embedding failed, index not published");
                metrics::record_index_build(timer.elapsed_secs(), corpus_name, 0, "failed");
                return Err(e);
            }
        };

        if embeddings.len() != chunks.len() {
            metrics::record_index_build(timer.elapsed_secs(), corpus_name, 0, "failed");
            return Err(AppError::EmbeddingError {
                message: format!(
                    "provider returned {} vectors for {} chunks",
                    embeddings.len(),
                    chunks.len()
                ),
            });
        }

        let entries: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk { chunk, embedding })
            .collect();

        let index = DocumentIndex {
            document_id: document.id.clone(),
            fingerprint: document.fingerprint.clone(),
            model,
            generation,
            built_at: Utc::now(),
            entries,
        };

        let published = corpus.publish(index)?;
        if published.generation != generation {
            metrics::record_index_build(timer.elapsed_secs(), corpus_name, 0, "superseded");
            return Ok(IndexHandle::from_index(&corpus, &published, false));
        }
        metrics::record_index_build(
            timer.elapsed_secs(),
            corpus_name,
            published.entries.len(),
            "published",
        );

        info!(
            corpus = corpus_name,
            generation = published.generation,
            chunks = published.entries.len(),
            duration_ms = (timer.elapsed_secs() * 1000.0) as u64,
            "Document indexed"
        );

        Ok(IndexHandle::from_index(&corpus, &published, true))
    }

    async fn embed_chunks(&self, chunks: &[crate::chunker::Chunk]) -> Result<Vec<Vec<f32>>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut embeddings = Vec::with_capacity(texts.len());

        for batch in texts.chunks(self.batch_size) {
            let vectors = with_timeout(self.timeout, "embedder", self.embedder.embed_batch(batch)).await?;
            embeddings.extend(vectors);
        }

        Ok(embeddings)
    }
}
