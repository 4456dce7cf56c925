//! In-process vector store
//!
//! A `VectorStore` holds named corpora. Each corpus fixes its distance metric
//! when it is created and its dimensionality on first publication. A
//! document's entries live in one immutable `DocumentIndex` behind an `Arc`;
//! rebuilding swaps that `Arc` in a single write, so readers see either the
//! old set or the new one.

use crate::chunker::Chunk;
use chrono::{DateTime, Utc};
use medparse_common::{AppError, DistanceMetric, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{error, info, warn};

/// One chunk and its embedding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// Complete, immutable index of one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentIndex {
    pub document_id: String,
    pub fingerprint: String,
    pub model: String,
    /// Increases with every publication in the corpus
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    pub entries: Vec<IndexedChunk>,
}

impl DocumentIndex {
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.embedding.len())
    }
}

/// Serializable form of a corpus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusSnapshot {
    pub name: String,
    pub metric: DistanceMetric,
    pub dimension: Option<usize>,
    pub generation: u64,
    pub documents: Vec<DocumentIndex>,
}

/// Documents indexed under one metric and dimensionality
#[derive(Debug)]
pub struct CorpusIndex {
    name: String,
    metric: DistanceMetric,
    dimension: RwLock<Option<usize>>,
    generation: AtomicU64,
    documents: RwLock<HashMap<String, Arc<DocumentIndex>>>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|p| p.into_inner())
}

impl CorpusIndex {
    pub fn new(name: &str, metric: DistanceMetric) -> Self {
        Self {
            name: name.to_string(),
            metric,
            dimension: RwLock::new(None),
            generation: AtomicU64::new(0),
            documents: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metric(&self) -> DistanceMetric {
        self.metric
    }

    /// Dimensionality shared by every vector in the corpus, once known
    pub fn dimension(&self) -> Option<usize> {
        *read(&self.dimension)
    }

    /// Generation number for a build that is starting
    pub fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish a fully built document index, replacing any previous one.
    ///
    /// Every vector must share the corpus dimensionality; a mismatch is a
    /// defect and nothing is published. A build whose generation is older
    /// than the live index lost a race with a later build; the live index
    /// is kept and returned.
    pub fn publish(&self, index: DocumentIndex) -> Result<Arc<DocumentIndex>> {
        {
            let mut dimension = write(&self.dimension);
            let expected = match (*dimension, index.dimension()) {
                (Some(d), _) => Some(d),
                (None, d) => d,
            };
            if let Some(expected) = expected {
                if let Some(bad) = index.entries.iter().find(|e| e.embedding.len() != expected) {
                    let err = AppError::DimensionMismatch {
                        expected,
                        actual: bad.embedding.len(),
                    };
                    error!(corpus = %self.name, document_id = %index.document_id, error = %err, "Refusing to publish index");
                    return Err(err);
                }
                *dimension = Some(expected);
            }
        }

        let index = Arc::new(index);
        let previous = {
            let mut documents = write(&self.documents);
            if let Some(live) = documents.get(&index.document_id) {
                if live.generation > index.generation {
                    warn!(
                        corpus = %self.name,
                        document_id = %index.document_id,
                        generation = index.generation,
                        live_generation = live.generation,
                        "Discarding superseded index build"
                    );
                    return Ok(live.clone());
                }
            }
            documents.insert(index.document_id.clone(), index.clone())
        };

        info!(
            corpus = %self.name,
            document_id = %index.document_id,
            generation = index.generation,
            chunks = index.entries.len(),
            replaced = previous.is_some(),
            "Document index published"
        );
        Ok(index)
    }

    pub fn get(&self, document_id: &str) -> Option<Arc<DocumentIndex>> {
        read(&self.documents).get(document_id).cloned()
    }

    pub fn remove(&self, document_id: &str) -> bool {
        write(&self.documents).remove(document_id).is_some()
    }

    /// Consistent view of every document index, ordered by document id
    pub fn snapshot_documents(&self) -> Vec<Arc<DocumentIndex>> {
        let documents = read(&self.documents);
        let mut out: Vec<_> = documents.values().cloned().collect();
        out.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        out
    }

    pub fn document_ids(&self) -> Vec<String> {
        self.snapshot_documents()
            .iter()
            .map(|d| d.document_id.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        read(&self.documents).is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        read(&self.documents).values().map(|d| d.entries.len()).sum()
    }

    pub fn to_snapshot(&self) -> CorpusSnapshot {
        CorpusSnapshot {
            name: self.name.clone(),
            metric: self.metric,
            dimension: self.dimension(),
            generation: self.generation.load(Ordering::SeqCst),
            documents: self
                .snapshot_documents()
                .iter()
                .map(|d| d.as_ref().clone())
                .collect(),
        }
    }

    pub fn from_snapshot(snapshot: CorpusSnapshot) -> Result<Self> {
        let corpus = Self::new(&snapshot.name, snapshot.metric);
        *write(&corpus.dimension) = snapshot.dimension;
        corpus.generation.store(snapshot.generation, Ordering::SeqCst);
        for document in snapshot.documents {
            corpus.publish(document)?;
        }
        Ok(corpus)
    }
}

/// Registry of named corpora
#[derive(Default)]
pub struct VectorStore {
    corpora: RwLock<BTreeMap<String, Arc<CorpusIndex>>>,
}

impl VectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn corpus(&self, name: &str) -> Option<Arc<CorpusIndex>> {
        read(&self.corpora).get(name).cloned()
    }

    /// Get or create a corpus; an existing corpus must use the same metric
    pub fn ensure_corpus(&self, name: &str, metric: DistanceMetric) -> Result<Arc<CorpusIndex>> {
        let mut corpora = write(&self.corpora);
        let corpus = corpora
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CorpusIndex::new(name, metric)))
            .clone();

        if corpus.metric() != metric {
            let err = AppError::MetricMismatch {
                expected: corpus.metric().to_string(),
                actual: metric.to_string(),
            };
            error!(corpus = name, error = %err, "Distance metric mismatch");
            return Err(err);
        }
        Ok(corpus)
    }

    pub fn corpus_names(&self) -> Vec<String> {
        read(&self.corpora).keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<CorpusSnapshot> {
        read(&self.corpora)
            .values()
            .map(|c| c.to_snapshot())
            .collect()
    }

    pub fn restore(&self, snapshots: Vec<CorpusSnapshot>) -> Result<usize> {
        let mut restored = 0;
        for snapshot in snapshots {
            let corpus = CorpusIndex::from_snapshot(snapshot)?;
            restored += 1;
            write(&self.corpora).insert(corpus.name().to_string(), Arc::new(corpus));
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, ordinal: u32) -> Chunk {
        Chunk {
            document_id: doc.to_string(),
            ordinal,
            text: format!("chunk {}", ordinal),
            start: 0,
            end: 7,
            core_start: 0,
            core_end: 7,
            overlap_with_previous: 0,
        }
    }

    fn document(corpus: &CorpusIndex, doc: &str, dims: &[usize]) -> DocumentIndex {
        DocumentIndex {
            document_id: doc.to_string(),
            fingerprint: "fp".to_string(),
            model: "m".to_string(),
            generation: corpus.next_generation(),
            built_at: Utc::now(),
            entries: dims
                .iter()
                .enumerate()
                .map(|(i, d)| IndexedChunk {
                    chunk: chunk(doc, i as u32),
                    embedding: vec![0.5; *d],
                })
                .collect(),
        }
    }

    #[test]
    fn test_publish_fixes_dimension() {
        let corpus = CorpusIndex::new("c", DistanceMetric::Cosine);
        corpus.publish(document(&corpus, "a", &[4, 4])).unwrap();
        assert_eq!(corpus.dimension(), Some(4));

        let err = corpus.publish(document(&corpus, "b", &[3])).unwrap_err();
        assert!(matches!(err, AppError::DimensionMismatch { expected: 4, actual: 3 }));
        assert!(corpus.get("b").is_none());
    }

    #[test]
    fn test_mixed_dimensions_within_document_rejected() {
        let corpus = CorpusIndex::new("c", DistanceMetric::Cosine);
        assert!(corpus.publish(document(&corpus, "a", &[4, 5])).is_err());
        assert!(corpus.is_empty());
    }

    #[test]
    fn test_republish_replaces_whole_document() {
        let corpus = CorpusIndex::new("c", DistanceMetric::Cosine);
        let first = corpus.publish(document(&corpus, "a", &[2, 2, 2])).unwrap();
        let held = corpus.get("a").unwrap();

        let second = corpus.publish(document(&corpus, "a", &[2])).unwrap();
        assert!(second.generation > first.generation);
        assert_eq!(corpus.get("a").unwrap().entries.len(), 1);
        // A reader holding the old Arc keeps a complete old view.
        assert_eq!(held.entries.len(), 3);
        assert_eq!(corpus.chunk_count(), 1);
    }

    #[test]
    fn test_older_build_never_replaces_newer() {
        let corpus = CorpusIndex::new("c", DistanceMetric::Cosine);
        let older = document(&corpus, "a", &[2, 2]);
        let newer = document(&corpus, "a", &[2]);

        corpus.publish(newer).unwrap();
        let kept = corpus.publish(older).unwrap();
        assert_eq!(kept.entries.len(), 1);
        assert_eq!(corpus.get("a").unwrap().generation, kept.generation);
        assert_eq!(corpus.chunk_count(), 1);
    }

    #[test]
    fn test_metric_fixed_per_corpus() {
        let store = VectorStore::new();
        store.ensure_corpus("notes", DistanceMetric::Cosine).unwrap();
        let err = store
            .ensure_corpus("notes", DistanceMetric::InnerProduct)
            .unwrap_err();
        assert!(err.is_defect());
    }

    #[test]
    fn test_snapshot_restore() {
        let store = VectorStore::new();
        let corpus = store.ensure_corpus("notes", DistanceMetric::Cosine).unwrap();
        corpus.publish(document(&corpus, "a", &[3, 3])).unwrap();

        let json = serde_json::to_string(&store.snapshot()).unwrap();
        let restored = VectorStore::new();
        assert_eq!(restored.restore(serde_json::from_str(&json).unwrap()).unwrap(), 1);

        let corpus = restored.corpus("notes").unwrap();
        assert_eq!(corpus.dimension(), Some(3));
        assert_eq!(corpus.document_ids(), vec!["a"]);
        assert!(corpus.next_generation() > 1);
    }
}
