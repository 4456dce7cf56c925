//! Brute-force vector similarity over published document indices

use super::ScoredChunk;
use medparse_common::DistanceMetric;
use medparse_ingestion::DocumentIndex;
use std::cmp::Ordering;
use std::sync::Arc;

/// Score every chunk of `documents` against `query`, keeping those at or above `min_score`
pub(crate) fn score_documents(
    documents: &[Arc<DocumentIndex>],
    metric: DistanceMetric,
    query: &[f32],
    min_score: f32,
) -> Vec<ScoredChunk> {
    documents
        .iter()
        .flat_map(|doc| {
            doc.entries.iter().map(move |entry| ScoredChunk {
                chunk_id: entry.chunk.id(),
                document_id: doc.document_id.clone(),
                ordinal: entry.chunk.ordinal,
                text: entry.chunk.text.clone(),
                score: metric.score(query, &entry.embedding),
                generation: doc.generation,
            })
        })
        .filter(|c| c.score >= min_score)
        .collect()
}

/// Descending score; ties by (document id, ordinal) ascending
pub(crate) fn compare(a: &ScoredChunk, b: &ScoredChunk) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.document_id.cmp(&b.document_id))
        .then_with(|| a.ordinal.cmp(&b.ordinal))
}

/// Sort and keep the best `k`
pub(crate) fn top_k(mut chunks: Vec<ScoredChunk>, k: usize) -> Vec<ScoredChunk> {
    chunks.sort_by(compare);
    chunks.truncate(k);
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scored(doc: &str, ordinal: u32, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: format!("{}#{}", doc, ordinal),
            document_id: doc.to_string(),
            ordinal,
            text: String::new(),
            score,
            generation: 1,
        }
    }

    #[test]
    fn test_ties_break_by_document_then_ordinal() {
        let ranked = top_k(
            vec![
                scored("b", 0, 0.9),
                scored("a", 2, 0.9),
                scored("a", 1, 0.9),
                scored("c", 0, 0.95),
                scored("a", 0, 0.1),
            ],
            4,
        );
        let ids: Vec<_> = ranked.iter().map(|c| c.chunk_id.as_str()).collect();
        assert_eq!(ids, vec!["c#0", "a#1", "a#2", "b#0"]);
    }

    #[test]
    fn test_top_k_larger_than_input() {
        let ranked = top_k(vec![scored("a", 0, 0.5), scored("a", 1, 0.7)], 10);
        assert_eq!(ranked.len(), 2);
        assert!(ranked[0].score >= ranked[1].score);
    }
}
