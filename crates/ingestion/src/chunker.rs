//! Text chunking module
//!
//! Splits a document into overlapping passages for embedding. Each passage
//! records its byte span, the overlap it repeats from its predecessor, and
//! its non-overlapping core. Concatenating the cores in ordinal order gives
//! back the document text byte for byte.

use medparse_common::config::ChunkingSettings;
use medparse_common::Document;
use serde::{Deserialize, Serialize};
use text_splitter::{ChunkConfig, Characters, TextSplitter};
use tracing::{debug, warn};

/// Configuration for text chunking
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Maximum passage length in characters
    pub max_chars: usize,
    /// Fraction of a passage repeated at the start of the next one
    pub overlap_fraction: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1000,
            overlap_fraction: 0.2,
        }
    }
}

impl From<&ChunkingSettings> for ChunkingConfig {
    fn from(settings: &ChunkingSettings) -> Self {
        Self {
            max_chars: settings.max_chars,
            overlap_fraction: settings.effective_overlap(),
        }
    }
}

impl ChunkingConfig {
    fn window(&self) -> usize {
        self.max_chars.max(1)
    }

    /// Overlap in characters; always leaves room to advance
    fn overlap_chars(&self) -> usize {
        let fraction = self.overlap_fraction.clamp(0.0, 0.9) as f64;
        let overlap = (self.window() as f64 * fraction).floor() as usize;
        overlap.min(self.window() - 1)
    }

    /// Splitter settings; whitespace is kept so spans tile the text
    fn splitter(&self) -> TextSplitter<Characters> {
        let config = match ChunkConfig::new(self.window())
            .with_trim(false)
            .with_overlap(self.overlap_chars())
        {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, max_chars = self.window(), "Invalid chunk overlap, splitting without overlap");
                ChunkConfig::new(self.window()).with_trim(false)
            }
        };
        TextSplitter::new(config)
    }
}

/// A passage of a document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub document_id: String,
    /// Position of this chunk in the document, from 0
    pub ordinal: u32,
    pub text: String,
    /// Byte offset of the passage in the document
    pub start: usize,
    pub end: usize,
    /// Byte span not shared with the previous chunk
    pub core_start: usize,
    pub core_end: usize,
    /// Bytes repeated from the previous chunk
    pub overlap_with_previous: usize,
}

impl Chunk {
    /// Stable chunk identifier: `{document_id}#{ordinal}`
    pub fn id(&self) -> String {
        format!("{}#{}", self.document_id, self.ordinal)
    }

    /// The non-overlapping part of the passage
    pub fn core(&self) -> &str {
        &self.text[self.core_start - self.start..self.core_end - self.start]
    }
}

/// Split a document into overlapping chunks.
///
/// Empty text yields no chunks; text that fits in one window yields exactly
/// one chunk equal to the whole text. Passages follow semantic boundaries
/// (sentences, then words, then characters) as chosen by the splitter.
pub fn chunk_document(document: &Document, config: &ChunkingConfig) -> Vec<Chunk> {
    let text = document.text.as_str();
    if text.is_empty() {
        return Vec::new();
    }

    let splitter = config.splitter();
    let mut chunks: Vec<Chunk> = Vec::new();
    let mut prev_end = 0usize;

    for (offset, piece) in splitter.chunk_indices(text) {
        let end = offset + piece.len();
        if end <= prev_end {
            continue;
        }
        // A gap left by the splitter is folded into this passage.
        let start = offset.min(prev_end);

        chunks.push(Chunk {
            document_id: document.id.clone(),
            ordinal: chunks.len() as u32,
            text: text[start..end].to_string(),
            start,
            end,
            core_start: prev_end,
            core_end: end,
            overlap_with_previous: prev_end - start,
        });
        prev_end = end;
    }

    // Trailing text the splitter did not emit belongs to the last passage.
    if prev_end < text.len() {
        if let Some(last) = chunks.last_mut() {
            last.text.push_str(&text[prev_end..]);
            last.end = text.len();
            last.core_end = text.len();
        }
    }

    debug!(
        document_id = %document.id,
        input_len = text.len(),
        chunk_count = chunks.len(),
        max_chars = config.window(),
        overlap_chars = config.overlap_chars(),
        "Text chunked"
    );

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_chars: usize, overlap_fraction: f32) -> ChunkingConfig {
        ChunkingConfig {
            max_chars,
            overlap_fraction,
        }
    }

    fn reconstruct(chunks: &[Chunk]) -> String {
        chunks.iter().map(|c| c.core()).collect()
    }

    #[test]
    fn test_empty_text() {
        let doc = Document::new("empty", "");
        assert!(chunk_document(&doc, &ChunkingConfig::default()).is_empty());
    }

    #[test]
    fn test_short_document_is_single_chunk() {
        let doc = Document::new("short", "Pt presents with knee pain.");
        let chunks = chunk_document(&doc, &ChunkingConfig::default());
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, doc.text);
        assert_eq!(chunks[0].overlap_with_previous, 0);
        assert_eq!(chunks[0].id(), "short#0");
    }

    #[test]
    fn test_cores_reconstruct_text() {
        let samples = [
            "This is a test. ".repeat(100),
            "Sentence one. Sentence two. Sentence three. Sentence four. Sentence five.".to_string(),
            "x".repeat(537),
            "Température 38,5 °C — patiënt klaagt over hoofdpijn. ".repeat(20),
            "BP 140/90\nHR 88\nRR 16\n\n".repeat(40),
        ];

        for text in samples.iter() {
            for (max, frac) in [(30, 0.2), (64, 0.0), (100, 0.5), (7, 0.9), (1, 0.2)] {
                let doc = Document::new("d", text.as_str());
                let chunks = chunk_document(&doc, &config(max, frac));
                assert_eq!(&reconstruct(&chunks), text, "max={} frac={}", max, frac);
            }
        }
    }

    #[test]
    fn test_chunks_respect_window_and_spans() {
        let text = "Sentence one. Sentence two. Sentence three. Sentence four. Sentence five.";
        let doc = Document::new("d", text);
        let chunks = chunk_document(&doc, &config(30, 0.2));

        assert!(chunks.len() >= 2);
        assert_eq!(chunks[0].core_start, 0);
        assert_eq!(chunks.last().unwrap().end, text.len());
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.ordinal as usize, i);
            assert!(chunk.text.chars().count() <= 30);
            assert_eq!(&text[chunk.start..chunk.end], chunk.text);
            assert_eq!(chunk.overlap_with_previous, chunk.core_start - chunk.start);
            if i > 0 {
                assert_eq!(chunk.core_start, chunks[i - 1].core_end);
            }
        }
    }

    #[test]
    fn test_overlap_repeats_previous_text() {
        let text = "word ".repeat(40);
        let doc = Document::new("d", text.as_str());
        let chunks = chunk_document(&doc, &config(30, 0.2));

        assert!(chunks.len() >= 2);
        assert!(chunks.iter().skip(1).any(|c| c.overlap_with_previous > 0));
        for pair in chunks.windows(2) {
            let shared = &text[pair[1].start..pair[1].core_start];
            assert!(pair[0].text.ends_with(shared));
            assert!(pair[1].overlap_with_previous <= 6);
        }
    }

    #[test]
    fn test_without_overlap_chunks_tile_the_text() {
        let text = "word ".repeat(40);
        let doc = Document::new("d", text.as_str());
        let chunks = chunk_document(&doc, &config(30, 0.0));

        assert!(chunks.iter().all(|c| c.overlap_with_previous == 0));
        let joined: String = chunks.iter().map(|c| c.text.as_str()).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn test_prefers_sentence_boundaries() {
        let text = "Knee pain noted. Ibuprofen 600mg prescribed. Follow up in two weeks.";
        let doc = Document::new("d", text);
        let chunks = chunk_document(&doc, &config(20, 0.0));
        assert_eq!(chunks[0].text.trim_end(), "Knee pain noted.");
    }

    #[test]
    fn test_chunking_is_idempotent() {
        let doc = Document::new("d", "Lorem ipsum dolor sit amet. ".repeat(50));
        let cfg = config(120, 0.25);
        assert_eq!(chunk_document(&doc, &cfg), chunk_document(&doc, &cfg));
    }
}
