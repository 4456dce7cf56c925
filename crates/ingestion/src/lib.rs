//! medparse ingestion
//!
//! Build phase of the retrieval flow:
//! 1. Split a document into overlapping passages
//! 2. Embed every passage
//! 3. Publish the document's index into its corpus in one atomic swap

pub mod chunker;
pub mod index;
pub mod indexer;

pub use chunker::{chunk_document, Chunk, ChunkingConfig};
pub use index::{CorpusIndex, CorpusSnapshot, DocumentIndex, IndexedChunk, VectorStore};
pub use indexer::{EmbeddingIndexer, IndexHandle};
