//! medparse search
//!
//! Query side of the retrieval flow:
//! - Similarity retrieval over published document indices
//! - Cited answer synthesis with a safe insufficient-evidence fallback

pub mod retrieval;
pub mod synthesizer;

pub use retrieval::{CorpusScope, RetrievalEngine, RetrievalResult, RetrievalSettings, ScoredChunk};
pub use synthesizer::{Answer, AnswerSynthesizer, Citation, SynthesisSettings, INSUFFICIENT_EVIDENCE};
