//! medparse Common Library
//!
//! Shared code for all medparse crates including:
//! - Error taxonomy and result alias
//! - Configuration management
//! - Content-addressed coalescing cache
//! - Embedding provider abstraction
//! - Generative text backend abstraction
//! - Bounded retry state machine
//! - Document model and document stores
//! - Metrics helpers

pub mod cache;
pub mod config;
pub mod documents;
pub mod embeddings;
pub mod errors;
pub mod llm;
pub mod metrics;
pub mod retry;

// Re-export commonly used types
pub use cache::{CacheKey, CoalescingCache, OperationKind};
pub use config::AppConfig;
pub use documents::{Document, DocumentStore};
pub use embeddings::{DistanceMetric, Embedder};
pub use errors::{AppError, ErrorKind, Result};
pub use llm::{GenerationConstraints, TextGenerator};
pub use retry::RetryPolicy;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
