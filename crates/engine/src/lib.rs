//! medparse engine
//!
//! Process-level facade over both flows:
//! - Retrieval: index documents, answer questions with citations
//! - Extraction: structured records, code mapping, interchange bundles
//! - Note assistant operations
//!
//! One `ClinicalPipeline` is created at startup and owns every component
//! and cache; `shutdown` persists its state when configured to.

pub mod pipeline;
pub mod request;
pub mod state;

pub use pipeline::{BundleReport, ClinicalPipeline, Collaborators};
pub use request::{AskRequest, AskResponse};
pub use state::StateSummary;
