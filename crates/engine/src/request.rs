//! Request and response types of the pipeline facade

use medparse_common::AppError;
use medparse_search::{Answer, ScoredChunk};
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Question against an indexed corpus
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct AskRequest {
    #[validate(length(min = 1, max = 2000))]
    pub query: String,

    /// Chunks to retrieve; the configured default when absent
    #[validate(range(min = 1, max = 50))]
    #[serde(default)]
    pub top_k: Option<usize>,

    /// Corpus to search; the configured default when absent
    #[serde(default)]
    pub corpus: Option<String>,

    /// Restrict the search to these documents
    #[serde(default)]
    pub document_ids: Option<Vec<String>>,
}

impl AskRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            top_k: None,
            corpus: None,
            document_ids: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_corpus(mut self, corpus: impl Into<String>) -> Self {
        self.corpus = Some(corpus.into());
        self
    }

    pub fn with_documents<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub(crate) fn check(&self) -> Result<(), AppError> {
        self.validate().map_err(|e| AppError::Validation {
            message: e.to_string(),
            field: e.field_errors().keys().next().map(|k| k.to_string()),
        })
    }
}

/// Cited answer with the chunks it was built from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskResponse {
    pub query: String,
    pub corpus: String,
    pub answer: Answer,
    pub retrieved: Vec<ScoredChunk>,
    pub processing_time_ms: u64,
}
