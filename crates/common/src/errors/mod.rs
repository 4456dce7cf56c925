//! Error types for medparse
//!
//! Provides a closed error taxonomy with:
//! - Distinct variants for each failure mode
//! - A four-way kind classification (input, transient, invariant, internal)
//! - Retry and defect predicates used by the retry state machine
//! - Error codes for machine-readable identification

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Coarse classification callers branch on
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad request: unknown document, empty text, invalid parameters, missing index
    Input,
    /// Backend trouble that may succeed on another attempt
    Transient,
    /// A broken internal invariant; always a bug
    Invariant,
    /// Configuration, serialization and everything else
    Internal,
}

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Input errors (1xxx)
    ValidationError,
    DocumentNotFound,
    EmptyDocument,
    NotIndexed,

    // Transient backend errors (8xxx)
    BackendTimeout,
    RateLimited,
    UpstreamError,
    MalformedOutput,
    EmbeddingError,
    BackendUnavailable,

    // Invariant violations (5xxx)
    DimensionMismatch,
    MetricMismatch,
    ModelMismatch,
    DanglingReference,
    DuplicateResourceId,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Input (1xxx)
            ErrorCode::ValidationError => 1001,
            ErrorCode::DocumentNotFound => 1002,
            ErrorCode::EmptyDocument => 1003,
            ErrorCode::NotIndexed => 1004,

            // Invariants (5xxx)
            ErrorCode::DimensionMismatch => 5001,
            ErrorCode::MetricMismatch => 5002,
            ErrorCode::ModelMismatch => 5003,
            ErrorCode::DanglingReference => 5004,
            ErrorCode::DuplicateResourceId => 5005,

            // Backends (8xxx)
            ErrorCode::BackendTimeout => 8001,
            ErrorCode::RateLimited => 8002,
            ErrorCode::UpstreamError => 8003,
            ErrorCode::MalformedOutput => 8004,
            ErrorCode::EmbeddingError => 8005,
            ErrorCode::BackendUnavailable => 8006,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }

    /// Stable snake_case name, safe to hand to callers
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::DocumentNotFound => "document_not_found",
            ErrorCode::EmptyDocument => "empty_document",
            ErrorCode::NotIndexed => "not_indexed",
            ErrorCode::BackendTimeout => "backend_timeout",
            ErrorCode::RateLimited => "rate_limited",
            ErrorCode::UpstreamError => "upstream_error",
            ErrorCode::MalformedOutput => "malformed_output",
            ErrorCode::EmbeddingError => "embedding_error",
            ErrorCode::BackendUnavailable => "backend_unavailable",
            ErrorCode::DimensionMismatch => "dimension_mismatch",
            ErrorCode::MetricMismatch => "metric_mismatch",
            ErrorCode::ModelMismatch => "model_mismatch",
            ErrorCode::DanglingReference => "dangling_reference",
            ErrorCode::DuplicateResourceId => "duplicate_resource_id",
            ErrorCode::InternalError => "internal_error",
            ErrorCode::ConfigurationError => "configuration_error",
            ErrorCode::SerializationError => "serialization_error",
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Input errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Document not found: {id}")]
    DocumentNotFound { id: String },

    #[error("Document {id} has no text")]
    EmptyDocument { id: String },

    #[error("Corpus scope not indexed: {scope}")]
    NotIndexed { scope: String },

    // Transient backend errors
    #[error("{service} timed out after {timeout_ms}ms")]
    BackendTimeout { service: String, timeout_ms: u64 },

    #[error("{service} rate limit exceeded")]
    RateLimited { service: String },

    #[error("{service} request failed: {message}")]
    Upstream { service: String, message: String },

    #[error("Malformed generative output: {message}")]
    MalformedOutput { message: String },

    #[error("Embedding service error: {message}")]
    EmbeddingError { message: String },

    #[error("{service} unavailable after {attempts} attempts")]
    BackendUnavailable { service: String, attempts: u32 },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Invariant violations
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Distance metric mismatch: corpus uses {expected}, got {actual}")]
    MetricMismatch { expected: String, actual: String },

    #[error("Embedding model mismatch: index built with {expected}, query uses {actual}")]
    ModelMismatch { expected: String, actual: String },

    #[error("Dangling reference {reference} in resource {source_id}")]
    DanglingReference { source_id: String, reference: String },

    #[error("Duplicate resource id in bundle: {id}")]
    DuplicateResourceId { id: String },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::DocumentNotFound { .. } => ErrorCode::DocumentNotFound,
            AppError::EmptyDocument { .. } => ErrorCode::EmptyDocument,
            AppError::NotIndexed { .. } => ErrorCode::NotIndexed,
            AppError::BackendTimeout { .. } => ErrorCode::BackendTimeout,
            AppError::RateLimited { .. } => ErrorCode::RateLimited,
            AppError::Upstream { .. } => ErrorCode::UpstreamError,
            AppError::MalformedOutput { .. } => ErrorCode::MalformedOutput,
            AppError::EmbeddingError { .. } => ErrorCode::EmbeddingError,
            AppError::BackendUnavailable { .. } => ErrorCode::BackendUnavailable,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::DimensionMismatch { .. } => ErrorCode::DimensionMismatch,
            AppError::MetricMismatch { .. } => ErrorCode::MetricMismatch,
            AppError::ModelMismatch { .. } => ErrorCode::ModelMismatch,
            AppError::DanglingReference { .. } => ErrorCode::DanglingReference,
            AppError::DuplicateResourceId { .. } => ErrorCode::DuplicateResourceId,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Classify the error into one of the four kinds
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation { .. }
            | AppError::DocumentNotFound { .. }
            | AppError::EmptyDocument { .. }
            | AppError::NotIndexed { .. } => ErrorKind::Input,

            AppError::BackendTimeout { .. }
            | AppError::RateLimited { .. }
            | AppError::Upstream { .. }
            | AppError::MalformedOutput { .. }
            | AppError::EmbeddingError { .. }
            | AppError::BackendUnavailable { .. }
            | AppError::HttpClient(_) => ErrorKind::Transient,

            AppError::DimensionMismatch { .. }
            | AppError::MetricMismatch { .. }
            | AppError::ModelMismatch { .. }
            | AppError::DanglingReference { .. }
            | AppError::DuplicateResourceId { .. } => ErrorKind::Invariant,

            AppError::Internal { .. }
            | AppError::Configuration { .. }
            | AppError::Serialization(_)
            | AppError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Whether this error indicates a bug rather than bad input or a flaky backend
    pub fn is_defect(&self) -> bool {
        self.kind() == ErrorKind::Invariant
    }

    /// Build a validation error for a named field
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        AppError::Validation {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string(),
        }
    }
}
