//! Configuration management for medparse
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values
//!
//! Every section has per-field defaults, so an empty configuration is valid.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    /// Document source
    pub documents: DocumentsConfig,

    /// Passage splitting
    pub chunking: ChunkingSettings,

    /// Embedding provider
    pub embedding: EmbeddingConfig,

    /// Generative text backend
    pub llm: LlmConfig,

    /// Similarity retrieval
    pub retrieval: RetrievalConfig,

    /// Answer synthesis
    pub synthesis: SynthesisConfig,

    /// Structured extraction
    pub extraction: ExtractionConfig,

    /// Terminology lookups
    pub terminology: TerminologyConfig,

    /// Index and cache persistence
    pub persistence: PersistenceConfig,

    /// Observability configuration
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DocumentsConfig {
    /// Directory holding `<document_id>.txt` files
    #[serde(default = "default_documents_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingSettings {
    /// Maximum passage length in characters
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,

    /// Fraction of a passage repeated at the start of the next one
    #[serde(default = "default_overlap_fraction")]
    pub overlap_fraction: f32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, hashing
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension (hashing provider)
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Distance metric: cosine, inner_product
    #[serde(default = "default_metric")]
    pub metric: String,

    /// Request timeout in seconds
    #[serde(default = "default_embedding_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries
    #[serde(default = "default_embedding_retries")]
    pub max_retries: u32,

    /// Batch size for embedding requests
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LlmConfig {
    /// Generative provider: openai, scripted
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    /// API key for the generative backend
    pub api_key: Option<String>,

    /// Chat completions endpoint base
    pub endpoint: Option<String>,

    /// Model to use
    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// Per-call timeout in seconds
    #[serde(default = "default_llm_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Corpus used when a request names none
    #[serde(default = "default_corpus")]
    pub default_corpus: String,

    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Results scoring below this floor are dropped
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    /// Query embedding timeout in seconds
    #[serde(default = "default_retrieval_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SynthesisConfig {
    /// Character budget for the numbered context block
    #[serde(default = "default_context_budget")]
    pub context_char_budget: usize,

    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExtractionConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Bumped whenever the extraction prompt or schema changes; part of the cache key
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TerminologyConfig {
    /// ICD-10-CM search endpoint (NLM Clinical Tables)
    #[serde(default = "default_icd10_url")]
    pub icd10_url: String,

    /// RxNav REST base
    #[serde(default = "default_rxnorm_url")]
    pub rxnorm_url: String,

    #[serde(default = "default_terminology_timeout")]
    pub timeout_secs: u64,

    /// Candidates requested per lookup
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Outbound lookups per second
    #[serde(default = "default_terminology_rps")]
    pub requests_per_second: u32,

    /// Consult the curated table when the service fails or finds nothing
    #[serde(default = "default_enabled")]
    pub use_fallback_table: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PersistenceConfig {
    /// Directory holding the index and cache snapshots; unset disables persistence
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default)]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default)]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_documents_root() -> PathBuf { PathBuf::from("documents") }
fn default_max_chars() -> usize { 1000 }
fn default_overlap_fraction() -> f32 { 0.2 }
fn default_embedding_provider() -> String { "hashing".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 256 }
fn default_metric() -> String { "cosine".to_string() }
fn default_embedding_timeout() -> u64 { 30 }
fn default_embedding_retries() -> u32 { 3 }
fn default_batch_size() -> usize { 16 }
fn default_llm_provider() -> String { "openai".to_string() }
fn default_llm_model() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 1024 }
fn default_llm_timeout() -> u64 { 30 }
fn default_corpus() -> String { "default".to_string() }
fn default_top_k() -> usize { 3 }
fn default_min_score() -> f32 { 0.7 }
fn default_retrieval_timeout() -> u64 { 15 }
fn default_context_budget() -> usize { 6000 }
fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 250 }
fn default_max_backoff() -> u64 { 4000 }
fn default_schema_version() -> u32 { 1 }
fn default_icd10_url() -> String { "https://clinicaltables.nlm.nih.gov/api/icd10cm/v3/search".to_string() }
fn default_rxnorm_url() -> String { "https://rxnav.nlm.nih.gov/REST".to_string() }
fn default_terminology_timeout() -> u64 { 10 }
fn default_max_candidates() -> usize { 5 }
fn default_terminology_rps() -> u32 { 2 }
fn default_enabled() -> bool { true }
fn default_log_level() -> String { "info".to_string() }
fn default_service_name() -> String { "medparse".to_string() }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // e.g., APP__RETRIEVAL__MIN_SCORE=0.5
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific file, still honouring environment overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding.timeout_secs)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm.timeout_secs)
    }

    pub fn retrieval_timeout(&self) -> Duration {
        Duration::from_secs(self.retrieval.timeout_secs)
    }

    pub fn terminology_timeout(&self) -> Duration {
        Duration::from_secs(self.terminology.timeout_secs)
    }
}

impl ChunkingSettings {
    /// Overlap fraction clamped to a range that always makes progress
    pub fn effective_overlap(&self) -> f32 {
        self.overlap_fraction.clamp(0.0, 0.9)
    }
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            root: default_documents_root(),
        }
    }
}

impl Default for ChunkingSettings {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            overlap_fraction: default_overlap_fraction(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            metric: default_metric(),
            timeout_secs: default_embedding_timeout(),
            max_retries: default_embedding_retries(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_llm_provider(),
            api_key: None,
            endpoint: None,
            model: default_llm_model(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
            timeout_secs: default_llm_timeout(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_corpus: default_corpus(),
            default_top_k: default_top_k(),
            min_score: default_min_score(),
            timeout_secs: default_retrieval_timeout(),
        }
    }
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            context_char_budget: default_context_budget(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            schema_version: default_schema_version(),
        }
    }
}

impl Default for TerminologyConfig {
    fn default() -> Self {
        Self {
            icd10_url: default_icd10_url(),
            rxnorm_url: default_rxnorm_url(),
            timeout_secs: default_terminology_timeout(),
            max_candidates: default_max_candidates(),
            requests_per_second: default_terminology_rps(),
            use_fallback_table: default_enabled(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: false,
            metrics_port: 0,
            service_name: default_service_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.chunking.max_chars, 1000);
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.retrieval.default_top_k, 3);
        assert!((config.retrieval.min_score - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.observability.service_name, "medparse");
    }

    #[test]
    fn test_empty_source_deserializes_to_defaults() {
        let config: AppConfig = Config::builder()
            .build()
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(config.extraction.max_attempts, 3);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert!(config.persistence.state_dir.is_none());
    }

    #[test]
    fn test_overlap_is_clamped() {
        let settings = ChunkingSettings {
            max_chars: 100,
            overlap_fraction: 1.5,
        };
        assert!((settings.effective_overlap() - 0.9).abs() < f32::EPSILON);
    }

    #[test]
    fn test_timeouts() {
        let config = AppConfig::default();
        assert_eq!(config.llm_timeout(), Duration::from_secs(30));
        assert_eq!(config.terminology_timeout(), Duration::from_secs(10));
    }
}
