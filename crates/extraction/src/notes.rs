//! Note assistant: summary, patient overview and plain-language rewrite
//!
//! Free-text operations over a whole note. Unlike extraction there is no
//! partial result to fall back to, so exhaustion surfaces as `BackendUnavailable`.

use chrono::{DateTime, Utc};
use medparse_common::config::AppConfig;
use medparse_common::retry::with_timeout;
use medparse_common::{
    AppError, CacheKey, CoalescingCache, Document, GenerationConstraints, OperationKind, Result, RetryPolicy,
    TextGenerator,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteOperation {
    Summarize,
    PatientInfo,
    Simplify,
}

impl NoteOperation {
    pub fn kind(&self) -> OperationKind {
        match self {
            NoteOperation::Summarize => OperationKind::Summarize,
            NoteOperation::PatientInfo => OperationKind::PatientInfo,
            NoteOperation::Simplify => OperationKind::Simplify,
        }
    }

    fn prompt(&self, note: &str) -> String {
        match self {
            NoteOperation::Summarize => format!(
                "You are a medical professional assistant.\n\
                 Summarize the following medical note in a concise but comprehensive way.\n\
                 Include the most important clinical information.\n\n\
                 Medical Note:\n{}\n\nSummary:",
                note
            ),
            NoteOperation::PatientInfo => format!(
                "You are a medical professional assistant.\n\
                 Extract and list the key patient information from the following medical note.\n\
                 Include demographics, vital signs, diagnoses, and treatment plan.\n\
                 Format the output in a structured way.\n\n\
                 Medical Note:\n{}\n\nKey Patient Information:",
                note
            ),
            NoteOperation::Simplify => format!(
                "You are a medical professional who excels at explaining complex medical information in simple terms.\n\
                 Rewrite the following medical note in language that a patient with no medical background could easily understand.\n\
                 Avoid jargon, use plain language, and focus on what the patient needs to know.\n\n\
                 Medical Note:\n{}\n\nPatient-Friendly Version:",
                note
            ),
        }
    }
}

impl fmt::Display for NoteOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind().as_str())
    }
}

impl FromStr for NoteOperation {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "summarize" | "summary" => Ok(NoteOperation::Summarize),
            "patient_info" => Ok(NoteOperation::PatientInfo),
            "simplify" => Ok(NoteOperation::Simplify),
            other => Err(AppError::validation(
                "operation",
                format!("unknown note operation '{}'", other),
            )),
        }
    }
}

/// Generated text for one note operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NoteOutput {
    pub document_id: String,
    pub operation: NoteOperation,
    pub text: String,
    pub model: String,
    pub generated_at: DateTime<Utc>,
}

pub struct NoteAssistant {
    generator: Arc<dyn TextGenerator>,
    cache: CoalescingCache<NoteOutput>,
    retry: RetryPolicy,
    constraints: GenerationConstraints,
}

impl NoteAssistant {
    pub fn new(generator: Arc<dyn TextGenerator>, retry: RetryPolicy, constraints: GenerationConstraints) -> Self {
        Self {
            generator,
            cache: CoalescingCache::new("notes"),
            retry,
            constraints,
        }
    }

    pub fn from_config(config: &AppConfig, generator: Arc<dyn TextGenerator>) -> Self {
        let retry = RetryPolicy::new(
            config.synthesis.max_attempts,
            config.synthesis.initial_backoff_ms,
            config.synthesis.max_backoff_ms,
            config.llm_timeout(),
        );
        Self::new(generator, retry, GenerationConstraints::from_config(&config.llm))
    }

    pub fn cache(&self) -> &CoalescingCache<NoteOutput> {
        &self.cache
    }

    #[instrument(skip(self, document), fields(document_id = %document.id, operation = %operation))]
    pub async fn run(&self, document: &Document, operation: NoteOperation, use_cache: bool) -> Result<NoteOutput> {
        if document.is_blank() {
            return Err(AppError::EmptyDocument {
                id: document.id.clone(),
            });
        }

        let key = CacheKey::new(&document.fingerprint, operation.kind(), &self.generator.model_name())?;
        self.cache
            .get_or_try_compute(&key, !use_cache, || self.generate(document, operation))
            .await
    }

    async fn generate(&self, document: &Document, operation: NoteOperation) -> Result<NoteOutput> {
        let prompt = operation.prompt(&document.text);
        let mut state = self.retry.start("generator");

        while let Some(attempt) = state.next_attempt().await {
            let completion = with_timeout(
                self.retry.attempt_timeout,
                "generator",
                self.generator.complete(&prompt, &self.constraints),
            )
            .await
            .and_then(|text| {
                let text = text.trim().to_string();
                if text.is_empty() {
                    Err(AppError::MalformedOutput {
                        message: "empty completion".to_string(),
                    })
                } else {
                    Ok(text)
                }
            });

            match completion {
                Ok(text) => {
                    info!(attempts = attempt, chars = text.len(), "Note operation complete");
                    return Ok(NoteOutput {
                        document_id: document.id.clone(),
                        operation,
                        text,
                        model: self.generator.model_name().to_string(),
                        generated_at: Utc::now(),
                    });
                }
                Err(e) => state.record_failure(e),
            }
        }

        Err(state.into_error())
    }
}

impl fmt::Debug for NoteAssistant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoteAssistant")
            .field("model", &self.generator.model_name())
            .field("cached", &self.cache.len())
            .finish()
    }
}
