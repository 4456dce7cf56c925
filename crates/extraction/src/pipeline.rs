//! Structured extraction pipeline
//!
//! Prompts the generative backend for a fixed record shape, parses the reply
//! through `schema::parse_response` and retries with a corrective prompt
//! when the reply does not fit. Exhaustion is not an error: the caller gets
//! an `Incomplete` result holding whatever sections could be salvaged.
//!
//! Results are cached per (fingerprint, schema version, model) and
//! concurrent extractions of one fingerprint share a single backend run.

use crate::schema::{parse_response, salvage, ExtractionResult, ExtractionStatus, SchemaError};
use medparse_common::config::AppConfig;
use medparse_common::metrics;
use medparse_common::retry::with_timeout;
use medparse_common::{
    AppError, CacheKey, CoalescingCache, Document, GenerationConstraints, OperationKind, Result, RetryPolicy,
    TextGenerator,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

const SYSTEM_PROMPT: &str = "You are a medical data extraction assistant. You reply with a single JSON object and nothing else.";

/// Extraction parameters
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    pub retry: RetryPolicy,
    pub constraints: GenerationConstraints,
    /// Part of the cache key; bump when the prompt or schema changes
    pub schema_version: u32,
}

impl ExtractionSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            retry: RetryPolicy::new(
                config.extraction.max_attempts,
                config.extraction.initial_backoff_ms,
                config.extraction.max_backoff_ms,
                config.llm_timeout(),
            ),
            constraints: GenerationConstraints::from_config(&config.llm)
                .json()
                .with_system_prompt(SYSTEM_PROMPT),
            schema_version: config.extraction.schema_version,
        }
    }
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::new(3, 250, 4000, Duration::from_secs(30)),
            constraints: GenerationConstraints::default()
                .json()
                .with_system_prompt(SYSTEM_PROMPT),
            schema_version: 1,
        }
    }
}

#[derive(Serialize)]
struct KeyParams<'a> {
    schema_version: u32,
    model: &'a str,
}

/// Schema-constrained extraction over a generative backend
pub struct StructuredExtractor {
    generator: Arc<dyn TextGenerator>,
    cache: CoalescingCache<ExtractionResult>,
    settings: ExtractionSettings,
}

impl StructuredExtractor {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: ExtractionSettings) -> Self {
        Self {
            generator,
            cache: CoalescingCache::new("extraction"),
            settings,
        }
    }

    pub fn cache(&self) -> &CoalescingCache<ExtractionResult> {
        &self.cache
    }

    pub fn cache_key(&self, document: &Document) -> Result<CacheKey> {
        CacheKey::new(
            &document.fingerprint,
            OperationKind::Extract,
            &KeyParams {
                schema_version: self.settings.schema_version,
                model: self.generator.model_name(),
            },
        )
    }

    /// Extract the structured record of `document`.
    ///
    /// With `use_cache` a completed entry is returned as is; without it the
    /// entry is recomputed unless an extraction is already running. Only
    /// input errors are returned as `Err`.
    #[instrument(skip(self, document), fields(document_id = %document.id))]
    pub async fn extract(&self, document: &Document, use_cache: bool) -> Result<ExtractionResult> {
        if document.is_blank() {
            return Err(AppError::EmptyDocument {
                id: document.id.clone(),
            });
        }

        let key = self.cache_key(document)?;
        let result = self
            .cache
            .get_or_try_compute(&key, !use_cache, || async { Ok(self.run(document).await) })
            .await?;

        if !result.is_complete() && self.cache.evict_if(&key, |cached| !cached.is_complete()) {
            info!(key = %key, "Incomplete extraction not kept in cache");
        }
        Ok(result)
    }

    async fn run(&self, document: &Document) -> ExtractionResult {
        let retry = &self.settings.retry;
        let mut state = retry.start("generator");
        let mut responses: Vec<String> = Vec::new();
        let mut issues: Vec<String> = Vec::new();
        let mut prompt = extraction_prompt(&document.text);

        while let Some(attempt) = state.next_attempt().await {
            let completion = with_timeout(
                retry.attempt_timeout,
                "generator",
                self.generator.complete(&prompt, &self.settings.constraints),
            )
            .await;

            let text = match completion {
                Ok(text) => text,
                Err(e) => {
                    warn!(attempt, error = %e, "Generator call failed");
                    issues.push(format!("attempt {}: {}", attempt, e.code().as_str()));
                    state.record_failure(e);
                    continue;
                }
            };

            match parse_response(&text, &document.text) {
                Ok(record) => {
                    let mut result = ExtractionResult::from_record(
                        &document.id,
                        &document.fingerprint,
                        record,
                        ExtractionStatus::Complete,
                        attempt,
                    );
                    issues.append(&mut result.issues);
                    result.issues = issues;
                    metrics::record_extraction("complete", attempt);
                    info!(
                        attempts = attempt,
                        diagnoses = result.diagnoses.len(),
                        medications = result.medications.len(),
                        "Extraction complete"
                    );
                    return result;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Backend output does not match the record schema");
                    issues.push(format!("attempt {}: {}", attempt, e));
                    prompt = corrective_prompt(&document.text, &text, &e);
                    responses.push(text);
                    state.record_failure(e.into());
                }
            }
        }

        let attempts = state.attempts();
        let mut record = salvage(&responses, &document.text);
        issues.append(&mut record.issues);
        record.issues = issues;

        warn!(
            attempts,
            halted = state.is_halted(),
            error = %state.last_error().map(|e| e.to_string()).unwrap_or_default(),
            "Extraction incomplete, returning salvaged fields"
        );
        metrics::record_extraction("incomplete", attempts);
        ExtractionResult::from_record(
            &document.id,
            &document.fingerprint,
            record,
            ExtractionStatus::Incomplete,
            attempts,
        )
    }
}

fn extraction_prompt(text: &str) -> String {
    format!(
        r#"Extract the following information from the medical note below into one JSON object:

1. "patient": object with "name", "id", "date_of_birth" (YYYY-MM-DD), "gender", "age"
2. "encounter_date": date of the visit as YYYY-MM-DD
3. "vital_signs": object with "blood_pressure", "heart_rate", "respiratory_rate", "temperature", "height", "weight", "bmi"
4. "diagnoses": array of objects with "description" and "status" (active, resolved, ...)
5. "medications": array of objects with "name", "dosage", "route", "frequency"
6. "treatments": array of objects with "description" and "icd_procedure_code" for treatments or procedures
7. "lab_results": object with test names as keys and results as values
8. "follow_up": array of objects with "description" and "timeframe"

Use lowercase field names exactly as listed. List items in the order they first appear in the note.
Do not guess: when information is not in the note use null or an empty array.

Medical note:
{text}

Return ONLY the JSON object."#
    )
}

fn corrective_prompt(text: &str, previous: &str, error: &SchemaError) -> String {
    let mut excerpt: String = previous.chars().take(1500).collect();
    if excerpt.len() < previous.len() {
        excerpt.push_str("...");
    }
    format!(
        "{}\n\nYour previous reply could not be used: {}.\nPrevious reply:\n{}\n\n\
         Reply again with a single JSON object that contains at least the \"patient\", \"diagnoses\" and \"medications\" fields.",
        extraction_prompt(text),
        error,
        excerpt
    )
}
