//! Code resolver
//!
//! Maps free-text mentions to terminology codes. "No match" and "service
//! unavailable" are ordinary outcomes carried in `CodeMapping`, never errors.

use crate::schema::ExtractionResult;
use crate::terminology::{CodingSystem, TerminologyService};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MappingStatus {
    Matched,
    NoMatch,
    /// The terminology service failed or timed out
    Unavailable,
}

/// Mention text mapped to a canonical code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeMapping {
    pub mention: String,
    pub normalized: String,
    pub system: CodingSystem,
    pub code: Option<String>,
    pub display: Option<String>,
    /// Score of the chosen candidate; zero without a code
    pub confidence: f32,
    pub status: MappingStatus,
}

impl CodeMapping {
    fn uncoded(mention: &str, normalized: String, system: CodingSystem, status: MappingStatus) -> Self {
        Self {
            mention: mention.to_string(),
            normalized,
            system,
            code: None,
            display: None,
            confidence: 0.0,
            status,
        }
    }

    pub fn is_coded(&self) -> bool {
        self.code.is_some()
    }
}

/// Mappings for one extraction result, index-aligned with its mention lists
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodeMappings {
    pub diagnoses: Vec<CodeMapping>,
    pub medications: Vec<CodeMapping>,
}

impl CodeMappings {
    pub fn coded_count(&self) -> usize {
        self.diagnoses
            .iter()
            .chain(self.medications.iter())
            .filter(|m| m.is_coded())
            .count()
    }
}

/// Clinical shorthand expanded before lookup
const ABBREVIATIONS: &[(&str, &str)] = &[
    ("htn", "hypertension"),
    ("t2dm", "type 2 diabetes mellitus"),
    ("dm2", "type 2 diabetes mellitus"),
    ("t1dm", "type 1 diabetes mellitus"),
    ("dm", "diabetes mellitus"),
    ("hld", "hyperlipidemia"),
    ("cad", "coronary artery disease"),
    ("chf", "congestive heart failure"),
    ("copd", "chronic obstructive pulmonary disease"),
    ("gerd", "gastroesophageal reflux disease"),
    ("afib", "atrial fibrillation"),
    ("uti", "urinary tract infection"),
    ("uri", "upper respiratory infection"),
    ("ckd", "chronic kidney disease"),
    ("oa", "osteoarthritis"),
    ("mi", "myocardial infarction"),
    ("asa", "aspirin"),
    ("hctz", "hydrochlorothiazide"),
    ("apap", "acetaminophen"),
    ("ntg", "nitroglycerin"),
];

/// Lowercase, trim punctuation, collapse whitespace and expand abbreviations
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .map(|word| word.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|word| !word.is_empty())
        .map(|word| {
            ABBREVIATIONS
                .iter()
                .find(|(abbr, _)| *abbr == word)
                .map(|(_, full)| *full)
                .unwrap_or(word)
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Resolves mentions through a terminology service
pub struct CodeResolver {
    terminology: Arc<dyn TerminologyService>,
    timeout: Duration,
}

impl CodeResolver {
    pub fn new(terminology: Arc<dyn TerminologyService>, timeout: Duration) -> Self {
        Self { terminology, timeout }
    }

    /// Resolve one mention; the service's first candidate wins
    pub async fn resolve(&self, mention: &str, system: CodingSystem) -> CodeMapping {
        let normalized = normalize(mention);
        if normalized.is_empty() {
            return CodeMapping::uncoded(mention, normalized, system, MappingStatus::NoMatch);
        }

        let lookup = tokio::time::timeout(self.timeout, self.terminology.lookup(&normalized, system)).await;
        let candidates = match lookup {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(e)) => {
                warn!(system = %system, mention, error = %e, "Terminology lookup failed");
                return CodeMapping::uncoded(mention, normalized, system, MappingStatus::Unavailable);
            }
            Err(_) => {
                warn!(
                    system = %system,
                    mention,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Terminology lookup timed out"
                );
                return CodeMapping::uncoded(mention, normalized, system, MappingStatus::Unavailable);
            }
        };

        match candidates.into_iter().next() {
            Some(best) => {
                debug!(system = %system, mention, code = %best.code, score = best.score, "Mention resolved");
                CodeMapping {
                    mention: mention.to_string(),
                    normalized,
                    system,
                    code: Some(best.code),
                    display: Some(best.display),
                    confidence: best.score.clamp(0.0, 1.0),
                    status: MappingStatus::Matched,
                }
            }
            None => CodeMapping::uncoded(mention, normalized, system, MappingStatus::NoMatch),
        }
    }

    /// Start a memoizing session for one extraction run
    pub fn session(&self) -> ResolutionSession<'_> {
        ResolutionSession {
            resolver: self,
            memo: HashMap::new(),
            lookups: 0,
        }
    }

    /// Resolve every diagnosis and medication of `result`
    pub async fn resolve_all(&self, result: &ExtractionResult) -> CodeMappings {
        let mut session = self.session();
        let mut mappings = CodeMappings::default();

        for diagnosis in &result.diagnoses {
            mappings
                .diagnoses
                .push(session.resolve(&diagnosis.text, CodingSystem::Icd10Cm).await);
        }
        for medication in &result.medications {
            mappings
                .medications
                .push(session.resolve(&medication.text, CodingSystem::RxNorm).await);
        }

        info!(
            document_id = %result.document_id,
            mentions = mappings.diagnoses.len() + mappings.medications.len(),
            coded = mappings.coded_count(),
            lookups = session.lookups(),
            "Mentions resolved"
        );
        mappings
    }
}

/// Per-run memo keyed by (normalized mention, system)
pub struct ResolutionSession<'a> {
    resolver: &'a CodeResolver,
    memo: HashMap<(String, CodingSystem), CodeMapping>,
    lookups: usize,
}

impl ResolutionSession<'_> {
    pub async fn resolve(&mut self, mention: &str, system: CodingSystem) -> CodeMapping {
        let key = (normalize(mention), system);
        if let Some(known) = self.memo.get(&key) {
            return CodeMapping {
                mention: mention.to_string(),
                ..known.clone()
            };
        }

        self.lookups += 1;
        let mapping = self.resolver.resolve(mention, system).await;
        self.memo.insert(key, mapping.clone());
        mapping
    }

    /// Service lookups performed so far
    pub fn lookups(&self) -> usize {
        self.lookups
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::terminology::TerminologyCandidate;
    use async_trait::async_trait;
    use medparse_common::{AppError, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingService {
        calls: AtomicUsize,
        candidates: Vec<TerminologyCandidate>,
    }

    impl RecordingService {
        fn returning(candidates: Vec<TerminologyCandidate>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                candidates,
            }
        }
    }

    #[async_trait]
    impl TerminologyService for RecordingService {
        async fn lookup(&self, _text: &str, _system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.candidates.clone())
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct SlowService;

    #[async_trait]
    impl TerminologyService for SlowService {
        async fn lookup(&self, _text: &str, _system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(AppError::Internal {
                message: "unreachable".into(),
            })
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    fn candidate(code: &str, score: f32) -> TerminologyCandidate {
        TerminologyCandidate {
            code: code.to_string(),
            display: format!("display {}", code),
            score,
        }
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("  HTN, poorly controlled. "), "hypertension poorly controlled");
        assert_eq!(normalize("ASA"), "aspirin");
        assert_eq!(normalize("T2DM"), "type 2 diabetes mellitus");
        assert_eq!(normalize("Knee   pain"), "knee pain");
        assert_eq!(normalize("..."), "");
    }

    #[tokio::test]
    async fn test_first_candidate_wins() {
        let service = Arc::new(RecordingService::returning(vec![
            candidate("5640", 0.8),
            candidate("197806", 0.95),
        ]));
        let resolver = CodeResolver::new(service, Duration::from_secs(1));

        let mapping = resolver.resolve("Ibuprofen", CodingSystem::RxNorm).await;
        assert_eq!(mapping.status, MappingStatus::Matched);
        assert_eq!(mapping.code.as_deref(), Some("5640"));
        assert_eq!(mapping.confidence, 0.8);
    }

    #[tokio::test]
    async fn test_no_match_is_a_value() {
        let resolver = CodeResolver::new(Arc::new(RecordingService::returning(vec![])), Duration::from_secs(1));
        let mapping = resolver.resolve("zebra syndrome", CodingSystem::Icd10Cm).await;
        assert_eq!(mapping.status, MappingStatus::NoMatch);
        assert!(mapping.code.is_none());
        assert_eq!(mapping.confidence, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_unavailable() {
        let resolver = CodeResolver::new(Arc::new(SlowService), Duration::from_millis(100));
        let mapping = resolver.resolve("hypertension", CodingSystem::Icd10Cm).await;
        assert_eq!(mapping.status, MappingStatus::Unavailable);
        assert!(mapping.code.is_none());
    }

    #[tokio::test]
    async fn test_session_memoizes_normalized_mentions() {
        let service = Arc::new(RecordingService::returning(vec![candidate("I10", 1.0)]));
        let resolver = CodeResolver::new(service.clone(), Duration::from_secs(1));
        let mut session = resolver.session();

        let a = session.resolve("HTN", CodingSystem::Icd10Cm).await;
        let b = session.resolve("hypertension", CodingSystem::Icd10Cm).await;
        let c = session.resolve("hypertension", CodingSystem::RxNorm).await;

        assert_eq!(a.code, b.code);
        assert_eq!(b.mention, "hypertension");
        assert!(c.is_coded());
        assert_eq!(session.lookups(), 2);
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }
}
