//! Terminology service clients
//!
//! Provides:
//! - `TerminologyService` trait: ranked `(code, display, score)` candidates for a term
//! - NLM client (ICD-10-CM via Clinical Tables, RxNorm via RxNav), rate limited
//! - Curated static table for common terms, used when the service fails or finds nothing

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use medparse_common::config::TerminologyConfig;
use medparse_common::metrics;
use medparse_common::{AppError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Coding system a mention is resolved against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodingSystem {
    /// Diagnoses
    Icd10Cm,
    /// Medications
    RxNorm,
}

impl CodingSystem {
    pub fn as_str(&self) -> &'static str {
        match self {
            CodingSystem::Icd10Cm => "icd10cm",
            CodingSystem::RxNorm => "rxnorm",
        }
    }

    /// System URI used in interchange codings
    pub fn uri(&self) -> &'static str {
        match self {
            CodingSystem::Icd10Cm => "http://hl7.org/fhir/sid/icd-10",
            CodingSystem::RxNorm => "http://www.nlm.nih.gov/research/umls/rxnorm",
        }
    }
}

impl fmt::Display for CodingSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ranked lookup result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminologyCandidate {
    pub code: String,
    pub display: String,
    /// Service-assigned relevance in `[0, 1]`
    pub score: f32,
}

/// Trait for terminology services
#[async_trait]
pub trait TerminologyService: Send + Sync {
    /// Candidates for `text`, best first; an empty list means no match
    async fn lookup(&self, text: &str, system: CodingSystem) -> Result<Vec<TerminologyCandidate>>;

    /// Short name for logs and metrics
    fn name(&self) -> &str;
}

const SERVICE: &str = "terminology";

/// NLM terminology client
pub struct NlmTerminologyClient {
    client: reqwest::Client,
    icd10_url: String,
    rxnorm_url: String,
    max_candidates: usize,
    timeout: Duration,
    limiter: Arc<DirectRateLimiter>,
}

impl NlmTerminologyClient {
    pub fn new(config: &TerminologyConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            client,
            icd10_url: config.icd10_url.clone(),
            rxnorm_url: config.rxnorm_url.trim_end_matches('/').to_string(),
            max_candidates: config.max_candidates.max(1),
            timeout,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(rps))),
        })
    }

    async fn get_json(&self, url: &str, query: &[(&str, String)]) -> Result<Value> {
        self.limiter.until_ready().await;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::BackendTimeout {
                        service: SERVICE.to_string(),
                        timeout_ms: self.timeout.as_millis() as u64,
                    }
                } else {
                    AppError::Upstream {
                        service: SERVICE.to_string(),
                        message: format!("request failed: {}", e),
                    }
                }
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(AppError::RateLimited {
                service: SERVICE.to_string(),
            });
        }
        if !status.is_success() {
            return Err(AppError::Upstream {
                service: SERVICE.to_string(),
                message: format!("status {}", status),
            });
        }

        response.json().await.map_err(|e| AppError::Upstream {
            service: SERVICE.to_string(),
            message: format!("unreadable response: {}", e),
        })
    }

    async fn lookup_icd10(&self, text: &str) -> Result<Vec<TerminologyCandidate>> {
        let body = self
            .get_json(
                &self.icd10_url,
                &[
                    ("terms", text.to_string()),
                    ("maxList", self.max_candidates.to_string()),
                    ("sf", "code,name".to_string()),
                    ("df", "code,name".to_string()),
                ],
            )
            .await?;
        Ok(parse_icd10_response(&body, self.max_candidates))
    }

    async fn lookup_rxnorm(&self, text: &str) -> Result<Vec<TerminologyCandidate>> {
        let exact = self
            .get_json(
                &format!("{}/rxcui.json", self.rxnorm_url),
                &[("name", text.to_string())],
            )
            .await?;
        if let Some(candidate) = parse_rxcui_response(&exact, text) {
            return Ok(vec![candidate]);
        }

        let approximate = self
            .get_json(
                &format!("{}/approximateTerm.json", self.rxnorm_url),
                &[
                    ("term", text.to_string()),
                    ("maxEntries", self.max_candidates.to_string()),
                ],
            )
            .await?;
        Ok(parse_approximate_response(&approximate, text, self.max_candidates))
    }
}

#[async_trait]
impl TerminologyService for NlmTerminologyClient {
    async fn lookup(&self, text: &str, system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
        let result = match system {
            CodingSystem::Icd10Cm => self.lookup_icd10(text).await,
            CodingSystem::RxNorm => self.lookup_rxnorm(text).await,
        };

        let outcome = match &result {
            Ok(c) if c.is_empty() => "no_match",
            Ok(_) => "matched",
            Err(_) => "error",
        };
        metrics::record_terminology(system.as_str(), outcome);
        debug!(system = %system, term = text, outcome, "Terminology lookup");
        result
    }

    fn name(&self) -> &str {
        "nlm"
    }
}

/// Clinical Tables search: `[total, [codes], extra, [[code, name], ...]]`
fn parse_icd10_response(body: &Value, limit: usize) -> Vec<TerminologyCandidate> {
    let codes = match body.get(1).and_then(Value::as_array) {
        Some(codes) => codes,
        None => return Vec::new(),
    };
    let displays = body.get(3).and_then(Value::as_array);

    codes
        .iter()
        .enumerate()
        .filter_map(|(rank, code)| {
            let code = code.as_str()?.to_string();
            let display = displays
                .and_then(|d| d.get(rank))
                .and_then(|row| match row {
                    Value::Array(cols) => cols.last().and_then(Value::as_str),
                    Value::String(s) => Some(s.as_str()),
                    _ => None,
                })
                .unwrap_or(&code)
                .to_string();
            Some(TerminologyCandidate {
                code,
                display,
                score: 1.0 / (1.0 + rank as f32),
            })
        })
        .take(limit)
        .collect()
}

/// RxNav exact lookup: `{"idGroup": {"name": ..., "rxnormId": [...]}}`
fn parse_rxcui_response(body: &Value, text: &str) -> Option<TerminologyCandidate> {
    let group = body.get("idGroup")?;
    let code = group
        .get("rxnormId")
        .and_then(Value::as_array)
        .and_then(|ids| ids.first())
        .and_then(Value::as_str)?;
    let display = group.get("name").and_then(Value::as_str).unwrap_or(text);
    Some(TerminologyCandidate {
        code: code.to_string(),
        display: display.to_string(),
        score: 1.0,
    })
}

/// RxNav approximate search; scores are relative to the best candidate and capped below an exact hit
fn parse_approximate_response(body: &Value, text: &str, limit: usize) -> Vec<TerminologyCandidate> {
    let raw = match body
        .pointer("/approximateGroup/candidate")
        .and_then(Value::as_array)
    {
        Some(raw) => raw,
        None => return Vec::new(),
    };

    let number = |v: Option<&Value>| -> Option<f32> {
        match v? {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_f64().map(|f| f as f32),
            _ => None,
        }
    };

    let mut seen = Vec::new();
    let mut scored = Vec::new();
    for candidate in raw {
        let code = match candidate.get("rxcui").and_then(Value::as_str) {
            Some(c) if !c.is_empty() => c.to_string(),
            _ => continue,
        };
        if seen.contains(&code) {
            continue;
        }
        seen.push(code.clone());
        let display = candidate
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or(text)
            .to_string();
        scored.push((code, display, number(candidate.get("score")).unwrap_or(0.0)));
    }

    let best = scored.iter().map(|(_, _, s)| *s).fold(0.0_f32, f32::max);
    scored
        .into_iter()
        .take(limit)
        .map(|(code, display, score)| TerminologyCandidate {
            code,
            display,
            score: if best > 0.0 { (score / best) * 0.9 } else { 0.5 },
        })
        .collect()
}

struct TableEntry {
    term: &'static str,
    code: &'static str,
    display: &'static str,
}

const fn entry(term: &'static str, code: &'static str, display: &'static str) -> TableEntry {
    TableEntry { term, code, display }
}

const ICD10_TABLE: &[TableEntry] = &[
    entry("hypertension", "I10", "Essential (primary) hypertension"),
    entry("type 2 diabetes", "E11.9", "Type 2 diabetes mellitus without complications"),
    entry("diabetes mellitus type 2", "E11.9", "Type 2 diabetes mellitus without complications"),
    entry("diabetes", "E11.9", "Type 2 diabetes mellitus without complications"),
    entry("overweight", "E66.3", "Overweight"),
    entry("obesity", "E66.9", "Obesity, unspecified"),
    entry("hyperlipidemia", "E78.5", "Hyperlipidemia, unspecified"),
    entry("high cholesterol", "E78.0", "Pure hypercholesterolemia"),
    entry("influenza", "J11.1", "Influenza due to unidentified influenza virus with other respiratory manifestations"),
    entry("flu", "J11.1", "Influenza due to unidentified influenza virus with other respiratory manifestations"),
    entry("annual exam", "Z00.00", "Encounter for general adult medical examination without abnormal findings"),
    entry("physical examination", "Z00.00", "Encounter for general adult medical examination without abnormal findings"),
    entry("health checkup", "Z00.00", "Encounter for general adult medical examination without abnormal findings"),
    entry("family history", "Z82.79", "Family history of other congenital malformations, deformations and chromosomal abnormalities"),
    entry("family history of heart disease", "Z82.49", "Family history of ischemic heart disease and other diseases of the circulatory system"),
    entry("family history of high cholesterol", "Z83.42", "Family history of familial hypercholesterolemia"),
];

const RXNORM_TABLE: &[TableEntry] = &[
    entry("aspirin", "1191", "Aspirin"),
    entry("lisinopril", "29046", "Lisinopril"),
    entry("metformin", "6809", "Metformin"),
    entry("atorvastatin", "83367", "Atorvastatin"),
    entry("simvastatin", "36567", "Simvastatin"),
    entry("amlodipine", "17767", "Amlodipine"),
    entry("metoprolol", "6918", "Metoprolol"),
    entry("omeprazole", "7646", "Omeprazole"),
    entry("albuterol", "435", "Albuterol"),
    entry("hydrochlorothiazide", "5487", "Hydrochlorothiazide"),
];

/// Score given to table matches
const TABLE_SCORE: f32 = 0.6;

/// Curated offline table of common diagnoses and medications
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticTerminology;

impl StaticTerminology {
    pub fn new() -> Self {
        Self
    }

    /// Longest table term occurring as a whole phrase in `text`
    pub fn find(&self, text: &str, system: CodingSystem) -> Option<TerminologyCandidate> {
        let table = match system {
            CodingSystem::Icd10Cm => ICD10_TABLE,
            CodingSystem::RxNorm => RXNORM_TABLE,
        };
        let text = text.to_lowercase();

        table
            .iter()
            .filter(|e| contains_phrase(&text, e.term))
            .max_by_key(|e| e.term.len())
            .map(|e| TerminologyCandidate {
                code: e.code.to_string(),
                display: e.display.to_string(),
                score: TABLE_SCORE,
            })
    }
}

#[async_trait]
impl TerminologyService for StaticTerminology {
    async fn lookup(&self, text: &str, system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
        Ok(self.find(text, system).into_iter().collect())
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// `needle` occurs in `haystack` bounded by non-alphanumeric characters
fn contains_phrase(haystack: &str, needle: &str) -> bool {
    haystack.match_indices(needle).any(|(start, _)| {
        let end = start + needle.len();
        let before = haystack[..start].chars().next_back();
        let after = haystack[end..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

/// Primary service with the static table behind it
pub struct FallbackTerminology {
    primary: Arc<dyn TerminologyService>,
    table: StaticTerminology,
}

impl FallbackTerminology {
    pub fn new(primary: Arc<dyn TerminologyService>) -> Self {
        Self {
            primary,
            table: StaticTerminology,
        }
    }
}

#[async_trait]
impl TerminologyService for FallbackTerminology {
    async fn lookup(&self, text: &str, system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
        match self.primary.lookup(text, system).await {
            Ok(candidates) if !candidates.is_empty() => Ok(candidates),
            Ok(_) => Ok(self.table.find(text, system).into_iter().collect()),
            Err(e) => match self.table.find(text, system) {
                Some(candidate) => {
                    warn!(
                        service = self.primary.name(),
                        system = %system,
                        error = %e,
                        "Terminology service failed, using curated table"
                    );
                    metrics::record_terminology(system.as_str(), "fallback");
                    Ok(vec![candidate])
                }
                None => Err(e),
            },
        }
    }

    fn name(&self) -> &str {
        self.primary.name()
    }
}

/// Create the terminology service described by configuration
pub fn create_terminology(config: &TerminologyConfig) -> Result<Arc<dyn TerminologyService>> {
    let client: Arc<dyn TerminologyService> = Arc::new(NlmTerminologyClient::new(config)?);
    if config.use_fallback_table {
        Ok(Arc::new(FallbackTerminology::new(client)))
    } else {
        Ok(client)
    }
}
