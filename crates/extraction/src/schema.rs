//! Structured record schema and the parser that coerces generator output into it
//!
//! Generator output is untrusted text. `parse_response` either yields a fully
//! validated `ParsedRecord` or a typed `SchemaError`; `salvage` keeps every
//! section that decodes on its own when no response passed as a whole.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use thiserror::Error;

/// Sections a response must contain (null is accepted as empty)
pub const ENVELOPE: [&str; 3] = ["patient", "diagnoses", "medications"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Demographics {
    pub name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub gender: Option<String>,
    pub age: Option<u32>,
    /// Record numbers or other identifiers, in the order given
    pub identifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisMention {
    pub text: String,
    /// active, resolved, ...
    pub status: Option<String>,
    /// Filled by the code resolver
    pub code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MedicationMention {
    pub text: String,
    pub dose: Option<String>,
    pub frequency: Option<String>,
    pub route: Option<String>,
    /// Filled by the code resolver
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VitalSigns {
    pub blood_pressure: Option<String>,
    pub heart_rate: Option<String>,
    pub respiratory_rate: Option<String>,
    pub temperature: Option<String>,
    pub height: Option<String>,
    pub weight: Option<String>,
    pub bmi: Option<f64>,
}

impl VitalSigns {
    pub fn is_empty(&self) -> bool {
        self == &VitalSigns::default()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub description: String,
    pub timeframe: Option<String>,
}

/// Treatment or procedure given during the encounter, or advised
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Treatment {
    pub description: String,
    /// ICD-10-PCS code when the generator supplied one
    pub procedure_code: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Complete,
    /// Backend never produced a valid record; fields hold what could be salvaged
    Incomplete,
}

/// Structured record extracted from one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionResult {
    pub document_id: String,
    pub fingerprint: String,
    pub patient: Demographics,
    pub encounter_date: Option<NaiveDate>,
    pub vital_signs: Option<VitalSigns>,
    pub diagnoses: Vec<DiagnosisMention>,
    pub medications: Vec<MedicationMention>,
    #[serde(default)]
    pub treatments: Vec<Treatment>,
    pub follow_up: Vec<FollowUp>,
    pub lab_results: BTreeMap<String, String>,
    pub status: ExtractionStatus,
    /// Backend calls spent on this result
    pub attempts: u32,
    /// Parse failures and dropped values, for operators
    pub issues: Vec<String>,
    pub extracted_at: DateTime<Utc>,
}

impl ExtractionResult {
    pub fn from_record(document_id: &str, fingerprint: &str, record: ParsedRecord, status: ExtractionStatus, attempts: u32) -> Self {
        Self {
            document_id: document_id.to_string(),
            fingerprint: fingerprint.to_string(),
            patient: record.patient,
            encounter_date: record.encounter_date,
            vital_signs: record.vital_signs,
            diagnoses: record.diagnoses,
            medications: record.medications,
            treatments: record.treatments,
            follow_up: record.follow_up,
            lab_results: record.lab_results,
            status,
            attempts,
            issues: record.issues,
            extracted_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ExtractionStatus::Complete
    }
}

/// Validated content of one generator response
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedRecord {
    pub patient: Demographics,
    pub encounter_date: Option<NaiveDate>,
    pub vital_signs: Option<VitalSigns>,
    pub diagnoses: Vec<DiagnosisMention>,
    pub medications: Vec<MedicationMention>,
    pub treatments: Vec<Treatment>,
    pub follow_up: Vec<FollowUp>,
    pub lab_results: BTreeMap<String, String>,
    pub issues: Vec<String>,
}

/// Why a response could not be coerced into the schema
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SchemaError {
    #[error("response contains no JSON object")]
    NoJsonObject,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("missing required section '{0}'")]
    MissingSection(&'static str),

    #[error("section '{section}' does not match the schema: {message}")]
    InvalidSection { section: &'static str, message: String },
}

impl From<SchemaError> for medparse_common::AppError {
    fn from(err: SchemaError) -> Self {
        medparse_common::AppError::MalformedOutput {
            message: err.to_string(),
        }
    }
}

// Wire shapes. Generators drift between plain strings and objects, and
// between numbers and strings for measurements; the wire types absorb that.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WirePatient {
    #[serde(alias = "patient_name", alias = "full_name")]
    name: Option<Value>,
    #[serde(alias = "dob", alias = "birth_date", alias = "birthdate")]
    date_of_birth: Option<Value>,
    #[serde(alias = "sex")]
    gender: Option<Value>,
    age: Option<Value>,
    #[serde(alias = "mrn", alias = "patient_id")]
    id: Option<Value>,
    identifiers: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireDiagnosis {
    Text(String),
    Detailed {
        #[serde(alias = "text", alias = "name", alias = "diagnosis")]
        description: Option<String>,
        #[serde(default)]
        status: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireMedication {
    Text(String),
    Detailed {
        #[serde(alias = "text", alias = "medication", alias = "drug")]
        name: Option<String>,
        #[serde(default, alias = "dose")]
        dosage: Option<Value>,
        #[serde(default)]
        frequency: Option<Value>,
        #[serde(default)]
        route: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTreatment {
    Text(String),
    Detailed {
        #[serde(alias = "text", alias = "treatment", alias = "procedure")]
        description: Option<String>,
        #[serde(default, alias = "icd_procedure_code", alias = "code")]
        procedure_code: Option<Value>,
    },
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireFollowUp {
    Text(String),
    Detailed {
        #[serde(alias = "text", alias = "instruction")]
        description: Option<String>,
        #[serde(default, alias = "when")]
        timeframe: Option<Value>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireVitals {
    #[serde(alias = "bp")]
    blood_pressure: Option<Value>,
    #[serde(alias = "hr", alias = "pulse")]
    heart_rate: Option<Value>,
    #[serde(alias = "rr")]
    respiratory_rate: Option<Value>,
    #[serde(alias = "temp")]
    temperature: Option<Value>,
    height: Option<Value>,
    weight: Option<Value>,
    bmi: Option<Value>,
}

/// Locate the outermost JSON object in a response, ignoring code fences and chatter
pub fn locate_json_object(text: &str) -> Result<&str, SchemaError> {
    let start = text.find('{').ok_or(SchemaError::NoJsonObject)?;
    let end = text.rfind('}').ok_or(SchemaError::NoJsonObject)?;
    if end < start {
        return Err(SchemaError::NoJsonObject);
    }
    Ok(&text[start..=end])
}

fn parse_object(text: &str) -> Result<Map<String, Value>, SchemaError> {
    let json = locate_json_object(text)?;
    let value: Value = serde_json::from_str(json).map_err(|e| SchemaError::InvalidJson(e.to_string()))?;
    match value {
        Value::Object(map) => Ok(lowercase_keys(map)),
        _ => Err(SchemaError::NoJsonObject),
    }
}

fn lowercase_keys(map: Map<String, Value>) -> Map<String, Value> {
    map.into_iter().map(|(k, v)| (k.to_lowercase(), v)).collect()
}

/// Parse a complete response: the envelope must be present and every section must decode
pub fn parse_response(text: &str, source_text: &str) -> Result<ParsedRecord, SchemaError> {
    let object = parse_object(text)?;
    for section in ENVELOPE {
        if !object.contains_key(section) {
            return Err(SchemaError::MissingSection(section));
        }
    }

    let mut record = ParsedRecord::default();
    let mut issues = Vec::new();
    for section in Section::ALL {
        section.apply(&object, &mut record, &mut issues)?;
    }
    record.issues = issues;
    finish(&mut record, source_text);
    Ok(record)
}

/// Merge every non-empty section that decodes from any response, newest response first.
///
/// Used when no response passed `parse_response`; returns the partial record.
pub fn salvage(responses: &[String], source_text: &str) -> ParsedRecord {
    let objects: Vec<Map<String, Value>> = responses
        .iter()
        .rev()
        .filter_map(|r| parse_object(r).ok())
        .collect();

    let mut record = ParsedRecord::default();
    let mut issues = Vec::new();
    for section in Section::ALL {
        for object in &objects {
            if is_empty_value(object.get(section.key())) {
                continue;
            }
            let mut section_issues = Vec::new();
            if section.apply(object, &mut record, &mut section_issues).is_ok() {
                issues.extend(section_issues);
                break;
            }
        }
    }
    record.issues = issues;
    finish(&mut record, source_text);
    record
}

fn is_empty_value(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Object(map)) => map.is_empty(),
        Some(Value::Array(items)) => items.is_empty(),
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

#[derive(Debug, Clone, Copy)]
enum Section {
    Patient,
    EncounterDate,
    VitalSigns,
    Diagnoses,
    Medications,
    Treatments,
    FollowUp,
    LabResults,
}

impl Section {
    const ALL: [Section; 8] = [
        Section::Patient,
        Section::EncounterDate,
        Section::VitalSigns,
        Section::Diagnoses,
        Section::Medications,
        Section::Treatments,
        Section::FollowUp,
        Section::LabResults,
    ];

    fn key(&self) -> &'static str {
        match self {
            Section::Patient => "patient",
            Section::EncounterDate => "encounter_date",
            Section::VitalSigns => "vital_signs",
            Section::Diagnoses => "diagnoses",
            Section::Medications => "medications",
            Section::Treatments => "treatments",
            Section::FollowUp => "follow_up",
            Section::LabResults => "lab_results",
        }
    }

    /// Decode this section of `object` into `record`; absent or null sections are empty
    fn apply(&self, object: &Map<String, Value>, record: &mut ParsedRecord, issues: &mut Vec<String>) -> Result<(), SchemaError> {
        let key = self.key();
        let value = match object.get(key) {
            None | Some(Value::Null) => return Ok(()),
            Some(v) => v.clone(),
        };
        let invalid = |e: serde_json::Error| SchemaError::InvalidSection {
            section: key,
            message: e.to_string(),
        };

        match self {
            Section::Patient => {
                let wire: WirePatient = serde_json::from_value(value).map_err(invalid)?;
                record.patient = demographics(wire, issues);
            }
            Section::EncounterDate => {
                record.encounter_date = date_field("encounter_date", &Some(value), issues);
            }
            Section::VitalSigns => {
                let wire: WireVitals = serde_json::from_value(value).map_err(invalid)?;
                let vitals = vitals(wire, issues);
                record.vital_signs = (!vitals.is_empty()).then_some(vitals);
            }
            Section::Diagnoses => {
                let wire: Vec<WireDiagnosis> = serde_json::from_value(value).map_err(invalid)?;
                record.diagnoses = wire.into_iter().filter_map(diagnosis).collect();
            }
            Section::Medications => {
                let wire: Vec<WireMedication> = serde_json::from_value(value).map_err(invalid)?;
                record.medications = wire.into_iter().filter_map(medication).collect();
            }
            Section::Treatments => {
                let wire: Vec<WireTreatment> = serde_json::from_value(value).map_err(invalid)?;
                record.treatments = wire.into_iter().filter_map(treatment).collect();
            }
            Section::FollowUp => {
                let wire: Vec<WireFollowUp> = serde_json::from_value(value).map_err(invalid)?;
                record.follow_up = wire.into_iter().filter_map(follow_up).collect();
            }
            Section::LabResults => {
                let wire: Map<String, Value> = serde_json::from_value(value).map_err(invalid)?;
                record.lab_results = wire
                    .into_iter()
                    .filter_map(|(name, v)| {
                        let name = name.trim().to_string();
                        let v = match v {
                            Value::Object(_) | Value::Array(_) => Some(v.to_string()),
                            other => scalar(&Some(other)),
                        };
                        v.filter(|_| !name.is_empty()).map(|v| (name, v))
                    })
                    .collect();
            }
        }
        Ok(())
    }
}

/// Non-empty trimmed text of a string, number or bool value
fn scalar(value: &Option<Value>) -> Option<String> {
    let text = match value.as_ref()? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    let lowered = text.to_ascii_lowercase();
    if text.is_empty() || lowered == "null" || lowered == "n/a" || lowered == "unknown" {
        None
    } else {
        Some(text)
    }
}

fn text(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn date_field(field: &str, value: &Option<Value>, issues: &mut Vec<String>) -> Option<NaiveDate> {
    let raw = scalar(value)?;
    for format in ["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(&raw, format) {
            return Some(date);
        }
    }
    issues.push(format!("{}: unparseable date '{}' dropped", field, raw));
    None
}

fn demographics(wire: WirePatient, issues: &mut Vec<String>) -> Demographics {
    let mut identifiers = Vec::new();
    if let Some(id) = scalar(&wire.id) {
        identifiers.push(id);
    }
    for id in wire.identifiers.unwrap_or_default() {
        if let Some(id) = scalar(&Some(id)) {
            if !identifiers.contains(&id) {
                identifiers.push(id);
            }
        }
    }

    let age = scalar(&wire.age).and_then(|a| {
        let digits: String = a.chars().take_while(|c| c.is_ascii_digit()).collect();
        let parsed = digits.parse::<u32>().ok().filter(|age| *age < 150);
        if parsed.is_none() {
            issues.push(format!("patient.age: unparseable value '{}' dropped", a));
        }
        parsed
    });

    Demographics {
        name: scalar(&wire.name),
        date_of_birth: date_field("patient.date_of_birth", &wire.date_of_birth, issues),
        gender: scalar(&wire.gender).map(|g| g.to_lowercase()),
        age,
        identifiers,
    }
}

fn vitals(wire: WireVitals, issues: &mut Vec<String>) -> VitalSigns {
    let bmi = scalar(&wire.bmi).and_then(|raw| {
        let parsed = raw.parse::<f64>().ok();
        if parsed.is_none() {
            issues.push(format!("vital_signs.bmi: unparseable value '{}' dropped", raw));
        }
        parsed
    });

    VitalSigns {
        blood_pressure: scalar(&wire.blood_pressure),
        heart_rate: scalar(&wire.heart_rate),
        respiratory_rate: scalar(&wire.respiratory_rate),
        temperature: scalar(&wire.temperature),
        height: scalar(&wire.height),
        weight: scalar(&wire.weight),
        bmi,
    }
}

fn diagnosis(wire: WireDiagnosis) -> Option<DiagnosisMention> {
    let (description, status) = match wire {
        WireDiagnosis::Text(t) => (Some(t), None),
        WireDiagnosis::Detailed { description, status } => (description, status),
    };
    Some(DiagnosisMention {
        text: text(description)?,
        status: scalar(&status).map(|s| s.to_lowercase()),
        code: None,
    })
}

fn medication(wire: WireMedication) -> Option<MedicationMention> {
    match wire {
        WireMedication::Text(t) => Some(MedicationMention {
            text: text(Some(t))?,
            dose: None,
            frequency: None,
            route: None,
            code: None,
        }),
        WireMedication::Detailed {
            name,
            dosage,
            frequency,
            route,
        } => Some(MedicationMention {
            text: text(name)?,
            dose: scalar(&dosage),
            frequency: scalar(&frequency),
            route: scalar(&route),
            code: None,
        }),
    }
}

fn treatment(wire: WireTreatment) -> Option<Treatment> {
    let (description, procedure_code) = match wire {
        WireTreatment::Text(t) => (Some(t), None),
        WireTreatment::Detailed {
            description,
            procedure_code,
        } => (description, procedure_code),
    };
    Some(Treatment {
        description: text(description)?,
        procedure_code: scalar(&procedure_code).map(|c| c.to_uppercase()),
    })
}

fn follow_up(wire: WireFollowUp) -> Option<FollowUp> {
    let (description, timeframe) = match wire {
        WireFollowUp::Text(t) => (Some(t), None),
        WireFollowUp::Detailed { description, timeframe } => (description, timeframe),
    };
    Some(FollowUp {
        description: text(description)?,
        timeframe: scalar(&timeframe),
    })
}

/// Collapse case and whitespace for duplicate detection
pub fn normalize_mention(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Drop repeated mentions and order the rest by first occurrence in `source`.
///
/// Mentions not found in the source keep their relative order after the located ones.
pub fn order_by_first_mention<T, F>(items: Vec<T>, source: &str, text_of: F) -> Vec<T>
where
    F: Fn(&T) -> &str,
{
    let haystack = normalize_mention(source);
    let mut seen = HashSet::new();
    let mut keyed: Vec<(usize, usize, T)> = Vec::with_capacity(items.len());

    for (i, item) in items.into_iter().enumerate() {
        let needle = normalize_mention(text_of(&item));
        if !seen.insert(needle.clone()) {
            continue;
        }
        let position = haystack.find(&needle).unwrap_or(usize::MAX);
        keyed.push((position, i, item));
    }

    keyed.sort_by_key(|(position, i, _)| (*position, *i));
    keyed.into_iter().map(|(_, _, item)| item).collect()
}

fn finish(record: &mut ParsedRecord, source_text: &str) {
    record.diagnoses = order_by_first_mention(std::mem::take(&mut record.diagnoses), source_text, |d| &d.text);
    record.medications = order_by_first_mention(std::mem::take(&mut record.medications), source_text, |m| &m.text);
    record.treatments = order_by_first_mention(std::mem::take(&mut record.treatments), source_text, |t| &t.description);
    record.follow_up = order_by_first_mention(std::mem::take(&mut record.follow_up), source_text, |f| &f.description);
}
