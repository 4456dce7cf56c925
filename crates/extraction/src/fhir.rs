//! Interchange bundle (FHIR R4 shaped)
//!
//! Turns an extraction result and its code mappings into a `collection`
//! bundle of cross-referencing resources. Identifiers are derived from the
//! document fingerprint so the same record always yields the same bundle.
//! A bundle that fails the referential-integrity pass is a defect and is
//! never returned.

use crate::resolver::{CodeMapping, CodeMappings};
use crate::schema::{DiagnosisMention, ExtractionResult, MedicationMention, Treatment, VitalSigns};
use crate::terminology::CodingSystem;
use medparse_common::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{error, info};
use uuid::Uuid;

const LOINC: &str = "http://loinc.org";
const UCUM: &str = "http://unitsofmeasure.org";
const OBSERVATION_CATEGORY: &str = "http://terminology.hl7.org/CodeSystem/observation-category";
const CONDITION_CLINICAL: &str = "http://terminology.hl7.org/CodeSystem/condition-clinical";
const ACT_CODE: &str = "http://terminology.hl7.org/CodeSystem/v3-ActCode";
const ICD10_PCS: &str = "http://hl7.org/fhir/sid/icd-10-pcs";

/// Treatment wording that marks something done during the encounter rather than advised
const PERFORMED_MARKERS: [&str; 5] = ["administered", "performed", "given", "vaccine", "injection"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reference {
    pub reference: String,
}

impl Reference {
    fn to(resource_type: &str, id: &str) -> Self {
        Self {
            reference: format!("{}/{}", resource_type, id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coding {
    pub system: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    fn text(text: &str) -> Self {
        Self {
            coding: Vec::new(),
            text: Some(text.to_string()),
        }
    }

    fn coded(system: &str, code: &str, display: &str) -> Self {
        Self {
            coding: vec![Coding {
                system: system.to_string(),
                code: code.to_string(),
                display: Some(display.to_string()),
            }],
            text: Some(display.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: String,
    pub system: String,
    pub code: String,
}

impl Quantity {
    fn ucum(value: f64, unit: &str, code: &str) -> Self {
        Self {
            value,
            unit: unit.to_string(),
            system: UCUM.to_string(),
            code: code.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identifier {
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanName {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Period {
    pub start: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationComponent {
    pub code: CodeableConcept,
    pub value_quantity: Quantity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dosage {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub actor: Reference,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Patient {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub identifier: Vec<Identifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name: Vec<HumanName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Encounter {
    pub id: String,
    pub status: String,
    pub class: Coding,
    pub subject: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<Period>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clinical_status: Option<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: Reference,
    pub encounter: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MedicationStatement {
    pub id: String,
    pub status: String,
    pub medication_codeable_concept: CodeableConcept,
    pub subject: Reference,
    pub context: Reference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dosage: Vec<Dosage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    pub id: String,
    pub status: String,
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: Reference,
    pub encounter: Reference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_quantity: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub component: Vec<ObservationComponent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Procedure {
    pub id: String,
    pub status: String,
    pub category: CodeableConcept,
    pub code: CodeableConcept,
    pub subject: Reference,
    pub encounter: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appointment {
    pub id: String,
    pub status: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub participant: Vec<Participant>,
}

/// Typed resource, tagged by `resourceType`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "resourceType")]
pub enum Resource {
    Patient(Patient),
    Encounter(Encounter),
    Condition(Condition),
    MedicationStatement(MedicationStatement),
    Observation(Observation),
    Procedure(Procedure),
    Appointment(Appointment),
}

impl Resource {
    pub fn resource_type(&self) -> &'static str {
        match self {
            Resource::Patient(_) => "Patient",
            Resource::Encounter(_) => "Encounter",
            Resource::Condition(_) => "Condition",
            Resource::MedicationStatement(_) => "MedicationStatement",
            Resource::Observation(_) => "Observation",
            Resource::Procedure(_) => "Procedure",
            Resource::Appointment(_) => "Appointment",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Resource::Patient(r) => &r.id,
            Resource::Encounter(r) => &r.id,
            Resource::Condition(r) => &r.id,
            Resource::MedicationStatement(r) => &r.id,
            Resource::Observation(r) => &r.id,
            Resource::Procedure(r) => &r.id,
            Resource::Appointment(r) => &r.id,
        }
    }

    /// `Type/id` form used by references
    pub fn local_reference(&self) -> String {
        format!("{}/{}", self.resource_type(), self.id())
    }

    /// Every outgoing reference of this resource
    pub fn references(&self) -> Vec<&Reference> {
        match self {
            Resource::Patient(_) => Vec::new(),
            Resource::Encounter(r) => vec![&r.subject],
            Resource::Condition(r) => vec![&r.subject, &r.encounter],
            Resource::MedicationStatement(r) => vec![&r.subject, &r.context],
            Resource::Observation(r) => vec![&r.subject, &r.encounter],
            Resource::Procedure(r) => vec![&r.subject, &r.encounter],
            Resource::Appointment(r) => r.participant.iter().map(|p| &p.actor).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleEntry {
    pub full_url: String,
    pub resource: Resource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterchangeBundle {
    #[serde(rename = "resourceType")]
    pub resource_type: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub entry: Vec<BundleEntry>,
}

impl InterchangeBundle {
    fn new(id: String) -> Self {
        Self {
            resource_type: "Bundle".to_string(),
            id,
            kind: "collection".to_string(),
            entry: Vec::new(),
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.entry.iter().map(|e| &e.resource)
    }

    pub fn count(&self, resource_type: &str) -> usize {
        self.resources()
            .filter(|r| r.resource_type() == resource_type)
            .count()
    }

    /// Resolve a `Type/id` reference within the bundle
    pub fn resolve(&self, reference: &str) -> Option<&Resource> {
        self.resources().find(|r| r.local_reference() == reference)
    }

    /// Check that resource ids are unique and every reference resolves in the bundle
    pub fn validate_references(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut targets = HashSet::new();
        for resource in self.resources() {
            if !ids.insert(resource.id()) {
                let err = AppError::DuplicateResourceId {
                    id: resource.id().to_string(),
                };
                error!(bundle = %self.id, error = %err, "Bundle integrity violated");
                return Err(err);
            }
            targets.insert(resource.local_reference());
        }

        for resource in self.resources() {
            for reference in resource.references() {
                if !targets.contains(&reference.reference) {
                    let err = AppError::DanglingReference {
                        source_id: resource.local_reference(),
                        reference: reference.reference.clone(),
                    };
                    error!(bundle = %self.id, error = %err, "Bundle integrity violated");
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Build and validate the bundle for one extraction result.
///
/// Mappings are matched to mentions by position and mention text; an
/// unmatched or uncoded mention still yields its resource, text only.
pub fn transform(result: &ExtractionResult, mappings: &CodeMappings) -> Result<InterchangeBundle> {
    let fp = short_fingerprint(&result.fingerprint);
    let patient_id = patient_id(result, fp);
    let encounter_id = format!("encounter-{}", fp);
    let subject = || Reference::to("Patient", &patient_id);
    let encounter = || Reference::to("Encounter", &encounter_id);

    let mut resources = vec![
        Resource::Patient(patient(result, &patient_id)),
        Resource::Encounter(Encounter {
            id: encounter_id.clone(),
            status: "finished".to_string(),
            class: Coding {
                system: ACT_CODE.to_string(),
                code: "AMB".to_string(),
                display: Some("ambulatory".to_string()),
            },
            subject: subject(),
            period: result.encounter_date.map(|d| Period {
                start: d.format("%Y-%m-%d").to_string(),
            }),
        }),
    ];

    for (i, diagnosis) in result.diagnoses.iter().enumerate() {
        let mapping = aligned(&mappings.diagnoses, i, &diagnosis.text);
        resources.push(Resource::Condition(Condition {
            id: format!("condition-{}", i + 1),
            clinical_status: diagnosis.status.as_deref().map(clinical_status),
            code: concept(CodingSystem::Icd10Cm, &diagnosis.text, mapping, diagnosis_code(diagnosis)),
            subject: subject(),
            encounter: encounter(),
        }));
    }

    for (i, medication) in result.medications.iter().enumerate() {
        let mapping = aligned(&mappings.medications, i, &medication.text);
        resources.push(Resource::MedicationStatement(MedicationStatement {
            id: format!("medication-{}", i + 1),
            status: "active".to_string(),
            medication_codeable_concept: concept(
                CodingSystem::RxNorm,
                &medication.text,
                mapping,
                medication_code(medication),
            ),
            subject: subject(),
            context: encounter(),
            dosage: dosage_text(medication)
                .map(|text| vec![Dosage { text }])
                .unwrap_or_default(),
        }));
    }

    if let Some(vitals) = &result.vital_signs {
        for (id, code, value_quantity, component) in vital_observations(vitals) {
            resources.push(Resource::Observation(Observation {
                id: format!("observation-{}", id),
                status: "final".to_string(),
                category: vec![category("vital-signs", "Vital Signs")],
                code,
                subject: subject(),
                encounter: encounter(),
                value_quantity,
                value_string: None,
                component,
            }));
        }
    }

    for (i, (name, value)) in result.lab_results.iter().enumerate() {
        resources.push(Resource::Observation(Observation {
            id: format!("observation-lab-{}", i + 1),
            status: "final".to_string(),
            category: vec![category("laboratory", "Laboratory")],
            code: CodeableConcept::text(name),
            subject: subject(),
            encounter: encounter(),
            value_quantity: None,
            value_string: Some(value.clone()),
            component: Vec::new(),
        }));
    }

    let performed = result.treatments.iter().filter(|t| was_performed(t));
    for (i, treatment) in performed.enumerate() {
        let code = match &treatment.procedure_code {
            Some(code) => CodeableConcept::coded(ICD10_PCS, code, &treatment.description),
            None => CodeableConcept::text(&treatment.description),
        };
        resources.push(Resource::Procedure(Procedure {
            id: format!("procedure-{}", i + 1),
            status: "completed".to_string(),
            category: CodeableConcept::text("Prevention"),
            code,
            subject: subject(),
            encounter: encounter(),
        }));
    }

    for (i, follow_up) in result.follow_up.iter().enumerate() {
        resources.push(Resource::Appointment(Appointment {
            id: format!("appointment-{}", i + 1),
            status: "proposed".to_string(),
            description: follow_up.description.clone(),
            comment: follow_up
                .timeframe
                .as_ref()
                .map(|t| format!("Timeframe: {}", t)),
            participant: vec![Participant {
                actor: subject(),
                status: "accepted".to_string(),
            }],
        }));
    }

    let mut bundle = InterchangeBundle::new(format!("bundle-{}", fp));
    bundle.entry = resources
        .into_iter()
        .map(|resource| BundleEntry {
            full_url: full_url(&result.fingerprint, &resource),
            resource,
        })
        .collect();

    bundle.validate_references()?;

    info!(
        document_id = %result.document_id,
        bundle = %bundle.id,
        resources = bundle.entry.len(),
        conditions = bundle.count("Condition"),
        medications = bundle.count("MedicationStatement"),
        procedures = bundle.count("Procedure"),
        coded = mappings.coded_count(),
        "Interchange bundle built"
    );
    Ok(bundle)
}

fn short_fingerprint(fingerprint: &str) -> &str {
    fingerprint.get(..12).unwrap_or(fingerprint)
}

fn full_url(fingerprint: &str, resource: &Resource) -> String {
    let name = format!("{}/{}", fingerprint, resource.local_reference());
    format!("urn:uuid:{}", Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes()))
}

/// Ids generated for other resource types; a patient identifier must not shadow them
const GENERATED_PREFIXES: [&str; 7] = [
    "bundle-",
    "encounter-",
    "condition-",
    "medication-",
    "observation-",
    "procedure-",
    "appointment-",
];

/// Restrict to the FHIR id alphabet `[A-Za-z0-9-.]`, at most 64 characters
fn sanitize_id(raw: &str) -> String {
    let mut id = String::with_capacity(raw.len());
    for c in raw.trim().chars() {
        let c = if c.is_ascii_alphanumeric() || c == '.' { c } else { '-' };
        if c == '-' && id.ends_with('-') {
            continue;
        }
        id.push(c);
    }
    id.trim_matches('-').chars().take(64).collect()
}

fn patient_id(result: &ExtractionResult, fp: &str) -> String {
    match result.patient.identifiers.first().map(|raw| sanitize_id(raw)) {
        Some(id) if !id.is_empty() => {
            if GENERATED_PREFIXES.iter().any(|p| id.starts_with(p)) {
                format!("patient-{}", id).chars().take(64).collect()
            } else {
                id
            }
        }
        _ => format!("patient-{}", fp),
    }
}

fn patient(result: &ExtractionResult, id: &str) -> Patient {
    let demographics = &result.patient;
    let gender = demographics.gender.as_deref().map(|g| match g {
        "male" | "m" | "man" => "male",
        "female" | "f" | "woman" => "female",
        "other" => "other",
        _ => "unknown",
    });

    Patient {
        id: id.to_string(),
        identifier: demographics
            .identifiers
            .iter()
            .map(|value| Identifier { value: value.clone() })
            .collect(),
        name: demographics
            .name
            .iter()
            .map(|text| HumanName { text: text.clone() })
            .collect(),
        gender: gender.map(str::to_string),
        birth_date: demographics
            .date_of_birth
            .map(|d| d.format("%Y-%m-%d").to_string()),
    }
}

/// Mapping for mention `index`, provided it was made for the same text
fn aligned<'a>(mappings: &'a [CodeMapping], index: usize, mention: &str) -> Option<&'a CodeMapping> {
    mappings.get(index).filter(|m| m.mention == mention)
}

fn was_performed(treatment: &Treatment) -> bool {
    let description = treatment.description.to_lowercase();
    PERFORMED_MARKERS.iter().any(|marker| description.contains(marker))
}

fn diagnosis_code(diagnosis: &DiagnosisMention) -> Option<&str> {
    diagnosis.code.as_deref()
}

fn medication_code(medication: &MedicationMention) -> Option<&str> {
    medication.code.as_deref()
}

/// Coded concept when a code is known, otherwise free text only
fn concept(system: CodingSystem, text: &str, mapping: Option<&CodeMapping>, fallback_code: Option<&str>) -> CodeableConcept {
    let coded = mapping
        .and_then(|m| m.code.as_deref().map(|code| (code, m.display.as_deref().unwrap_or(text))))
        .or_else(|| fallback_code.map(|code| (code, text)));

    match coded {
        Some((code, display)) => CodeableConcept {
            text: Some(text.to_string()),
            ..CodeableConcept::coded(system.uri(), code, display)
        },
        None => CodeableConcept::text(text),
    }
}

fn clinical_status(status: &str) -> CodeableConcept {
    let code = match status {
        "resolved" => "resolved",
        "inactive" => "inactive",
        "remission" => "remission",
        "recurrence" => "recurrence",
        _ => "active",
    };
    CodeableConcept {
        coding: vec![Coding {
            system: CONDITION_CLINICAL.to_string(),
            code: code.to_string(),
            display: None,
        }],
        text: None,
    }
}

fn dosage_text(medication: &MedicationMention) -> Option<String> {
    let parts: Vec<String> = [
        medication.dose.clone(),
        medication.route.as_ref().map(|r| format!("Route: {}", r)),
        medication.frequency.as_ref().map(|f| format!("Frequency: {}", f)),
    ]
    .into_iter()
    .flatten()
    .collect();
    (!parts.is_empty()).then(|| parts.join("; "))
}

fn category(code: &str, display: &str) -> CodeableConcept {
    CodeableConcept {
        coding: vec![Coding {
            system: OBSERVATION_CATEGORY.to_string(),
            code: code.to_string(),
            display: Some(display.to_string()),
        }],
        text: None,
    }
}

fn loinc(code: &str, display: &str, text: &str) -> CodeableConcept {
    CodeableConcept {
        text: Some(text.to_string()),
        ..CodeableConcept::coded(LOINC, code, display)
    }
}

/// Leading decimal number of a measurement such as "88 bpm" or "98.6F"
fn leading_number(text: &str) -> Option<f64> {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    text[..end].parse().ok()
}

/// Temperature in the unit written after the number; values without one are
/// read as Celsius below 45 and Fahrenheit otherwise
fn temperature(raw: &str, value: f64) -> Quantity {
    let rest = raw
        .trim_start()
        .trim_start_matches(|c: char| c.is_ascii_digit() || c == '.')
        .to_ascii_lowercase();
    let unit = rest
        .split(|c: char| !c.is_ascii_alphabetic())
        .filter(|word| !word.is_empty())
        .find(|word| !matches!(*word, "deg" | "degree" | "degrees"));

    match unit {
        Some("c" | "celsius" | "centigrade") => Quantity::ucum(value, "C", "Cel"),
        Some("f" | "fahrenheit") => Quantity::ucum(value, "F", "[degF]"),
        _ if value < 45.0 => Quantity::ucum(value, "C", "Cel"),
        _ => Quantity::ucum(value, "F", "[degF]"),
    }
}

type VitalObservation = (&'static str, CodeableConcept, Option<Quantity>, Vec<ObservationComponent>);

fn vital_observations(vitals: &VitalSigns) -> Vec<VitalObservation> {
    let mut out = Vec::new();

    if let Some(bp) = &vitals.blood_pressure {
        if let Some((sys, dia)) = bp.split_once('/') {
            if let (Some(sys), Some(dia)) = (leading_number(sys), leading_number(dia)) {
                let component = |code: &str, display: &str, value: f64| ObservationComponent {
                    code: CodeableConcept::coded(LOINC, code, display),
                    value_quantity: Quantity::ucum(value, "mmHg", "mm[Hg]"),
                };
                out.push((
                    "bp",
                    loinc("85354-9", "Blood pressure panel", "Blood Pressure"),
                    None,
                    vec![
                        component("8480-6", "Systolic blood pressure", sys),
                        component("8462-4", "Diastolic blood pressure", dia),
                    ],
                ));
            }
        }
    }

    let lower = |s: &str| s.to_ascii_lowercase();

    if let Some(v) = vitals.heart_rate.as_deref().and_then(leading_number) {
        out.push((
            "hr",
            loinc("8867-4", "Heart rate", "Heart Rate"),
            Some(Quantity::ucum(v, "beats/minute", "/min")),
            Vec::new(),
        ));
    }
    if let Some(v) = vitals.respiratory_rate.as_deref().and_then(leading_number) {
        out.push((
            "rr",
            loinc("9279-1", "Respiratory rate", "Respiratory Rate"),
            Some(Quantity::ucum(v, "breaths/minute", "/min")),
            Vec::new(),
        ));
    }
    if let Some(raw) = &vitals.temperature {
        if let Some(v) = leading_number(raw) {
            out.push((
                "temp",
                loinc("8310-5", "Body temperature", "Temperature"),
                Some(temperature(raw, v)),
                Vec::new(),
            ));
        }
    }
    if let Some(raw) = &vitals.height {
        if let Some(v) = leading_number(raw) {
            let quantity = if lower(raw).contains("cm") {
                Quantity::ucum(v, "cm", "cm")
            } else {
                Quantity::ucum(v, "in", "[in_i]")
            };
            out.push(("height", loinc("8302-2", "Body height", "Height"), Some(quantity), Vec::new()));
        }
    }
    if let Some(raw) = &vitals.weight {
        if let Some(v) = leading_number(raw) {
            let quantity = if lower(raw).contains("kg") {
                Quantity::ucum(v, "kg", "kg")
            } else {
                Quantity::ucum(v, "lbs", "[lb_av]")
            };
            out.push(("weight", loinc("29463-7", "Body weight", "Weight"), Some(quantity), Vec::new()));
        }
    }
    if let Some(v) = vitals.bmi {
        out.push((
            "bmi",
            loinc("39156-5", "Body mass index (BMI)", "BMI"),
            Some(Quantity::ucum(v, "kg/m2", "kg/m2")),
            Vec::new(),
        ));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MappingStatus;
    use crate::schema::{ExtractionStatus, FollowUp, ParsedRecord};
    use chrono::NaiveDate;

    const FP: &str = "0123456789abcdef0123456789abcdef0123456789abcdef0123456789abcdef";

    fn record() -> ExtractionResult {
        let mut parsed = ParsedRecord::default();
        parsed.patient.identifiers = vec!["MRN 0042/A".to_string()];
        parsed.patient.gender = Some("female".to_string());
        parsed.encounter_date = NaiveDate::from_ymd_opt(2024, 3, 5);
        parsed.diagnoses = vec![DiagnosisMention {
            text: "knee pain".to_string(),
            status: Some("active".to_string()),
            code: None,
        }];
        parsed.medications = vec![MedicationMention {
            text: "ibuprofen".to_string(),
            dose: Some("600mg".to_string()),
            frequency: Some("TID".to_string()),
            route: Some("PO".to_string()),
            code: None,
        }];
        parsed.vital_signs = Some(VitalSigns {
            blood_pressure: Some("140/90 mmHg".to_string()),
            heart_rate: Some("88 bpm".to_string()),
            weight: Some("80 kg".to_string()),
            ..VitalSigns::default()
        });
        parsed.lab_results.insert("HbA1c".to_string(), "6.1%".to_string());
        parsed.follow_up = vec![FollowUp {
            description: "Recheck knee".to_string(),
            timeframe: Some("2 weeks".to_string()),
        }];
        ExtractionResult::from_record("note-1", FP, parsed, ExtractionStatus::Complete, 1)
    }

    fn mapping(mention: &str, system: CodingSystem, code: Option<&str>) -> CodeMapping {
        CodeMapping {
            mention: mention.to_string(),
            normalized: mention.to_string(),
            system,
            code: code.map(str::to_string),
            display: code.map(|_| "Ibuprofen".to_string()),
            confidence: if code.is_some() { 1.0 } else { 0.0 },
            status: if code.is_some() {
                MappingStatus::Matched
            } else {
                MappingStatus::Unavailable
            },
        }
    }

    fn mappings() -> CodeMappings {
        CodeMappings {
            diagnoses: vec![mapping("knee pain", CodingSystem::Icd10Cm, None)],
            medications: vec![mapping("ibuprofen", CodingSystem::RxNorm, Some("5640"))],
        }
    }

    #[test]
    fn test_bundle_contents_and_integrity() {
        let bundle = transform(&record(), &mappings()).unwrap();

        assert_eq!(bundle.count("Patient"), 1);
        assert_eq!(bundle.count("Encounter"), 1);
        assert_eq!(bundle.count("Condition"), 1);
        assert_eq!(bundle.count("MedicationStatement"), 1);
        assert_eq!(bundle.count("Observation"), 4);
        assert_eq!(bundle.count("Appointment"), 1);

        for resource in bundle.resources() {
            for reference in resource.references() {
                assert!(bundle.resolve(&reference.reference).is_some());
            }
        }

        let patient = bundle.resolve("Patient/MRN-0042-A").unwrap();
        assert_eq!(patient.id(), "MRN-0042-A");
    }

    #[test]
    fn test_uncoded_condition_keeps_text() {
        let bundle = transform(&record(), &mappings()).unwrap();
        match bundle.resolve("Condition/condition-1").unwrap() {
            Resource::Condition(c) => {
                assert!(c.code.coding.is_empty());
                assert_eq!(c.code.text.as_deref(), Some("knee pain"));
            }
            other => panic!("unexpected resource {:?}", other),
        }
        match bundle.resolve("MedicationStatement/medication-1").unwrap() {
            Resource::MedicationStatement(m) => {
                assert_eq!(m.medication_codeable_concept.coding[0].code, "5640");
                assert_eq!(m.medication_codeable_concept.coding[0].system, CodingSystem::RxNorm.uri());
                assert_eq!(m.dosage[0].text, "600mg; Route: PO; Frequency: TID");
            }
            other => panic!("unexpected resource {:?}", other),
        }
    }

    #[test]
    fn test_misaligned_mapping_is_ignored() {
        let mut m = mappings();
        m.medications[0].mention = "acetaminophen".to_string();
        let bundle = transform(&record(), &m).unwrap();
        match bundle.resolve("MedicationStatement/medication-1").unwrap() {
            Resource::MedicationStatement(m) => assert!(m.medication_codeable_concept.coding.is_empty()),
            other => panic!("unexpected resource {:?}", other),
        }
    }

    #[test]
    fn test_empty_record_still_has_patient_and_encounter() {
        let empty = ExtractionResult::from_record("n", FP, ParsedRecord::default(), ExtractionStatus::Incomplete, 3);
        let bundle = transform(&empty, &CodeMappings::default()).unwrap();
        assert_eq!(bundle.entry.len(), 2);
        assert!(bundle.resolve("Patient/patient-0123456789ab").is_some());
        assert!(bundle.resolve("Encounter/encounter-0123456789ab").is_some());
    }

    #[test]
    fn test_transform_is_deterministic() {
        let a = serde_json::to_string(&transform(&record(), &mappings()).unwrap()).unwrap();
        let b = serde_json::to_string(&transform(&record(), &mappings()).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wire_shape() {
        let bundle = transform(&record(), &mappings()).unwrap();
        let json = serde_json::to_value(&bundle).unwrap();
        assert_eq!(json["resourceType"], "Bundle");
        assert_eq!(json["type"], "collection");
        assert!(json["entry"][0]["fullUrl"].as_str().unwrap().starts_with("urn:uuid:"));
        assert_eq!(json["entry"][0]["resource"]["resourceType"], "Patient");
        assert_eq!(json["entry"][1]["resource"]["period"]["start"], "2024-03-05");

        let bp = bundle.resolve("Observation/observation-bp").unwrap();
        let bp_json = serde_json::to_value(bp).unwrap();
        assert_eq!(bp_json["component"][0]["valueQuantity"]["value"], 140.0);
        assert_eq!(bp_json["component"][1]["valueQuantity"]["value"], 90.0);

        let back: InterchangeBundle = serde_json::from_value(json).unwrap();
        assert_eq!(back, bundle);
    }

    #[test]
    fn test_integrity_violations_are_defects() {
        let mut bundle = transform(&record(), &mappings()).unwrap();
        if let Resource::Condition(c) = &mut bundle.entry[2].resource {
            c.subject = Reference::to("Patient", "ghost");
        }
        let err = bundle.validate_references().unwrap_err();
        assert!(matches!(err, AppError::DanglingReference { .. }));
        assert!(err.is_defect());

        let mut bundle = transform(&record(), &mappings()).unwrap();
        let copy = bundle.entry[3].clone();
        bundle.entry.push(copy);
        assert!(matches!(
            bundle.validate_references().unwrap_err(),
            AppError::DuplicateResourceId { .. }
        ));
    }

    #[test]
    fn test_patient_id_sanitizing() {
        assert_eq!(sanitize_id("  MRN 0042/A "), "MRN-0042-A");
        assert_eq!(sanitize_id("###"), "");
        let mut r = record();
        r.patient.identifiers = vec!["condition-1".to_string()];
        assert_eq!(patient_id(&r, "abc"), "patient-condition-1");
        r.patient.identifiers = vec!["***".to_string()];
        assert_eq!(patient_id(&r, "abc"), "patient-abc");
    }

    #[test]
    fn test_performed_treatments_become_procedures() {
        let mut r = record();
        r.treatments = vec![
            Treatment {
                description: "Ice and rest".to_string(),
                procedure_code: None,
            },
            Treatment {
                description: "Tdap vaccine administered".to_string(),
                procedure_code: Some("3E0234Z".to_string()),
            },
            Treatment {
                description: "Corticosteroid injection, left knee".to_string(),
                procedure_code: None,
            },
        ];
        let bundle = transform(&r, &mappings()).unwrap();
        assert_eq!(bundle.count("Procedure"), 2);
        bundle.validate_references().unwrap();

        match bundle.resolve("Procedure/procedure-1").unwrap() {
            Resource::Procedure(p) => {
                assert_eq!(p.status, "completed");
                assert_eq!(p.subject.reference, "Patient/MRN-0042-A");
                assert_eq!(p.code.coding[0].system, ICD10_PCS);
                assert_eq!(p.code.coding[0].code, "3E0234Z");
                assert_eq!(p.code.text.as_deref(), Some("Tdap vaccine administered"));
            }
            other => panic!("unexpected resource {:?}", other),
        }
        match bundle.resolve("Procedure/procedure-2").unwrap() {
            Resource::Procedure(p) => assert!(p.code.coding.is_empty()),
            other => panic!("unexpected resource {:?}", other),
        }

        let json = serde_json::to_value(bundle.resolve("Procedure/procedure-1").unwrap()).unwrap();
        assert_eq!(json["resourceType"], "Procedure");
        assert_eq!(json["category"]["text"], "Prevention");
    }

    #[test]
    fn test_temperature_prefers_written_unit() {
        let celsius = |q: &Quantity| q.code == "Cel";
        assert!(!celsius(&temperature("37 F", 37.0)));
        assert!(celsius(&temperature("101.2 °C", 101.2)));
        assert!(celsius(&temperature("37.2C", 37.2)));
        assert!(celsius(&temperature("38 degrees celsius", 38.0)));
        assert!(!celsius(&temperature("98.6 deg F oral", 98.6)));

        // No unit written: the value decides
        assert!(celsius(&temperature("38.5 orally", 38.5)));
        assert!(!celsius(&temperature("99.1", 99.1)));
    }

    #[test]
    fn test_leading_number() {
        assert_eq!(leading_number("98.6F"), Some(98.6));
        assert_eq!(leading_number(" 72 bpm"), Some(72.0));
        assert_eq!(leading_number("normal"), None);
    }
}
