//! End-to-end scenarios through the clinical pipeline facade

use async_trait::async_trait;
use medparse_common::config::AppConfig;
use medparse_common::documents::InMemoryDocumentStore;
use medparse_common::embeddings::HashingEmbedder;
use medparse_common::llm::ScriptedGenerator;
use medparse_common::{AppError, Document, Embedder, ErrorKind, Result};
use medparse_engine::{AskRequest, ClinicalPipeline, Collaborators};
use medparse_extraction::{CodingSystem, ExtractionStatus, NoteOperation, Resource, TerminologyCandidate, TerminologyService};
use medparse_search::INSUFFICIENT_EVIDENCE;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const KNEE_NOTE: &str = "Patient reports left knee pain after a fall today. Ibuprofen 600mg was started for the pain.";
const KNEE_EXTRACTION: &str = r#"{
    "patient": {"gender": "female"},
    "diagnoses": [{"description": "left knee pain", "status": "active"}],
    "medications": [{"name": "ibuprofen", "dosage": "600mg"}]
}"#;

/// Every lookup returns one fixed candidate per coding system
struct KneeTerminology;

#[async_trait]
impl TerminologyService for KneeTerminology {
    async fn lookup(&self, _text: &str, system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
        Ok(match system {
            CodingSystem::RxNorm => vec![TerminologyCandidate {
                code: "5640".to_string(),
                display: "ibuprofen".to_string(),
                score: 1.0,
            }],
            CodingSystem::Icd10Cm => vec![TerminologyCandidate {
                code: "M25.562".to_string(),
                display: "Pain in left knee".to_string(),
                score: 0.9,
            }],
        })
    }

    fn name(&self) -> &str {
        "knee"
    }
}

struct EmptyTerminology;

#[async_trait]
impl TerminologyService for EmptyTerminology {
    async fn lookup(&self, _text: &str, _system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
        Ok(Vec::new())
    }

    fn name(&self) -> &str {
        "empty"
    }
}

struct UnreachableTerminology;

#[async_trait]
impl TerminologyService for UnreachableTerminology {
    async fn lookup(&self, _text: &str, _system: CodingSystem) -> Result<Vec<TerminologyCandidate>> {
        Err(AppError::Upstream {
            service: "terminology".to_string(),
            message: "connection refused".to_string(),
        })
    }

    fn name(&self) -> &str {
        "unreachable"
    }
}

/// Hashing embedder that takes its time over batches
struct SlowEmbedder {
    inner: HashingEmbedder,
    delay: Duration,
}

#[async_trait]
impl Embedder for SlowEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.inner.embed(text).await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_batch(texts).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.chunking.max_chars = 60;
    config.chunking.overlap_fraction = 0.0;
    config.retrieval.min_score = -1.0;
    config.extraction.initial_backoff_ms = 1;
    config.extraction.max_backoff_ms = 2;
    config.synthesis.initial_backoff_ms = 1;
    config.synthesis.max_backoff_ms = 2;
    config
}

fn documents() -> Arc<InMemoryDocumentStore> {
    Arc::new(InMemoryDocumentStore::new().with_document("note-1", KNEE_NOTE))
}

fn pipeline_with(
    generator: Arc<ScriptedGenerator>,
    terminology: Arc<dyn TerminologyService>,
    embedder: Arc<dyn Embedder>,
    documents: Arc<InMemoryDocumentStore>,
) -> ClinicalPipeline {
    ClinicalPipeline::new(
        config(),
        Collaborators {
            documents,
            embedder,
            generator,
            terminology,
        },
    )
    .unwrap()
}

fn pipeline(generator: Arc<ScriptedGenerator>, terminology: Arc<dyn TerminologyService>) -> ClinicalPipeline {
    pipeline_with(generator, terminology, Arc::new(HashingEmbedder::new(64)), documents())
}

#[tokio::test]
async fn test_knee_pain_extraction_codes_ibuprofen() {
    let generator = Arc::new(ScriptedGenerator::always(KNEE_EXTRACTION));
    let pipeline = pipeline(generator, Arc::new(KneeTerminology));

    let extraction = assert_ok!(pipeline.extract_structured("note-1", true).await);
    assert!(extraction.is_complete());
    assert_eq!(extraction.diagnoses[0].text, "left knee pain");
    assert_eq!(extraction.medications[0].text, "ibuprofen");
    assert_eq!(extraction.medications[0].dose.as_deref(), Some("600mg"));

    let report = assert_ok!(pipeline.bundle_report("note-1").await);
    assert_eq!(report.extraction.medications[0].code.as_deref(), Some("5640"));
    assert_eq!(report.extraction.diagnoses[0].code.as_deref(), Some("M25.562"));
    assert!(report.mappings.medications[0].confidence > 0.0);
    assert!(report.mappings.diagnoses[0].confidence > 0.0);
    assert!(report.mappings.diagnoses[0].confidence <= 1.0);

    let statement = report
        .bundle
        .resources()
        .find_map(|r| match r {
            Resource::MedicationStatement(m) => Some(m),
            _ => None,
        })
        .unwrap();
    let coding = &statement.medication_codeable_concept.coding;
    assert_eq!(coding.len(), 1);
    assert_eq!(coding[0].code, "5640");
    assert_eq!(coding[0].system, CodingSystem::RxNorm.uri());
    assert_eq!(statement.dosage[0].text, "600mg");
}

#[tokio::test]
async fn test_no_terminology_match_leaves_code_null() {
    let generator = Arc::new(ScriptedGenerator::always(KNEE_EXTRACTION));
    let pipeline = pipeline(generator, Arc::new(EmptyTerminology));

    let report = assert_ok!(pipeline.bundle_report("note-1").await);
    assert_eq!(report.extraction.medications[0].code, None);
    assert_eq!(report.mappings.coded_count(), 0);
    assert_eq!(report.bundle.count("MedicationStatement"), 1);
}

#[tokio::test]
async fn test_unreachable_terminology_still_produces_bundle() {
    let generator = Arc::new(ScriptedGenerator::always(KNEE_EXTRACTION));
    let pipeline = pipeline(generator, Arc::new(UnreachableTerminology));

    let bundle = assert_ok!(pipeline.to_interchange_bundle("note-1").await);
    assert_eq!(bundle.resource_type, "Bundle");
    assert_eq!(bundle.count("Patient"), 1);
    assert_eq!(bundle.count("Encounter"), 1);
    assert_eq!(bundle.count("Condition"), 1);
    assert_eq!(bundle.count("MedicationStatement"), 1);
    for resource in bundle.resources() {
        if let Resource::MedicationStatement(m) = resource {
            assert!(m.medication_codeable_concept.coding.is_empty());
        }
    }
}

#[tokio::test]
async fn test_failing_generator_yields_incomplete_result_and_bundle() {
    let generator = Arc::new(ScriptedGenerator::failing());
    let pipeline = pipeline(generator.clone(), Arc::new(EmptyTerminology));

    let extraction = assert_ok!(pipeline.extract_structured("note-1", true).await);
    assert_eq!(extraction.status, ExtractionStatus::Incomplete);
    assert_eq!(generator.calls(), pipeline.config().extraction.max_attempts as usize);

    let bundle = assert_ok!(pipeline.to_interchange_bundle("note-1").await);
    assert_eq!(bundle.count("Patient"), 1);
    assert_eq!(bundle.count("Encounter"), 1);
    assert_eq!(bundle.count("Condition"), 0);
    bundle.validate_references().unwrap();
}

#[tokio::test]
async fn test_concurrent_extractions_share_one_generator_call() {
    let generator = Arc::new(ScriptedGenerator::always(KNEE_EXTRACTION).with_delay(Duration::from_millis(50)));
    let pipeline = Arc::new(pipeline(generator.clone(), Arc::new(EmptyTerminology)));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move { pipeline.extract_structured("note-1", true).await })
        })
        .collect();

    let results = futures::future::join_all(tasks).await;
    let first = results[0].as_ref().unwrap().as_ref().unwrap().extracted_at;
    for result in results {
        assert_eq!(result.unwrap().unwrap().extracted_at, first);
    }
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn test_retrieval_returns_all_chunks_when_k_exceeds_them() {
    let generator = Arc::new(ScriptedGenerator::new().with_fallback("Ibuprofen 600mg was started [1]."));
    let pipeline = pipeline(generator, Arc::new(EmptyTerminology));

    let handle = assert_ok!(pipeline.build_index("note-1").await);
    assert_eq!(handle.chunk_count, 2);
    assert!(handle.rebuilt);

    let request = AskRequest::new("What was started for the knee pain?").with_top_k(3);
    let response = assert_ok!(pipeline.retrieve_and_answer(request).await);
    assert_eq!(response.retrieved.len(), 2);
    assert!(response
        .retrieved
        .windows(2)
        .all(|w| w[0].score >= w[1].score));
    assert!(!response.answer.insufficient_evidence);
    assert_eq!(response.answer.citations.len(), 1);
}

#[tokio::test]
async fn test_index_is_idempotent_until_rebuilt() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::new()), Arc::new(EmptyTerminology));

    let first = assert_ok!(pipeline.build_index("note-1").await);
    let again = assert_ok!(pipeline.build_index("note-1").await);
    assert!(!again.rebuilt);
    assert_eq!(again.generation, first.generation);

    let rebuilt = assert_ok!(pipeline.rebuild_index("note-1").await);
    assert!(rebuilt.rebuilt);
    assert!(rebuilt.generation > first.generation);
}

#[tokio::test]
async fn test_retrieval_during_reindex_sees_one_generation() {
    let docs = documents();
    let embedder = Arc::new(SlowEmbedder {
        inner: HashingEmbedder::new(64),
        delay: Duration::from_millis(40),
    });
    let generator = Arc::new(ScriptedGenerator::new().with_fallback("See [1]."));
    let pipeline = Arc::new(pipeline_with(generator, Arc::new(EmptyTerminology), embedder, docs.clone()));

    let before = assert_ok!(pipeline.build_index("note-1").await);
    docs.insert(Document::new(
        "note-1",
        "Follow-up visit for the left knee. Swelling has resolved. Ibuprofen was stopped after two weeks.",
    ));

    let reindex = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.rebuild_index("note-1").await })
    };

    let mut seen = Vec::new();
    for _ in 0..6 {
        let response = assert_ok!(pipeline.retrieve_and_answer(AskRequest::new("knee ibuprofen").with_top_k(10)).await);
        let generations: Vec<u64> = response.retrieved.iter().map(|c| c.generation).collect();
        assert!(!generations.is_empty());
        assert!(generations.iter().all(|g| *g == generations[0]));
        seen.push(generations[0]);
        tokio::time::sleep(Duration::from_millis(15)).await;
    }

    let after = reindex.await.unwrap().unwrap();
    assert!(after.generation > before.generation);
    assert!(seen.iter().all(|g| *g == before.generation || *g == after.generation));
}

#[tokio::test]
async fn test_unindexed_scope_is_input_error() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::new()), Arc::new(EmptyTerminology));

    let err = assert_err!(pipeline.retrieve_and_answer(AskRequest::new("knee pain").with_corpus("nowhere")).await);
    assert_eq!(err.kind(), ErrorKind::Input);

    let err = assert_err!(pipeline.retrieve_and_answer(AskRequest::new("knee pain").with_top_k(0)).await);
    assert!(matches!(err, AppError::Validation { .. }));
}

#[tokio::test]
async fn test_generator_outage_answers_insufficient_evidence() {
    let pipeline = pipeline(Arc::new(ScriptedGenerator::failing()), Arc::new(EmptyTerminology));
    pipeline.build_index("note-1").await.unwrap();

    let response = assert_ok!(pipeline.retrieve_and_answer(AskRequest::new("What was prescribed?")).await);
    assert!(response.answer.insufficient_evidence);
    assert_eq!(response.answer.answer, INSUFFICIENT_EVIDENCE);
    assert!(!response.retrieved.is_empty());
}

#[tokio::test]
async fn test_bundle_references_resolve() {
    let extraction = r#"{
        "patient": {"name": "Jane Roe", "id": "MRN-12", "gender": "female", "dob": "1961-04-02"},
        "encounter_date": "2024-03-05",
        "vital_signs": {"blood_pressure": "150/95", "heart_rate": "88"},
        "diagnoses": [{"description": "left knee pain"}, {"description": "hypertension"}],
        "medications": [{"name": "ibuprofen", "dosage": "600mg"}, {"name": "lisinopril", "dosage": "10mg"}],
        "treatments": ["Tdap vaccine administered", "ice and rest"],
        "follow_up": [{"description": "recheck blood pressure", "timeframe": "4 weeks"}]
    }"#;
    let pipeline = pipeline(Arc::new(ScriptedGenerator::always(extraction)), Arc::new(KneeTerminology));

    let bundle = assert_ok!(pipeline.to_interchange_bundle("note-1").await);
    bundle.validate_references().unwrap();
    for resource in bundle.resources() {
        for reference in resource.references() {
            assert!(bundle.resolve(&reference.reference).is_some(), "{}", reference.reference);
        }
    }
    assert_eq!(bundle.count("Condition"), 2);
    assert_eq!(bundle.count("MedicationStatement"), 2);
    assert_eq!(bundle.count("Appointment"), 1);
    assert_eq!(bundle.count("Procedure"), 1);
    assert!(bundle.count("Observation") >= 2);
}

#[tokio::test]
async fn test_note_operations_through_facade() {
    let generator = Arc::new(ScriptedGenerator::new().with_responses(["Knee pain after a fall; ibuprofen started."]));
    let pipeline = pipeline(generator.clone(), Arc::new(EmptyTerminology));

    let out = assert_ok!(pipeline.run_note("note-1", NoteOperation::Summarize, true).await);
    assert_eq!(out.text, "Knee pain after a fall; ibuprofen started.");
    let cached = assert_ok!(pipeline.run_note("note-1", NoteOperation::Summarize, true).await);
    assert_eq!(cached.generated_at, out.generated_at);
    assert_eq!(generator.calls(), 1);

    let err = pipeline.run_note("missing", NoteOperation::Simplify, true).await.unwrap_err();
    assert!(matches!(err, AppError::DocumentNotFound { .. }));
}

#[tokio::test]
async fn test_state_round_trip() {
    let dir = std::env::temp_dir().join(format!("medparse-state-{}", std::process::id()));
    let generator = Arc::new(ScriptedGenerator::always(KNEE_EXTRACTION));
    let pipeline = pipeline(generator.clone(), Arc::new(EmptyTerminology));

    pipeline.build_index("note-1").await.unwrap();
    pipeline.extract_structured("note-1", true).await.unwrap();
    let saved = assert_ok!(pipeline.save_state(&dir).await);
    assert_eq!(saved.corpora, 1);
    assert_eq!(saved.extractions, 1);
    assert_eq!(saved.notes, 0);

    let restored_generator = Arc::new(ScriptedGenerator::always(KNEE_EXTRACTION));
    let restored = pipeline_with(
        restored_generator.clone(),
        Arc::new(EmptyTerminology),
        Arc::new(HashingEmbedder::new(64)),
        documents(),
    );
    let loaded = restored.load_state(&dir).await.unwrap();
    assert_eq!(loaded, saved);

    restored.extract_structured("note-1", true).await.unwrap();
    assert_eq!(restored_generator.calls(), 0);

    let handle = restored.build_index("note-1").await.unwrap();
    assert!(!handle.rebuilt);

    std::fs::remove_dir_all(&dir).ok();
}
