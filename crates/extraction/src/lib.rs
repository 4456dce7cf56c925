//! medparse extraction
//!
//! Document-to-record flow:
//! 1. Drive the generative backend with a fixed schema and coerce its output
//! 2. Resolve diagnosis and medication mentions to terminology codes
//! 3. Emit a cross-referenced interchange bundle
//!
//! Note assistant operations (summary, patient overview, plain-language
//! rewrite) share the same backend and cache machinery.

pub mod fhir;
pub mod notes;
pub mod pipeline;
pub mod resolver;
pub mod schema;
pub mod terminology;

pub use fhir::{transform, BundleEntry, InterchangeBundle, Resource};
pub use notes::{NoteAssistant, NoteOperation, NoteOutput};
pub use pipeline::{ExtractionSettings, StructuredExtractor};
pub use resolver::{CodeMapping, CodeMappings, CodeResolver, MappingStatus, ResolutionSession};
pub use schema::{
    Demographics, DiagnosisMention, ExtractionResult, ExtractionStatus, FollowUp, MedicationMention,
    ParsedRecord, SchemaError, Treatment, VitalSigns,
};
pub use terminology::{
    create_terminology, CodingSystem, FallbackTerminology, NlmTerminologyClient, StaticTerminology, TerminologyCandidate,
    TerminologyService,
};
