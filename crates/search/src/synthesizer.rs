//! Answer synthesizer - cited answers from retrieved chunks
//!
//! Provides:
//! - Budgeted, numbered context built from the best chunks first
//! - One generator call under the bounded retry state machine
//! - Citation extraction and confidence scoring
//! - A fixed insufficient-evidence answer when retrieval found nothing or
//!   the backend stayed unavailable

use crate::retrieval::{RetrievalResult, ScoredChunk};
use medparse_common::config::AppConfig;
use medparse_common::llm::{GenerationConstraints, TextGenerator};
use medparse_common::retry::{with_timeout, RetryPolicy};
use medparse_common::{AppError, Result};
use regex_lite::Regex;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, instrument, warn};

/// Answer returned when no usable evidence exists
pub const INSUFFICIENT_EVIDENCE: &str =
    "I don't have enough information to answer this question based on the provided context.";

const SYSTEM_PROMPT: &str = "You are a clinical documentation assistant. Answer strictly from the \
numbered context passages. Cite every statement with the passage numbers in square brackets, \
for example [1]. If the passages do not contain the answer, say so.";

/// Synthesized answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,

    /// Chunk ids the answer rests on
    pub supporting_chunk_ids: Vec<String>,

    /// Citation markers found in the answer
    pub citations: Vec<Citation>,

    /// Confidence score (0.0 - 1.0)
    pub confidence: f32,

    pub insufficient_evidence: bool,
}

impl Answer {
    pub fn insufficient() -> Self {
        Self {
            answer: INSUFFICIENT_EVIDENCE.to_string(),
            supporting_chunk_ids: Vec::new(),
            citations: Vec::new(),
            confidence: 0.0,
            insufficient_evidence: true,
        }
    }
}

/// Citation in a synthesized answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    /// Citation index (1-based, as numbered in the context)
    pub index: usize,
    pub chunk_id: String,
    pub document_id: String,
    /// Leading text of the cited chunk
    pub quote: String,
}

/// Synthesis parameters
#[derive(Debug, Clone)]
pub struct SynthesisSettings {
    /// Character budget for the numbered context block
    pub context_char_budget: usize,
    pub retry: RetryPolicy,
    pub constraints: GenerationConstraints,
}

impl SynthesisSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let s = &config.synthesis;
        Self {
            context_char_budget: s.context_char_budget,
            retry: RetryPolicy::new(s.max_attempts, s.initial_backoff_ms, s.max_backoff_ms, config.llm_timeout()),
            constraints: GenerationConstraints::from_config(&config.llm).with_system_prompt(SYSTEM_PROMPT),
        }
    }
}

impl Default for SynthesisSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Synthesizer for generating answers
pub struct AnswerSynthesizer {
    generator: Arc<dyn TextGenerator>,
    settings: SynthesisSettings,
}

impl AnswerSynthesizer {
    pub fn new(generator: Arc<dyn TextGenerator>, settings: SynthesisSettings) -> Self {
        Self { generator, settings }
    }

    /// Answer `query` from `retrieval`; never fails.
    ///
    /// An empty retrieval result short-circuits without calling the backend.
    #[instrument(skip_all, fields(chunks = retrieval.chunks.len()))]
    pub async fn answer(&self, query: &str, retrieval: &RetrievalResult) -> Answer {
        if retrieval.is_empty() {
            debug!("No evidence retrieved");
            return Answer::insufficient();
        }

        let (context, used) = build_context(&retrieval.chunks, self.settings.context_char_budget);
        if used.is_empty() {
            warn!(
                budget = self.settings.context_char_budget,
                "Context budget fits no evidence"
            );
            return Answer::insufficient();
        }
        let prompt = build_prompt(query, &context);

        let mut state = self.settings.retry.start("generator");
        while let Some(attempt) = state.next_attempt().await {
            match self.call(&prompt).await {
                Ok(text) => {
                    debug!(attempt, "Answer generated");
                    return compose(text, used);
                }
                Err(e) => state.record_failure(e),
            }
        }

        warn!(
            attempts = state.attempts(),
            error = ?state.last_error().map(|e| e.code()),
            "Generator unavailable, answering with insufficient evidence"
        );
        Answer::insufficient()
    }

    async fn call(&self, prompt: &str) -> Result<String> {
        let text = with_timeout(
            self.settings.retry.attempt_timeout,
            "generator",
            self.generator.complete(prompt, &self.settings.constraints),
        )
        .await?;

        if text.trim().is_empty() {
            return Err(AppError::MalformedOutput {
                message: "empty answer".to_string(),
            });
        }
        Ok(text.trim().to_string())
    }
}

/// Number chunks into a context block, best first, until `budget` characters are used.
///
/// A first chunk larger than the whole budget is truncated rather than dropped.
fn build_context(chunks: &[ScoredChunk], budget: usize) -> (String, &[ScoredChunk]) {
    let mut context = String::new();
    let mut used_chars = 0usize;
    let mut count = 0usize;

    for (i, chunk) in chunks.iter().enumerate() {
        let header = format!("[{}] (source {}, relevance {:.2})\n", i + 1, chunk.chunk_id, chunk.score);
        let block_chars = header.chars().count() + chunk.text.chars().count() + 2;

        if used_chars + block_chars > budget {
            let room = budget.saturating_sub(header.chars().count() + 2);
            if i == 0 && room > 0 {
                context.push_str(&header);
                context.extend(chunk.text.chars().take(room));
                context.push_str("\n\n");
                count = 1;
            }
            break;
        }

        context.push_str(&header);
        context.push_str(&chunk.text);
        context.push_str("\n\n");
        used_chars += block_chars;
        count += 1;
    }

    (context, &chunks[..count])
}

fn build_prompt(query: &str, context: &str) -> String {
    format!(
        "Answer the question using ONLY the context passages below. \
        Cite passages inline as [1], [2], etc. Do not make up information.\n\n\
        Context:\n{}\
        Question: {}\n\n\
        Answer:",
        context, query
    )
}

fn citation_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\[(\d+)\]").ok()).as_ref()
}

/// Citations in `answer` that point at a context chunk, ordered by index
fn extract_citations(answer: &str, contexts: &[ScoredChunk]) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();
    let Some(pattern) = citation_pattern() else {
        return citations;
    };

    for cap in pattern.captures_iter(answer) {
        let Some(idx) = cap.get(1).and_then(|m| m.as_str().parse::<usize>().ok()) else {
            continue;
        };
        if idx == 0 || idx > contexts.len() || citations.iter().any(|c| c.index == idx) {
            continue;
        }
        let ctx = &contexts[idx - 1];
        citations.push(Citation {
            index: idx,
            chunk_id: ctx.chunk_id.clone(),
            document_id: ctx.document_id.clone(),
            quote: ctx.text.chars().take(200).collect(),
        });
    }

    citations.sort_by_key(|c| c.index);
    citations
}

/// Combine citation coverage, mean supporting relevance and answer length
fn calculate_confidence(answer: &str, citations: &[Citation], supporting: &[&ScoredChunk], context_len: usize) -> f32 {
    if context_len == 0 || supporting.is_empty() {
        return 0.0;
    }

    let citation_coverage = citations.len() as f32 / context_len as f32;

    let avg_relevance = supporting
        .iter()
        .map(|c| c.score.clamp(0.0, 1.0))
        .sum::<f32>()
        / supporting.len() as f32;

    // Longer answers read as more grounded, up to a point.
    let length_factor = (answer.chars().count() as f32 / 500.0).min(1.0);

    (citation_coverage * 0.4 + avg_relevance * 0.4 + length_factor * 0.2).clamp(0.0, 1.0)
}

fn compose(answer: String, contexts: &[ScoredChunk]) -> Answer {
    let citations = extract_citations(&answer, contexts);

    let supporting: Vec<&ScoredChunk> = if citations.is_empty() {
        contexts.iter().collect()
    } else {
        citations.iter().map(|c| &contexts[c.index - 1]).collect()
    };

    let confidence = calculate_confidence(&answer, &citations, &supporting, contexts.len());

    Answer {
        supporting_chunk_ids: supporting.iter().map(|c| c.chunk_id.clone()).collect(),
        citations,
        confidence,
        insufficient_evidence: false,
        answer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medparse_common::llm::ScriptedGenerator;
    use std::time::Duration;

    fn chunk(id: &str, text: &str, score: f32) -> ScoredChunk {
        ScoredChunk {
            chunk_id: format!("{}#0", id),
            document_id: id.to_string(),
            ordinal: 0,
            text: text.to_string(),
            score,
            generation: 1,
        }
    }

    fn settings(budget: usize) -> SynthesisSettings {
        SynthesisSettings {
            context_char_budget: budget,
            retry: RetryPolicy::immediate(3, Duration::from_secs(1)),
            constraints: GenerationConstraints::default(),
        }
    }

    fn retrieval(chunks: Vec<ScoredChunk>) -> RetrievalResult {
        RetrievalResult {
            query: "q".to_string(),
            chunks,
        }
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_backend() {
        let generator = Arc::new(ScriptedGenerator::always("anything"));
        let synthesizer = AnswerSynthesizer::new(generator.clone(), settings(1000));

        let answer = synthesizer.answer("what?", &retrieval(vec![])).await;
        assert!(answer.insufficient_evidence);
        assert_eq!(answer.answer, INSUFFICIENT_EVIDENCE);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn test_cited_answer() {
        let generator = Arc::new(ScriptedGenerator::always(
            "The patient has knee pain [2] and takes ibuprofen [2][9].",
        ));
        let synthesizer = AnswerSynthesizer::new(generator.clone(), settings(1000));
        let result = retrieval(vec![
            chunk("a", "Hypertension, on lisinopril.", 0.9),
            chunk("b", "Knee pain. Ibuprofen 600mg.", 0.8),
        ]);

        let answer = synthesizer.answer("why ibuprofen?", &result).await;
        assert!(!answer.insufficient_evidence);
        assert_eq!(answer.supporting_chunk_ids, vec!["b#0"]);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].index, 2);
        assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn test_uncited_answer_is_supported_by_all_context() {
        let generator = Arc::new(ScriptedGenerator::always("Knee pain."));
        let synthesizer = AnswerSynthesizer::new(generator, settings(1000));
        let result = retrieval(vec![chunk("a", "x", 0.9), chunk("b", "y", 0.8)]);

        let answer = synthesizer.answer("q", &result).await;
        assert_eq!(answer.supporting_chunk_ids, vec!["a#0", "b#0"]);
        assert!(answer.citations.is_empty());
    }

    #[tokio::test]
    async fn test_backend_failure_degrades_after_retries() {
        let generator = Arc::new(ScriptedGenerator::failing());
        let synthesizer = AnswerSynthesizer::new(generator.clone(), settings(1000));

        let answer = synthesizer
            .answer("q", &retrieval(vec![chunk("a", "text", 0.9)]))
            .await;
        assert!(answer.insufficient_evidence);
        assert_eq!(generator.calls(), 3);
    }

    #[tokio::test]
    async fn test_blank_completion_is_retried() {
        let generator = Arc::new(
            ScriptedGenerator::new()
                .with_responses(["   ", "Answer [1]."]),
        );
        let synthesizer = AnswerSynthesizer::new(generator.clone(), settings(1000));

        let answer = synthesizer
            .answer("q", &retrieval(vec![chunk("a", "text", 0.9)]))
            .await;
        assert_eq!(answer.answer, "Answer [1].");
        assert_eq!(generator.calls(), 2);
    }

    #[test]
    fn test_context_budget_keeps_best_chunks_first() {
        let chunks = vec![
            chunk("a", &"a".repeat(50), 0.9),
            chunk("b", &"b".repeat(50), 0.8),
            chunk("c", &"c".repeat(50), 0.7),
        ];
        let (context, used) = build_context(&chunks, 200);
        assert_eq!(used.len(), 2);
        assert!(context.starts_with("[1]"));
        assert!(context.contains("[2]"));
        assert!(!context.contains("[3]"));
    }

    #[test]
    fn test_oversized_first_chunk_is_truncated() {
        let chunks = vec![chunk("a", &"a".repeat(500), 0.9)];
        let (context, used) = build_context(&chunks, 100);
        assert_eq!(used.len(), 1);
        assert!(context.chars().count() <= 100);
    }

    #[test]
    fn test_budget_below_header_skips_chunk() {
        let chunks = vec![chunk("a", &"a".repeat(500), 0.9)];
        let (context, used) = build_context(&chunks, 10);
        assert!(used.is_empty());
        assert!(context.is_empty());

        let header_only = "[1] (source a#0, relevance 0.90)\n".chars().count() + 2;
        let (context, used) = build_context(&chunks, header_only);
        assert!(used.is_empty());
        assert!(context.chars().count() <= header_only);
    }

    #[tokio::test]
    async fn test_budget_too_small_for_any_evidence_skips_backend() {
        let generator = Arc::new(ScriptedGenerator::always("Answer [1]."));
        let synthesizer = AnswerSynthesizer::new(generator.clone(), settings(5));

        let answer = synthesizer
            .answer("q", &retrieval(vec![chunk("a", "text", 0.9)]))
            .await;
        assert!(answer.insufficient_evidence);
        assert_eq!(generator.calls(), 0);
    }

    #[test]
    fn test_confidence_calculation() {
        let contexts = vec![chunk("a", "Content", 0.9)];
        let answer = compose("Based on the note [1], the knee hurts.".to_string(), &contexts);
        assert!(answer.confidence > 0.5);
        assert!(answer.confidence <= 1.0);
    }
}
