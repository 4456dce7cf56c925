//! Generative text backend abstraction
//!
//! Provides:
//! - `TextGenerator` trait used by synthesis, extraction and note operations
//! - OpenAI-compatible chat completions client
//! - `ScriptedGenerator` replaying queued responses (offline runs and tests)

use crate::config::LlmConfig;
use crate::errors::{AppError, Result};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Per-call generation constraints
#[derive(Debug, Clone)]
pub struct GenerationConstraints {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Ask the backend for a single JSON object
    pub json_output: bool,
    pub system_prompt: Option<String>,
}

impl Default for GenerationConstraints {
    fn default() -> Self {
        Self {
            max_tokens: 1024,
            temperature: 0.0,
            json_output: false,
            system_prompt: None,
        }
    }
}

impl GenerationConstraints {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            ..Self::default()
        }
    }

    pub fn json(mut self) -> Self {
        self.json_output = true;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

/// Trait for generative text backends
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// Complete a prompt; may fail with timeout, rate-limit or upstream errors
    async fn complete(&self, prompt: &str, constraints: &GenerationConstraints) -> Result<String>;

    /// Model identifier, part of cache keys
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat completions client
pub struct OpenAIChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

const SERVICE: &str = "generator";

impl OpenAIChatClient {
    pub fn new(api_key: String, config: &LlmConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string()),
            api_key,
            model: config.model.clone(),
            timeout,
        })
    }

    async fn call(&self, prompt: &str, constraints: &GenerationConstraints) -> Result<String> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &constraints.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: constraints.max_tokens,
            temperature: constraints.temperature,
            response_format: constraints
                .json_output
                .then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
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

        let chat_response: ChatResponse = response.json().await.map_err(|e| AppError::MalformedOutput {
            message: format!("unreadable completion: {}", e),
        })?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::MalformedOutput {
                message: "empty completion".to_string(),
            })
    }
}

#[async_trait]
impl TextGenerator for OpenAIChatClient {
    async fn complete(&self, prompt: &str, constraints: &GenerationConstraints) -> Result<String> {
        let start = Instant::now();
        let result = self.call(prompt, constraints).await;
        metrics::record_generation(start.elapsed().as_secs_f64(), &self.model, result.is_ok());
        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Generator replaying queued responses in order.
///
/// Once the queue is empty the fallback response is returned, or an
/// `Upstream` error when no fallback is set.
pub struct ScriptedGenerator {
    model: String,
    queue: Mutex<VecDeque<Result<String>>>,
    fallback: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new() -> Self {
        Self {
            model: "scripted".to_string(),
            queue: Mutex::new(VecDeque::new()),
            fallback: None,
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer every call with `response`
    pub fn always(response: impl Into<String>) -> Self {
        Self::new().with_fallback(response)
    }

    /// Fail every call with a transient upstream error
    pub fn failing() -> Self {
        Self::new()
    }

    pub fn with_responses<I, S>(self, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for r in responses {
            self.push(Ok(r.into()));
        }
        self
    }

    pub fn with_fallback(mut self, response: impl Into<String>) -> Self {
        self.fallback = Some(response.into());
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn push(&self, response: Result<String>) {
        self.queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push_back(response);
    }

    /// Number of `complete` calls so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Prompts received, in call order
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for ScriptedGenerator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TextGenerator for ScriptedGenerator {
    async fn complete(&self, prompt: &str, _constraints: &GenerationConstraints) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(prompt.to_string());

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let next = self.queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
        match next {
            Some(response) => response,
            None => self.fallback.clone().ok_or_else(|| AppError::Upstream {
                service: SERVICE.to_string(),
                message: "no scripted response".to_string(),
            }),
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Create a generator based on configuration
pub fn create_generator(config: &LlmConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "openai" => {
            let key = config
                .api_key
                .clone()
                .or_else(|| std::env::var("OPENAI_API_KEY").ok())
                .ok_or_else(|| AppError::Configuration {
                    message: "OpenAI API key required for generative backend".to_string(),
                })?;
            Ok(Arc::new(OpenAIChatClient::new(key, config)?))
        }
        "scripted" => Ok(Arc::new(ScriptedGenerator::new())),
        other => Err(AppError::Configuration {
            message: format!("unknown llm provider '{}'", other),
        }),
    }
}
