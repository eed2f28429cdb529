//! OpenRouter chat-completions client.
//!
//! One client instance is shared by all pipeline stages. Responses requested
//! as JSON go through an ordered extraction ladder and come back as a tagged
//! [`LlmContent`] so callers decide what an unparseable payload means.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use procwatch_shared::{ProcwatchError, Result, clip};

/// User-Agent string for OpenRouter requests.
const USER_AGENT: &str = concat!("Procwatch/", env!("CARGO_PKG_VERSION"));

/// App identifier sent in the `X-Title` header.
const APP_TITLE: &str = "Procwatch";

/// OpenRouter calls may queue behind slow providers.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

/// A single chat message.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Per-call knobs. `model: None` uses the client's default model.
#[derive(Debug, Clone)]
pub struct CompletionOptions {
    pub model: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// Request `response_format: json_object` and run the extraction ladder.
    pub json_output: bool,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            model: None,
            max_tokens: 1024,
            temperature: 0.1,
            json_output: false,
        }
    }
}

/// Content of a completion: either parsed JSON or the raw text when no
/// strategy produced JSON. Callers that required JSON treat `Unparsed` as a
/// hard failure rather than substituting defaults.
#[derive(Debug, Clone, PartialEq)]
pub enum LlmContent {
    Parsed(Value),
    Unparsed(String),
}

impl LlmContent {
    /// The parsed JSON value, if any.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Parsed(value) => Some(value),
            Self::Unparsed(_) => None,
        }
    }
}

/// A completed LLM call with usage accounting.
#[derive(Debug, Clone)]
pub struct Completion {
    pub content: LlmContent,
    /// Model that actually served the call (response echo, falling back to
    /// the requested model).
    pub model: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Chat-completions client for the OpenRouter API.
pub struct LlmClient {
    http: Client,
    base_url: String,
    api_key: String,
    default_model: String,
}

impl LlmClient {
    /// Create a client against `base_url` (e.g. `https://openrouter.ai/api/v1`).
    pub fn new(base_url: &str, api_key: &str, default_model: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProcwatchError::Llm(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            default_model: default_model.to_string(),
        })
    }

    /// The model used when a call has no override.
    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Run one chat completion.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<Completion> {
        let model = options.model.as_deref().unwrap_or(&self.default_model);

        let mut body = serde_json::json!({
            "model": model,
            "messages": messages,
            "max_tokens": options.max_tokens,
            "temperature": options.temperature,
        });
        if options.json_output {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        debug!(model, json_output = options.json_output, "requesting completion");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("X-Title", APP_TITLE)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProcwatchError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(ProcwatchError::Llm(format!(
                "HTTP {status}: {}",
                clip(&detail, 200)
            )));
        }

        let payload: Value = response
            .json()
            .await
            .map_err(|e| ProcwatchError::Llm(format!("response decode failed: {e}")))?;

        let text = payload
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| ProcwatchError::Llm("response had no message content".into()))?;

        let content = if options.json_output {
            extract_json(text)
        } else {
            LlmContent::Unparsed(text.to_string())
        };

        Ok(Completion {
            content,
            model: payload
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
            prompt_tokens: usage_field(&payload, "prompt_tokens"),
            completion_tokens: usage_field(&payload, "completion_tokens"),
            total_tokens: usage_field(&payload, "total_tokens"),
        })
    }
}

/// Usage counters default to 0 when the provider omits them.
fn usage_field(payload: &Value, field: &str) -> i64 {
    payload
        .pointer(&format!("/usage/{field}"))
        .and_then(Value::as_i64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// JSON extraction ladder
// ---------------------------------------------------------------------------

/// Extract JSON from model output, trying in order:
/// 1. Direct parse of the whole text
/// 2. Parse after stripping one leading/trailing code fence
/// 3. Parse the first `{` through the last `}`
///
/// All failed: log and return the raw text tagged [`LlmContent::Unparsed`].
pub fn extract_json(text: &str) -> LlmContent {
    static LEADING_FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*```(?:json)?\s*").expect("valid regex"));
    static TRAILING_FENCE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\s*```\s*$").expect("valid regex"));
    static BRACE_SPAN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

    if let Ok(value) = serde_json::from_str::<Value>(text) {
        return LlmContent::Parsed(value);
    }

    let stripped = LEADING_FENCE_RE.replace(text, "");
    let stripped = TRAILING_FENCE_RE.replace(stripped.as_ref(), "");
    if let Ok(value) = serde_json::from_str::<Value>(stripped.as_ref()) {
        return LlmContent::Parsed(value);
    }

    if let Some(found) = BRACE_SPAN_RE.find(text) {
        if let Ok(value) = serde_json::from_str::<Value>(found.as_str()) {
            return LlmContent::Parsed(value);
        }
    }

    warn!(content = clip(text, 300), "model content was not parseable JSON");
    LlmContent::Unparsed(text.to_string())
}
