//! Question/answer generation with a hosted language model.
//!
//! A [`QuestionGenerator`] receives the text of one page and returns the
//! question/answer pairs the model derived from it. Two providers are
//! supported:
//!
//! - **`gemini`**: `POST {endpoint}/v1beta/models/{model}:generateContent`,
//!   key from `GEMINI_API_KEY`. Structured mode attaches a response schema.
//! - **`openai`**: `POST {endpoint}/v1/chat/completions`, key from
//!   `OPENAI_API_KEY`. Structured mode uses JSON mode.
//!
//! With `structured_output = false` the prompt ends in `Q:` and the model
//! continues in the `Q: …` / `A: …` convention.
//!
//! Replies are parsed by [`parse_qa_response`]. An unparseable reply is a
//! [`ServiceError::Parse`], which the retry policy treats as transient,
//! so the whole request is re-issued.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{json, Value};

use crate::config::GenerationConfig;
use crate::error::{self, ServiceError};
use crate::models::QaPair;
use crate::retry::RetryPolicy;

const SERVICE: &str = "generation";

const SYSTEM_INSTRUCTION: &str = "You write question and answer pairs for training data. \
Use simple language and avoid technical terms. Every question must be self-contained and \
answerable from the given text alone.";

#[async_trait]
pub trait QuestionGenerator: Send + Sync {
    async fn generate(&self, text: &str) -> Result<Vec<QaPair>>;
}

/// Build the configured generator, reading its API key from the environment.
pub fn from_config(config: &GenerationConfig, retry: RetryPolicy) -> Result<Arc<dyn QuestionGenerator>> {
    match config.provider.as_str() {
        "gemini" => {
            let key = std::env::var("GEMINI_API_KEY")
                .context("GEMINI_API_KEY environment variable not set")?;
            Ok(Arc::new(GeminiGenerator::new(config, key, retry)?))
        }
        "openai" => {
            let key = std::env::var("OPENAI_API_KEY")
                .context("OPENAI_API_KEY environment variable not set")?;
            Ok(Arc::new(OpenAiGenerator::new(config, key, retry)?))
        }
        other => bail!("Unknown generation provider: '{}'", other),
    }
}

/// Prompt text shared by both providers.
#[derive(Debug, Clone)]
struct Prompt {
    question_count: usize,
    structured: bool,
}

impl Prompt {
    fn user_text(&self, text: &str) -> String {
        if self.structured {
            format!(
                "TEXT:\n{}\n\nGive me {} specific questions and answers that can be answered \
                 from the above text. Reply with a JSON array of objects with \"question\" and \
                 \"answer\" fields.",
                text, self.question_count
            )
        } else {
            format!(
                "TEXT:\n{}\n\nGive me {} specific questions and answers that can be answered \
                 from the above text.\nQ:",
                text, self.question_count
            )
        }
    }

    /// The legacy prompt ends in `Q:`, so the reply starts mid-pair.
    fn parse_reply(&self, reply: &str) -> Result<Vec<QaPair>, ServiceError> {
        if self.structured {
            return parse_qa_response(reply);
        }
        let trimmed = reply.trim_start();
        if trimmed.starts_with("Q:") || trimmed.starts_with('[') || trimmed.starts_with("```") {
            parse_qa_response(trimmed)
        } else {
            parse_qa_response(&format!("Q: {}", trimmed))
        }
    }
}

// ============ Gemini ============

pub struct GeminiGenerator {
    endpoint: String,
    model: String,
    api_key: String,
    prompt: Prompt,
    temperature: f32,
    max_output_tokens: u32,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig, api_key: String, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://generativelanguage.googleapis.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            prompt: Prompt {
                question_count: config.question_count,
                structured: config.structured_output,
            },
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            client,
            retry,
        })
    }

    fn request_body(&self, text: &str) -> Value {
        let mut generation_config = json!({
            "temperature": self.temperature,
            "maxOutputTokens": self.max_output_tokens,
        });
        if self.prompt.structured {
            generation_config["responseMimeType"] = json!("application/json");
            generation_config["responseSchema"] = json!({
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "question": {"type": "STRING"},
                        "answer": {"type": "STRING"},
                    },
                    "required": ["question", "answer"],
                },
            });
        }
        json!({
            "systemInstruction": {"parts": [{"text": SYSTEM_INSTRUCTION}]},
            "contents": [{"role": "user", "parts": [{"text": self.prompt.user_text(text)}]}],
            "generationConfig": generation_config,
        })
    }
}

#[async_trait]
impl QuestionGenerator for GeminiGenerator {
    async fn generate(&self, text: &str) -> Result<Vec<QaPair>> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        );
        let body = self.request_body(text);
        self.retry
            .run("generation.gemini", || async {
                let req = self
                    .client
                    .post(&url)
                    .header("x-goog-api-key", &self.api_key)
                    .json(&body);
                let resp = error::send_checked(SERVICE, req).await?;
                let json = error::read_json(SERVICE, resp).await?;
                let reply = gemini_reply_text(&json)?;
                Ok::<_, anyhow::Error>(self.prompt.parse_reply(&reply)?)
            })
            .await
    }
}

fn gemini_reply_text(json: &Value) -> Result<String, ServiceError> {
    let parts = json
        .pointer("/candidates/0/content/parts")
        .and_then(|p| p.as_array())
        .ok_or_else(|| ServiceError::parse(SERVICE, "reply has no candidate content"))?;
    Ok(parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .concat())
}

// ============ OpenAI ============

pub struct OpenAiGenerator {
    endpoint: String,
    model: String,
    api_key: String,
    prompt: Prompt,
    temperature: f32,
    max_output_tokens: u32,
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl OpenAiGenerator {
    pub fn new(config: &GenerationConfig, api_key: String, retry: RetryPolicy) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            endpoint: config
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string())
                .trim_end_matches('/')
                .to_string(),
            model: config.model.clone(),
            api_key,
            prompt: Prompt {
                question_count: config.question_count,
                structured: config.structured_output,
            },
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            client,
            retry,
        })
    }

    fn request_body(&self, text: &str) -> Value {
        let mut body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_output_tokens,
            "messages": [
                {"role": "system", "content": SYSTEM_INSTRUCTION},
                {"role": "user", "content": self.prompt.user_text(text)},
            ],
        });
        // JSON mode only allows a top-level object.
        if self.prompt.structured {
            body["response_format"] = json!({"type": "json_object"});
            body["messages"][1]["content"] = json!(format!(
                "{}\nWrap the array in an object under the key \"questions\".",
                self.prompt.user_text(text)
            ));
        }
        body
    }
}

#[async_trait]
impl QuestionGenerator for OpenAiGenerator {
    async fn generate(&self, text: &str) -> Result<Vec<QaPair>> {
        let url = format!("{}/v1/chat/completions", self.endpoint);
        let body = self.request_body(text);
        self.retry
            .run("generation.openai", || async {
                let req = self
                    .client
                    .post(&url)
                    .bearer_auth(&self.api_key)
                    .json(&body);
                let resp = error::send_checked(SERVICE, req).await?;
                let json = error::read_json(SERVICE, resp).await?;
                let reply = json
                    .pointer("/choices/0/message/content")
                    .and_then(|c| c.as_str())
                    .ok_or_else(|| ServiceError::parse(SERVICE, "reply has no message content"))?;
                Ok::<_, anyhow::Error>(self.prompt.parse_reply(reply)?)
            })
            .await
    }
}

// ============ Reply parsing ============

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").expect("valid fence regex")
    })
}

fn question_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*Q:\s*").expect("valid question regex"))
}

fn answer_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*A:\s*").expect("valid answer regex"))
}

/// Parse a model reply into question/answer pairs.
///
/// Accepted shapes, tried in order:
///
/// 1. a JSON array of `{"question", "answer"}` objects, or an object
///    wrapping such an array under `questions`;
/// 2. the same JSON inside a fenced code block;
/// 3. line-oriented `Q: …` / `A: …` text.
///
/// Fields are trimmed and pairs with an empty side are dropped.
pub fn parse_qa_response(reply: &str) -> Result<Vec<QaPair>, ServiceError> {
    let trimmed = reply.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        if let Some(pairs) = pairs_from_json(&value) {
            return Ok(pairs);
        }
    }

    for caps in fence_re().captures_iter(trimmed) {
        if let Ok(value) = serde_json::from_str::<Value>(caps[1].trim()) {
            if let Some(pairs) = pairs_from_json(&value) {
                return Ok(pairs);
            }
        }
    }

    if question_re().is_match(trimmed) {
        let pairs = parse_q_a_lines(trimmed);
        if !pairs.is_empty() {
            return Ok(pairs);
        }
    }

    let preview: String = trimmed.chars().take(120).collect();
    Err(ServiceError::parse(
        SERVICE,
        format!("no question/answer pairs found in reply: {:?}", preview),
    ))
}

fn pairs_from_json(value: &Value) -> Option<Vec<QaPair>> {
    let items = match value {
        Value::Array(items) => items,
        Value::Object(map) => map.get("questions")?.as_array()?,
        _ => return None,
    };
    let pairs = items
        .iter()
        .filter_map(|item| {
            let question = item.get("question")?.as_str()?.trim();
            let answer = item.get("answer")?.as_str()?.trim();
            (!question.is_empty() && !answer.is_empty()).then(|| QaPair::new(question, answer))
        })
        .collect::<Vec<_>>();
    // Items that all lack usable fields are a malformed reply, not "no questions".
    if pairs.is_empty() && !items.is_empty() {
        return None;
    }
    Some(pairs)
}

fn parse_q_a_lines(text: &str) -> Vec<QaPair> {
    question_re()
        .split(text)
        .filter_map(|block| {
            let mut halves = answer_re().splitn(block, 2);
            let question = halves.next()?.trim();
            let answer = halves.next()?.trim();
            (!question.is_empty() && !answer.is_empty()).then(|| QaPair::new(question, answer))
        })
        .collect()
}
