use crate::{build_prompt, AiError, SYSTEM_PROMPT};
use async_trait::async_trait;
use mailhop_core::{ExtractedData, MailMessage, SummaryResult};
use serde_json::{json, Value};
use std::time::Duration;

#[async_trait]
pub trait Summarizer: Send + Sync {
    fn model(&self) -> &str;

    async fn summarize(&self, message: &MailMessage) -> Result<SummaryResult, AiError>;
}

#[derive(Debug, Clone)]
pub struct SummarizerConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Chat-completions client for OpenAI-compatible endpoints.
#[derive(Debug, Clone)]
pub struct OpenAiSummarizer {
    config: SummarizerConfig,
    http: reqwest::Client,
}

impl OpenAiSummarizer {
    pub fn new(config: SummarizerConfig) -> Result<Self, AiError> {
        if config.api_key.trim().is_empty() {
            return Err(AiError::Config("LLM API key is required".to_string()));
        }

        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, http })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl Summarizer for OpenAiSummarizer {
    fn model(&self) -> &str {
        &self.config.model
    }

    async fn summarize(&self, message: &MailMessage) -> Result<SummaryResult, AiError> {
        let payload = json!({
            "model": self.config.model,
            "max_tokens": self.config.max_tokens,
            "temperature": 0.3,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                { "role": "user", "content": build_prompt(message) }
            ]
        });

        let response = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail: String = body.chars().take(200).collect();
            return Err(AiError::Api(format!("status {status}: {detail}")));
        }

        let json: Value = response.json().await.map_err(map_transport_error)?;
        let result = parse_completion(&json, &self.config.model)?;
        tracing::debug!(
            email_id = %message.id,
            input_tokens = result.input_tokens,
            output_tokens = result.output_tokens,
            "summary generated"
        );
        Ok(result)
    }
}

fn map_transport_error(err: reqwest::Error) -> AiError {
    if err.is_timeout() {
        AiError::Timeout
    } else {
        AiError::Http(err)
    }
}

/// Reads the first choice's JSON content and the usage counters.
pub(crate) fn parse_completion(json: &Value, model: &str) -> Result<SummaryResult, AiError> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .ok_or_else(|| AiError::InvalidResponse("no choices returned".to_string()))?;

    let parsed: Value = serde_json::from_str(content).map_err(|err| {
        AiError::InvalidResponse(format!("failed to parse JSON response: {err}"))
    })?;

    let token_count = |pointer: &str| {
        json.pointer(pointer)
            .and_then(Value::as_u64)
            .map(|count| count.min(u64::from(u32::MAX)) as u32)
            .unwrap_or(0)
    };

    Ok(SummaryResult {
        summary: parsed
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        extracted_data: parsed
            .get("extracted_data")
            .map(ExtractedData::from_value)
            .unwrap_or_default(),
        model: json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(model)
            .to_string(),
        input_tokens: token_count("/usage/prompt_tokens"),
        output_tokens: token_count("/usage/completion_tokens"),
    })
}
