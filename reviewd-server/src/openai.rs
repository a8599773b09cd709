//! OpenAI chat completions client.
//!
//! One call per review: the diff hunks go in as a user prompt, JSON
//! mode is requested, and the body is parsed into `LlmReview`. Rate
//! limiting, caching, and single-flight live in `client`, not here.

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use reviewd_core::LlmReview;

use crate::error::ReviewError;

const API_BASE: &str = "https://api.openai.com/v1";

/// Keep sampling low so repeated reviews of the same diff stay stable.
const REVIEW_TEMPERATURE: f32 = 0.2;

#[derive(Clone)]
pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("reviewd")
            .build()
            .context("Failed to build OpenAI HTTP client")?;

        Ok(Self {
            client,
            api_key,
            api_base: API_BASE.to_string(),
        })
    }

    /// Run one review request and parse the structured verdict.
    pub async fn review(
        &self,
        model: &str,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<LlmReview, ReviewError> {
        let request = ChatCompletionRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system_prompt.to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: user_prompt.to_string(),
                },
            ],
            temperature: REVIEW_TEMPERATURE,
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        info!(model, "Requesting code review completion");

        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| ReviewError::UpstreamFailure(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            error!("OpenAI API error: {} - {}", status, error_text);
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return Err(ReviewError::InvalidCredentials);
            }
            return Err(ReviewError::UpstreamFailure(format!(
                "{} - {}",
                status, error_text
            )));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ReviewError::UpstreamFailure(format!("malformed response: {e}")))?;

        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| ReviewError::UpstreamFailure("response had no choices".to_string()))?;

        parse_review_content(content)
    }
}

/// Parse the model's JSON verdict, tolerating code fences some models
/// wrap around JSON mode output.
fn parse_review_content(content: &str) -> Result<LlmReview, ReviewError> {
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    serde_json::from_str(trimmed)
        .map_err(|e| ReviewError::UpstreamFailure(format!("unparseable review JSON: {e}")))
}
