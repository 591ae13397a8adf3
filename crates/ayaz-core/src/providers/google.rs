//! Gemini `generateContent` backend

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::types::{ChatMessage, ChatResponse, ChatRole, ChatUsage, LlmProvider, StopReason};

const GEMINI_API: &str = "https://generativelanguage.googleapis.com/v1beta";

pub struct GoogleProvider {
    http: Client,
    api_key: String,
    endpoint: String,
    model: String,
    max_output_tokens: u32,
}

// Keeps the API key out of logs
impl std::fmt::Debug for GoogleProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleProvider")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl GoogleProvider {
    pub fn new(api_key: String, model: String, max_tokens: u32, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client for Gemini")?;
        Ok(Self {
            http,
            api_key,
            endpoint: GEMINI_API.to_string(),
            model,
            max_output_tokens: max_tokens,
        })
    }

    /// Point at another API root (tests, proxies)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.endpoint = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn request<'a>(&self, messages: &'a [ChatMessage], system: &'a str) -> GenerateRequest<'a> {
        let contents = messages
            .iter()
            .filter_map(|m| {
                let role = match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "model",
                    ChatRole::System => return None,
                };
                Some(Content {
                    role,
                    parts: vec![Part { text: &m.content }],
                })
            })
            .collect();

        GenerateRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| SystemInstruction {
                parts: vec![Part { text: system }],
            }),
            generation_config: GenerationConfig {
                max_output_tokens: self.max_output_tokens,
            },
        }
    }
}

/// First candidate's text, or an error when the model produced none
fn into_chat_response(reply: GenerateReply) -> Result<ChatResponse> {
    let Some(candidate) = reply.candidates.into_iter().next() else {
        bail!("Gemini returned no candidates");
    };

    let text: String = candidate
        .content
        .into_iter()
        .flat_map(|c| c.parts)
        .filter_map(|p| p.text)
        .collect();

    let finish = candidate.finish_reason.as_deref();
    if text.trim().is_empty() {
        bail!(
            "Gemini returned an empty answer (finish reason: {})",
            finish.unwrap_or("none")
        );
    }

    let usage = reply
        .usage_metadata
        .map(|u| ChatUsage {
            input_tokens: u.prompt_token_count,
            output_tokens: u.candidates_token_count,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        text,
        stop_reason: match finish {
            None | Some("STOP") => StopReason::EndTurn,
            Some("MAX_TOKENS") => StopReason::MaxTokens,
            Some(_) => StopReason::Unknown,
        },
        usage,
    })
}

#[async_trait]
impl LlmProvider for GoogleProvider {
    fn provider_name(&self) -> &str {
        "google"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse> {
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        let body = self.request(messages, system);
        debug!("Gemini {} <- {} message(s)", self.model, body.contents.len());

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .context("Gemini request could not be sent")?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            bail!("Gemini request failed with status {}: {}", status, detail);
        }

        let reply: GenerateReply = response
            .json()
            .await
            .context("Gemini response was not valid JSON")?;
        into_chat_response(reply)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    max_output_tokens: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateReply {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<ReplyContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ReplyContent {
    #[serde(default)]
    parts: Vec<ReplyPart>,
}

#[derive(Deserialize)]
struct ReplyPart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}
