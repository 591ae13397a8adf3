//! IBM watsonx.ai provider
//!
//! Exchanges the API key for an IAM bearer token, caches it until shortly
//! before it expires, and calls the watsonx.ai text chat endpoint.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{ChatMessage, ChatResponse, ChatUsage, LlmProvider, StopReason};

const IAM_TOKEN_URL: &str = "https://iam.cloud.ibm.com/identity/token";
const IAM_GRANT_TYPE: &str = "urn:ibm:params:oauth:grant-type:apikey";
const CHAT_API_VERSION: &str = "2024-05-31";
/// Refresh the IAM token this long before it actually expires
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

struct CachedToken {
    access_token: String,
    refresh_at: Instant,
}

/// IBM watsonx.ai provider
pub struct WatsonxProvider {
    client: Client,
    api_key: String,
    url: String,
    project_id: String,
    model: String,
    max_tokens: u32,
    iam_url: String,
    token: Mutex<Option<CachedToken>>,
}

impl std::fmt::Debug for WatsonxProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatsonxProvider")
            .field("url", &self.url)
            .field("project_id", &self.project_id)
            .field("model", &self.model)
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl WatsonxProvider {
    pub fn new(
        api_key: String,
        url: String,
        project_id: String,
        model: String,
        max_tokens: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            api_key,
            url: url.trim_end_matches('/').to_string(),
            project_id,
            model,
            max_tokens,
            iam_url: IAM_TOKEN_URL.to_string(),
            token: Mutex::new(None),
        })
    }

    pub fn with_iam_url(mut self, iam_url: impl Into<String>) -> Self {
        self.iam_url = iam_url.into();
        self
    }

    fn chat_url(&self) -> String {
        format!("{}/ml/v1/text/chat?version={}", self.url, CHAT_API_VERSION)
    }

    fn token_request_body(api_key: &str) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .append_pair("grant_type", IAM_GRANT_TYPE)
            .append_pair("apikey", api_key)
            .finish()
    }

    /// Return a valid bearer token, fetching a new one when the cached one is stale
    async fn bearer_token(&self) -> Result<String> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.access_token.clone());
            }
        }

        debug!("Requesting IAM token from {}", self.iam_url);
        let response = self
            .client
            .post(&self.iam_url)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .header("Accept", "application/json")
            .body(Self::token_request_body(&self.api_key))
            .send()
            .await
            .context("Failed to request IAM token")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "IAM token request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let token: IamTokenResponse = response
            .json()
            .await
            .context("Failed to parse IAM token response")?;

        let lifetime = Duration::from_secs(token.expires_in.unwrap_or(3600));
        let refresh_at = Instant::now() + lifetime.saturating_sub(TOKEN_REFRESH_MARGIN);
        info!("Obtained watsonx IAM token (valid for {}s)", lifetime.as_secs());

        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            refresh_at,
        });
        Ok(access_token)
    }

    async fn post_chat(&self, request: &WatsonxChatRequest<'_>) -> Result<reqwest::Response> {
        let token = self.bearer_token().await?;
        self.client
            .post(self.chat_url())
            .bearer_auth(token)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .context("Failed to send request to watsonx.ai")
    }

    fn to_watsonx_messages(messages: &[ChatMessage], system: &str) -> Vec<WatsonxMessage> {
        let mut result = Vec::with_capacity(messages.len() + 1);
        if !system.is_empty() {
            result.push(WatsonxMessage {
                role: "system".to_string(),
                content: system.to_string(),
            });
        }
        result.extend(messages.iter().map(|m| WatsonxMessage {
            role: m.role.to_string(),
            content: m.content.clone(),
        }));
        result
    }

    fn from_watsonx_response(resp: WatsonxChatResponse) -> Result<ChatResponse> {
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("watsonx response had no choices"))?;

        let text = choice.message.content.unwrap_or_default();
        if text.trim().is_empty() {
            return Err(anyhow!("watsonx returned an empty answer"));
        }

        let stop_reason = match choice.finish_reason.as_deref() {
            Some("stop") | Some("eos_token") | None => StopReason::EndTurn,
            Some("length") | Some("max_tokens") => StopReason::MaxTokens,
            Some(_) => StopReason::Unknown,
        };

        let usage = resp.usage.map_or(ChatUsage::default(), |u| ChatUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
        });

        Ok(ChatResponse {
            text,
            stop_reason,
            usage,
        })
    }
}

#[async_trait]
impl LlmProvider for WatsonxProvider {
    fn provider_name(&self) -> &str {
        "watsonx"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse> {
        let request = WatsonxChatRequest {
            model_id: &self.model,
            project_id: &self.project_id,
            messages: Self::to_watsonx_messages(messages, system),
            max_tokens: self.max_tokens,
        };

        debug!(
            "watsonx request: model={}, messages={}",
            self.model,
            request.messages.len()
        );

        let mut response = self.post_chat(&request).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            // IAM tokens can be revoked before they expire
            warn!("watsonx.ai rejected the IAM token, requesting a new one");
            *self.token.lock().await = None;
            response = self.post_chat(&request).await?;
        }

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow!(
                "watsonx.ai request failed with status {}: {}",
                status,
                error_text
            ));
        }

        let api_response: WatsonxChatResponse = response
            .json()
            .await
            .context("Failed to parse watsonx.ai response")?;

        Self::from_watsonx_response(api_response)
    }
}

// ── watsonx wire types ──

#[derive(Debug, Deserialize)]
struct IamTokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
struct WatsonxChatRequest<'a> {
    model_id: &'a str,
    project_id: &'a str,
    messages: Vec<WatsonxMessage>,
    max_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WatsonxMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WatsonxChatResponse {
    #[serde(default)]
    choices: Vec<WatsonxChoice>,
    usage: Option<WatsonxUsage>,
}

#[derive(Debug, Deserialize)]
struct WatsonxChoice {
    message: WatsonxResponseMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatsonxResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WatsonxUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    fn provider() -> WatsonxProvider {
        WatsonxProvider::new(
            "ibm-secret-key".to_string(),
            "https://us-south.ml.cloud.ibm.com/".to_string(),
            "proj-123".to_string(),
            "ibm/granite-3-8b-instruct".to_string(),
            1024,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_chat_url() {
        assert_eq!(
            provider().chat_url(),
            "https://us-south.ml.cloud.ibm.com/ml/v1/text/chat?version=2024-05-31"
        );
    }

    #[test]
    fn test_token_request_body_is_form_encoded() {
        let body = WatsonxProvider::token_request_body("a key/with+chars");
        assert_eq!(
            body,
            "grant_type=urn%3Aibm%3Aparams%3Aoauth%3Agrant-type%3Aapikey&apikey=a+key%2Fwith%2Bchars"
        );
    }

    #[test]
    fn test_messages_start_with_system() {
        let msgs = WatsonxProvider::to_watsonx_messages(
            &[ChatMessage::user("hi"), ChatMessage::assistant("hello")],
            "be brief",
        );
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[0].role, "system");
        assert_eq!(msgs[1].role, "user");
        assert_eq!(msgs[2].role, "assistant");

        let no_system = WatsonxProvider::to_watsonx_messages(&[ChatMessage::user("hi")], "");
        assert_eq!(no_system.len(), 1);
    }

    #[test]
    fn test_request_serialization() {
        let request = WatsonxChatRequest {
            model_id: "m",
            project_id: "p",
            messages: vec![],
            max_tokens: 10,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model_id"], "m");
        assert_eq!(json["project_id"], "p");
        assert_eq!(json["max_tokens"], 10);
    }

    #[test]
    fn test_from_watsonx_response() {
        let resp: WatsonxChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Meeting booked."},
                "finish_reason": "stop"
            }],
            "usage": {"prompt_tokens": 42, "completion_tokens": 7, "total_tokens": 49}
        }))
        .unwrap();
        let result = WatsonxProvider::from_watsonx_response(resp).unwrap();
        assert_eq!(result.text, "Meeting booked.");
        assert_eq!(result.stop_reason, StopReason::EndTurn);
        assert_eq!(result.usage.input_tokens, 42);
        assert_eq!(result.usage.output_tokens, 7);
    }

    #[test]
    fn test_from_watsonx_response_length() {
        let resp: WatsonxChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"message": {"content": "partial"}, "finish_reason": "length"}]
        }))
        .unwrap();
        let result = WatsonxProvider::from_watsonx_response(resp).unwrap();
        assert_eq!(result.stop_reason, StopReason::MaxTokens);
    }

    #[test]
    fn test_from_watsonx_response_no_choices() {
        let resp: WatsonxChatResponse =
            serde_json::from_value(serde_json::json!({"choices": []})).unwrap();
        assert!(WatsonxProvider::from_watsonx_response(resp).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let debug = format!("{:?}", provider());
        assert!(!debug.contains("ibm-secret-key"));
        assert!(debug.contains("proj-123"));
    }

    /// Request head, read once the body announced by Content-Length is in
    async fn read_head(stream: &mut TcpStream) -> String {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = stream.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).into_owned();
                let body_len = header(&head, "content-length")
                    .and_then(|v| v.parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + body_len {
                    return head;
                }
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    fn header(head: &str, name: &str) -> Option<String> {
        head.lines().find_map(|line| {
            let (key, value) = line.split_once(':')?;
            key.eq_ignore_ascii_case(name).then(|| value.trim().to_string())
        })
    }

    /// Local IAM + chat endpoint whose first `rejections` chat calls answer 401.
    /// Returns the base URL and a log of "path auth" lines.
    async fn fake_watsonx(rejections: usize) -> (String, Arc<StdMutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let log = Arc::new(StdMutex::new(Vec::new()));
        let seen = log.clone();

        tokio::spawn(async move {
            let (mut tokens, mut chats) = (0, 0);
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let head = read_head(&mut stream).await;
                let target = head.split_whitespace().nth(1).unwrap_or_default();
                let path = target.split('?').next().unwrap_or_default().to_string();
                let auth = header(&head, "authorization").unwrap_or_else(|| "-".to_string());
                seen.lock().unwrap().push(format!("{} {}", path, auth));

                let (status, body) = if path == "/identity/token" {
                    tokens += 1;
                    (
                        "200 OK",
                        format!(r#"{{"access_token": "tok-{}", "expires_in": 3600}}"#, tokens),
                    )
                } else {
                    chats += 1;
                    if chats <= rejections {
                        ("401 Unauthorized", r#"{"errors": [{"code": "token_expired"}]}"#.to_string())
                    } else {
                        (
                            "200 OK",
                            r#"{"choices": [{"message": {"content": "Meeting booked."}, "finish_reason": "stop"}]}"#
                                .to_string(),
                        )
                    }
                };
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            }
        });

        (base, log)
    }

    fn local_provider(base: &str) -> WatsonxProvider {
        WatsonxProvider::new(
            "ibm-secret-key".to_string(),
            base.to_string(),
            "proj-123".to_string(),
            "ibm/granite-3-8b-instruct".to_string(),
            64,
            Duration::from_secs(5),
        )
        .unwrap()
        .with_iam_url(format!("{}/identity/token", base))
    }

    #[tokio::test]
    async fn test_revoked_token_is_refreshed_and_retried() {
        let (base, log) = fake_watsonx(1).await;
        let provider = local_provider(&base);

        let response = provider
            .chat(&[ChatMessage::user("Book the sync")], "")
            .await
            .unwrap();

        assert_eq!(response.text, "Meeting booked.");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "/identity/token -",
                "/ml/v1/text/chat Bearer tok-1",
                "/identity/token -",
                "/ml/v1/text/chat Bearer tok-2",
            ]
        );
    }

    #[tokio::test]
    async fn test_second_rejection_is_an_error() {
        let (base, log) = fake_watsonx(5).await;
        let provider = local_provider(&base);

        let err = provider
            .chat(&[ChatMessage::user("Book the sync")], "")
            .await
            .unwrap_err();

        assert!(err.to_string().contains("status 401"));
        assert_eq!(log.lock().unwrap().len(), 4);
    }
}
