//! Retrying model router
//!
//! Wraps one or more providers. Transient failures (rate limits, 5xx,
//! timeouts) are retried with capped exponential backoff; anything else moves
//! straight to the next provider, if there is one.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::types::{ChatMessage, ChatResponse, LlmProvider};

/// How often and how patiently a provider is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per provider, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1` (attempt counts from 0)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Whether a failed call is worth repeating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    Transient,
    Fatal,
}

const TRANSIENT_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

const TRANSIENT_PHRASES: [&str; 8] = [
    "rate limit",
    "rate_limit",
    "overloaded",
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "temporarily unavailable",
];

/// Classify a provider error. Transport errors are inspected directly; HTTP
/// failures are recognised by the `status NNN` our providers put in messages.
pub fn classify(err: &anyhow::Error) -> Failure {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<reqwest::Error>() {
            if e.is_timeout() || e.is_connect() {
                return Failure::Transient;
            }
            if let Some(status) = e.status() {
                return classify_status(status.as_u16());
            }
        }
    }

    let text = format!("{:#}", err).to_lowercase();
    if let Some(status) = status_in(&text) {
        return classify_status(status);
    }
    if TRANSIENT_PHRASES.iter().any(|p| text.contains(p)) {
        Failure::Transient
    } else {
        Failure::Fatal
    }
}

fn classify_status(status: u16) -> Failure {
    if TRANSIENT_STATUSES.contains(&status) {
        Failure::Transient
    } else {
        Failure::Fatal
    }
}

/// Extract NNN from "... status NNN ..."
fn status_in(text: &str) -> Option<u16> {
    let rest = &text[text.find("status ")? + "status ".len()..];
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    if digits.len() == 3 { digits.parse().ok() } else { None }
}

/// Routes chat calls across providers in order, retrying transient failures
pub struct ModelRouter {
    providers: Vec<Box<dyn LlmProvider>>,
    policy: RetryPolicy,
}

impl ModelRouter {
    pub fn single(provider: Box<dyn LlmProvider>) -> Self {
        Self {
            providers: vec![provider],
            policy: RetryPolicy::default(),
        }
    }

    /// Providers in failover order; the first is the primary
    pub fn with_failover(providers: Vec<Box<dyn LlmProvider>>) -> Result<Self> {
        if providers.is_empty() {
            return Err(anyhow!("ModelRouter requires at least one provider"));
        }
        Ok(Self {
            providers,
            policy: RetryPolicy {
                max_attempts: 2,
                ..RetryPolicy::default()
            },
        })
    }

    /// Attempts per provider (at least one)
    pub fn with_max_retries(mut self, max_attempts: u32) -> Self {
        self.policy.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_retry_delay(mut self, delay: Duration) -> Self {
        self.policy.base_delay = delay;
        self
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn provider_count(&self) -> usize {
        self.providers.len()
    }

    async fn call_with_retries(
        &self,
        provider: &dyn LlmProvider,
        messages: &[ChatMessage],
        system: &str,
    ) -> Result<ChatResponse> {
        let mut attempt = 0;
        loop {
            let err = match provider.chat(messages, system).await {
                Ok(response) => return Ok(response),
                Err(e) => e,
            };
            attempt += 1;
            let failure = classify(&err);
            warn!(
                "{} ({}) failed, attempt {}/{} ({:?}): {:#}",
                provider.provider_name(),
                provider.model(),
                attempt,
                self.policy.max_attempts,
                failure,
                err
            );
            if failure == Failure::Fatal || attempt >= self.policy.max_attempts {
                return Err(err);
            }
            let delay = self.policy.backoff(attempt - 1);
            debug!("Retrying in {:?}", delay);
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl LlmProvider for ModelRouter {
    fn provider_name(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.provider_name())
            .unwrap_or("unknown")
    }

    fn model(&self) -> &str {
        self.providers
            .first()
            .map(|p| p.model())
            .unwrap_or("unknown")
    }

    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse> {
        let mut last_error = None;

        for (idx, provider) in self.providers.iter().enumerate() {
            match self.call_with_retries(provider.as_ref(), messages, system).await {
                Ok(response) => {
                    if idx > 0 {
                        info!("Answered by fallback provider {}", provider.provider_name());
                    }
                    return Ok(response);
                }
                Err(e) => last_error = Some(e),
            }
            if let Some(next) = self.providers.get(idx + 1) {
                info!(
                    "Failing over from {} to {}",
                    provider.provider_name(),
                    next.provider_name()
                );
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("no provider could answer")))
    }
}
