//! Provider-agnostic chat types

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Provider-agnostic chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// Provider-agnostic response from an LLM
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub text: String,
    pub stop_reason: StopReason,
    pub usage: ChatUsage,
}

/// Why the model stopped generating
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    Unknown,
}

/// Token usage of one or more API calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl ChatUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::Add for ChatUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            input_tokens: self.input_tokens + rhs.input_tokens,
            output_tokens: self.output_tokens + rhs.output_tokens,
        }
    }
}

impl std::ops::AddAssign for ChatUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Trait that all LLM providers implement
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Human-readable provider name (e.g. "watsonx", "google")
    fn provider_name(&self) -> &str;

    /// Model identifier (e.g. "ibm/granite-3-8b-instruct")
    fn model(&self) -> &str;

    /// Send a conversation with a system prompt and return the reply
    async fn chat(&self, messages: &[ChatMessage], system: &str) -> Result<ChatResponse>;
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::System => write!(f, "system"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_role_display() {
        assert_eq!(ChatRole::User.to_string(), "user");
        assert_eq!(ChatRole::Assistant.to_string(), "assistant");
        assert_eq!(ChatRole::System.to_string(), "system");
    }

    #[test]
    fn test_message_constructors() {
        assert_eq!(ChatMessage::user("hi").role, ChatRole::User);
        assert_eq!(ChatMessage::assistant("yo").content, "yo");
    }

    #[test]
    fn test_usage_accumulates() {
        let mut usage = ChatUsage::default();
        usage += ChatUsage {
            input_tokens: 10,
            output_tokens: 4,
        };
        usage += ChatUsage {
            input_tokens: 1,
            output_tokens: 2,
        };
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 6);
        assert_eq!(usage.total(), 17);
    }
}
