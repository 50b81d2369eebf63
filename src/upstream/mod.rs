//! Upstream language-model interface.
//!
//! Provides the [`CompletionProvider`] trait and an OpenAI-compatible streaming
//! implementation (OpenAI, Azure OpenAI, and anything speaking the same
//! `chat/completions` SSE dialect). The provider is created via
//! [`create_provider`] from configuration.

pub mod openai;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;

use crate::chat::types::{Message, Role};

/// Provider failures, classified by whether a later attempt could succeed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// Transport errors, timeouts, rate limits, 5xx, mid-stream disconnects.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// Rejected requests and undecodable responses.
    #[error("fatal upstream failure: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    System,
    User,
    Assistant,
}

/// One entry of the message list sent upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatTurn {
    pub role: TurnRole,
    pub content: String,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::System,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        let role = match message.role {
            Role::User => TurnRole::User,
            Role::Assistant => TurnRole::Assistant,
        };
        Self {
            role,
            content: message.content.clone(),
        }
    }
}

/// Ordered reply fragments. The stream ending is the end-of-stream signal;
/// dropping it releases the upstream connection.
pub type FragmentStream = BoxStream<'static, Result<String, UpstreamError>>;

/// A language model that streams its reply.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Open a streaming completion over `turns` (system preamble first).
    async fn stream_completion(&self, turns: Vec<ChatTurn>) -> Result<FragmentStream, UpstreamError>;

    /// Short name for logs.
    fn name(&self) -> &str {
        "upstream"
    }
}

/// Create the configured provider.
pub fn create_provider(
    config: &crate::config::UpstreamConfig,
) -> anyhow::Result<Box<dyn CompletionProvider>> {
    let provider = openai::OpenAiCompatProvider::new(config)?;
    Ok(Box::new(provider))
}
