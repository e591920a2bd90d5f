//! The language-model seam.
//!
//! Every stage that needs generated text (summaries, classifications, the
//! character's reply) goes through [`LlmAgent`]. [`ClaudeAgent`] is the
//! production implementation; tests use
//! [`ScriptedAgent`](crate::testing::ScriptedAgent).

use crate::events::{Reporter, Stage};
use crate::model::Role;
use async_trait::async_trait;
use claude::{Claude, Request};
use futures::StreamExt;
use std::pin::Pin;
use thiserror::Error;
use tokio_stream::Stream;
use tracing::debug;

/// Errors from the model provider.
///
/// Every variant is treated as transient: the turn is aborted without
/// mutating state and may simply be retried.
#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("provider error: {0}")]
    Provider(String),

    #[error("stream interrupted: {0}")]
    Interrupted(String),
}

impl From<claude::Error> for AgentError {
    fn from(err: claude::Error) -> Self {
        match err {
            claude::Error::Stream(message) | claude::Error::Network(message) => {
                AgentError::Interrupted(message)
            }
            other => AgentError::Provider(other.to_string()),
        }
    }
}

/// A boxed stream of generated text.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, AgentError>> + Send>>;

/// A message handed to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentMessage {
    pub role: Role,
    pub content: String,
}

impl AgentMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }
}

/// Something that turns instructions and messages into streamed text.
#[async_trait]
pub trait LlmAgent: Send + Sync {
    async fn run(
        &self,
        instructions: &str,
        messages: &[AgentMessage],
    ) -> Result<FragmentStream, AgentError>;
}

/// Drain `stream`, reporting each fragment, and return the full text.
pub async fn collect_text(
    mut stream: FragmentStream,
    stage: Stage,
    reporter: &Reporter,
) -> Result<String, AgentError> {
    let mut text = String::new();
    let mut fragments = 0usize;
    while let Some(fragment) = stream.next().await {
        let fragment = fragment?;
        reporter.fragment(stage, &fragment);
        text.push_str(&fragment);
        fragments += 1;
    }
    debug!(stage = stage.label(), fragments, chars = text.len(), "model output collected");
    Ok(text)
}

/// [`LlmAgent`] backed by the Claude Messages API.
#[derive(Clone)]
pub struct ClaudeAgent {
    client: Claude,
    model: Option<String>,
    max_tokens: usize,
    temperature: Option<f32>,
}

impl ClaudeAgent {
    pub fn new(client: Claude) -> Self {
        Self {
            client,
            model: None,
            max_tokens: 4096,
            temperature: None,
        }
    }

    /// Create an agent from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, AgentError> {
        Ok(Self::new(Claude::from_env()?))
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Build the API request.
    ///
    /// The Messages API has no system role inside the conversation, so
    /// system messages are rendered as bracketed user turns in place.
    fn build_request(&self, instructions: &str, messages: &[AgentMessage]) -> Request {
        let messages = messages
            .iter()
            .map(|m| match m.role {
                Role::User => claude::Message::user(&m.content),
                Role::Assistant => claude::Message::assistant(&m.content),
                Role::System => claude::Message::user(format!("[System note]\n{}", m.content)),
            })
            .collect();

        let mut request = Request::new(messages)
            .with_system(instructions)
            .with_max_tokens(self.max_tokens);

        if let Some(ref model) = self.model {
            request = request.with_model(model);
        }

        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }

        request
    }
}

#[async_trait]
impl LlmAgent for ClaudeAgent {
    async fn run(
        &self,
        instructions: &str,
        messages: &[AgentMessage],
    ) -> Result<FragmentStream, AgentError> {
        let request = self.build_request(instructions, messages);
        debug!(messages = request.messages.len(), "sending request to Claude");
        let stream = self.client.stream_text(request).await?;
        Ok(Box::pin(stream.map(|item| item.map_err(AgentError::from))))
    }
}
