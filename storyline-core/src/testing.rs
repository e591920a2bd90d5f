//! Testing utilities.
//!
//! [`ScriptedAgent`] stands in for the model: it replays scripted responses
//! in order and records every request it receives, so sessions can be driven
//! deterministically without API calls.

use crate::agent::{AgentError, AgentMessage, FragmentStream, LlmAgent};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

/// One scripted reaction to a request.
#[derive(Debug, Clone)]
pub enum ScriptedResponse {
    /// Stream these fragments, then finish.
    Text(Vec<String>),
    /// Fail before any text is produced.
    Fail(AgentError),
    /// Stream these fragments, then fail.
    FailMidStream(Vec<String>, AgentError),
}

impl ScriptedResponse {
    /// Respond with `text` split into a few fragments.
    pub fn text(text: impl Into<String>) -> Self {
        let text = text.into();
        let mut fragments = Vec::new();
        let mut rest = text.as_str();
        while !rest.is_empty() {
            let mut cut = rest.len().min(16);
            while !rest.is_char_boundary(cut) {
                cut += 1;
            }
            let (head, tail) = rest.split_at(cut);
            fragments.push(head.to_string());
            rest = tail;
        }
        ScriptedResponse::Text(fragments)
    }

    /// Fail with a provider error.
    pub fn provider_error(message: impl Into<String>) -> Self {
        ScriptedResponse::Fail(AgentError::Provider(message.into()))
    }
}

/// A request the agent received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub instructions: String,
    pub messages: Vec<AgentMessage>,
}

impl RecordedCall {
    /// The concatenated text of every message.
    pub fn prompt(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A mock [`LlmAgent`] that returns scripted responses.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedAgent {
    pub fn new(responses: impl IntoIterator<Item = ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Queue another response.
    pub fn push(&self, response: ScriptedResponse) {
        lock(&self.responses).push_back(response);
    }

    /// Every request received so far.
    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    /// Responses not yet consumed.
    pub fn remaining(&self) -> usize {
        lock(&self.responses).len()
    }
}

#[async_trait]
impl LlmAgent for ScriptedAgent {
    async fn run(
        &self,
        instructions: &str,
        messages: &[AgentMessage],
    ) -> Result<FragmentStream, AgentError> {
        lock(&self.calls).push(RecordedCall {
            instructions: instructions.to_string(),
            messages: messages.to_vec(),
        });

        let response = lock(&self.responses)
            .pop_front()
            .ok_or_else(|| AgentError::Provider("no scripted response left".to_string()))?;

        let items: Vec<Result<String, AgentError>> = match response {
            ScriptedResponse::Text(fragments) => fragments.into_iter().map(Ok).collect(),
            ScriptedResponse::Fail(err) => return Err(err),
            ScriptedResponse::FailMidStream(fragments, err) => fragments
                .into_iter()
                .map(Ok)
                .chain(std::iter::once(Err(err)))
                .collect(),
        };
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::collect_text;
    use crate::events::{Reporter, Stage};

    #[test]
    fn test_text_splits_on_char_boundaries() {
        let ScriptedResponse::Text(fragments) = ScriptedResponse::text("héllo wörld, this is a longer reply") else {
            panic!("expected text");
        };
        assert!(fragments.len() > 1);
        assert_eq!(fragments.concat(), "héllo wörld, this is a longer reply");
    }

    #[tokio::test]
    async fn test_replays_in_order_and_records() {
        let agent = ScriptedAgent::new([
            ScriptedResponse::text("first"),
            ScriptedResponse::provider_error("down"),
        ]);

        let stream = agent.run("sys", &[AgentMessage::user("hi")]).await.unwrap();
        let text = collect_text(stream, Stage::Character, &Reporter::silent())
            .await
            .unwrap();
        assert_eq!(text, "first");

        assert!(agent.run("sys", &[]).await.is_err());
        assert!(agent.run("sys", &[]).await.is_err());
        assert_eq!(agent.call_count(), 3);
        assert_eq!(agent.calls()[0].prompt(), "hi");
        assert_eq!(agent.remaining(), 0);
    }
}
