//! Folds pending messages into summary checkpoints until a view converges.

use super::{CompactionError, Compactor, ConversationView};
use crate::agent::{collect_text, AgentMessage, LlmAgent};
use crate::events::{Reporter, SessionEvent, Stage};
use crate::model::StorylineId;
use crate::store::Store;
use tracing::{info, instrument, warn};

/// System instructions for the summarization call.
pub const SUMMARY_INSTRUCTIONS: &str =
    "You are a helpful assistant who is an expert at providing detailed summaries of conversations.";

/// Build the summarization request for the pending messages of `view`.
pub fn summary_prompt(view: &ConversationView) -> String {
    let mut prompt = String::from(
        "The following conversation is between a user and an AI in a roleplaying game.\n",
    );

    if let Some(summary) = view.summary() {
        prompt.push_str("Let me first give you a summary of the conversation so far:\n");
        prompt.push_str("## Summary\n");
        prompt.push_str(summary);
        prompt.push_str("\n\n");
    }

    prompt.push_str("Here are the most recent messages between the user and the AI:\n");
    prompt.push_str("## Recent Messages\n");
    for message in &view.pending {
        prompt.push_str(&format!("{}: {}\n", message.role.as_str(), message.content));
    }

    prompt.push_str(include_str!("prompts/summary_request.txt"));
    prompt
}

/// Drives `view -> summarize -> commit` until nothing is pending.
pub struct Summarizer<'a, A: LlmAgent + ?Sized> {
    agent: &'a A,
    compactor: Compactor,
    max_attempts: usize,
}

impl<'a, A: LlmAgent + ?Sized> Summarizer<'a, A> {
    pub fn new(agent: &'a A, compactor: Compactor) -> Self {
        Self {
            agent,
            compactor,
            max_attempts: 3,
        }
    }

    /// Bound the number of summarization rounds before giving up.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Return a view with no pending messages, summarizing as needed.
    ///
    /// A provider error leaves the store untouched. A checkpoint race is
    /// retried with a fresh view; running out of attempts yields
    /// [`CompactionError::ConvergenceFailure`].
    #[instrument(skip(self, store, storyline, reporter), fields(storyline = %storyline))]
    pub async fn converge<S: Store>(
        &self,
        store: &mut S,
        storyline: &StorylineId,
        reporter: &Reporter,
    ) -> Result<ConversationView, CompactionError> {
        let mut attempts = 0;
        loop {
            let view = store.transaction(|t| self.compactor.view(t, storyline))?;
            if view.is_current() {
                return Ok(view);
            }
            if attempts == self.max_attempts {
                warn!(attempts, pending = view.pending.len(), "summaries did not converge");
                return Err(CompactionError::ConvergenceFailure {
                    storyline: storyline.clone(),
                    attempts,
                });
            }
            attempts += 1;

            info!(
                attempt = attempts,
                pending = view.pending.len(),
                from = view.pending.first().map(|m| m.id),
                until = view.pending_until(),
                "summarizing pending messages"
            );
            reporter.emit(SessionEvent::StageStarted(Stage::Summary));
            let stream = self
                .agent
                .run(SUMMARY_INSTRUCTIONS, &[AgentMessage::user(summary_prompt(&view))])
                .await?;
            let summary = collect_text(stream, Stage::Summary, reporter).await?;

            match store.transaction(|t| self.compactor.commit(t, &view, summary.trim())) {
                Ok(checkpoint) => reporter.emit(SessionEvent::CheckpointCommitted {
                    until_id: checkpoint.until_id,
                }),
                Err(CompactionError::CheckpointRace {
                    expected, found, ..
                }) => {
                    warn!(expected, found, "checkpoint race, recomputing view");
                }
                Err(err) => return Err(err),
            }
        }
    }
}
