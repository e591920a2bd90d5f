//! Conversation memory: windowed views over the message log and the
//! summary checkpoints that keep them bounded.

mod summarizer;
mod window;

pub use summarizer::{summary_prompt, Summarizer, SUMMARY_INSTRUCTIONS};
pub use window::{Compactor, ConversationView, WindowConfig};

use crate::agent::AgentError;
use crate::model::StorylineId;
use crate::store::StoreError;
use thiserror::Error;

/// Errors from compaction.
#[derive(Debug, Error)]
pub enum CompactionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("summarization failed: {0}")]
    Agent(#[from] AgentError),

    #[error("no pending messages to summarize in '{0}'")]
    NothingPending(StorylineId),

    #[error("checkpoints of '{storyline}' moved from {expected} to {found} while summarizing")]
    CheckpointRace {
        storyline: StorylineId,
        expected: u64,
        found: u64,
    },

    #[error("'{storyline}' still has pending messages after {attempts} summarization attempts")]
    ConvergenceFailure {
        storyline: StorylineId,
        attempts: usize,
    },
}
