//! Goal and milestone progression.
//!
//! After every player turn three classifiers look at the current exchange:
//! one decides whether the active milestone was reached, one which goals were
//! completed, and one whether new goals are needed. Each asks the model to
//! reason freely and end with a marker line; [`extract`] pulls the directive
//! out and the goal or milestone store applies it.

mod classify;
pub mod extract;
mod goals;
mod milestones;
pub mod prompts;

pub use classify::Progression;
pub use extract::{Classification, ParseError};
pub use goals::{goals_markdown, GoalBook, GoalOutcome};
pub use milestones::{ImportError, MilestoneOutcome, Progress, Sequencer};

use crate::agent::AgentError;
use crate::memory::ConversationView;
use crate::model::{Message, Role};
use crate::store::StoreError;
use thiserror::Error;
use tracing::debug;

/// Errors from a progression step. None of them leave partial state.
#[derive(Debug, Error)]
pub enum ProgressionError {
    #[error("could not read model output: {0}")]
    Parse(#[from] ParseError),

    #[error("classification failed: {0}")]
    Agent(#[from] AgentError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("unexpected conversation tail: {0}")]
    UnexpectedTail(String),
}

/// Why a classifier did not call the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NoActiveGoals,
    TooManyActiveGoals { count: usize, limit: usize },
    /// All milestones are done, or none exist.
    NoActiveMilestone(Progress),
    /// The exchange has no assistant message yet.
    NothingToClassify,
}

/// What one classifier step did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Skipped(SkipReason),
    Goals(Vec<GoalOutcome>),
    Milestone(MilestoneOutcome),
}

/// The latest player message and the reply it answers, if any.
#[derive(Debug, Clone, Copy)]
pub struct CurrentExchange<'v> {
    pub assistant: Option<&'v Message>,
    pub user: &'v Message,
}

/// Split the tail of a converged progression view into the current exchange.
///
/// The tail must be `[user]` or `[assistant, user]`.
pub fn current_exchange(view: &ConversationView) -> Result<CurrentExchange<'_>, ProgressionError> {
    let (assistant, user) = match view.tail.as_slice() {
        [user] => (None, user),
        [assistant, user] => (Some(assistant), user),
        other => {
            return Err(ProgressionError::UnexpectedTail(format!(
                "expected one or two messages, found {}",
                other.len()
            )))
        }
    };

    if let Some(assistant) = assistant {
        if assistant.role != Role::Assistant {
            return Err(ProgressionError::UnexpectedTail(format!(
                "expected message {} to be from the assistant, was {}",
                assistant.id,
                assistant.role.as_str()
            )));
        }
    }
    if user.role != Role::User {
        return Err(ProgressionError::UnexpectedTail(format!(
            "expected message {} to be from the user, was {}",
            user.id,
            user.role.as_str()
        )));
    }

    debug!(
        assistant = assistant.map(|m| m.id),
        user = user.id,
        "current exchange"
    );
    Ok(CurrentExchange { assistant, user })
}
