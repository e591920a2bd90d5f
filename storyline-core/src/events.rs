//! Progress notifications published while a turn runs.
//!
//! A [`Reporter`] is handed to every stage of the pipeline. When it has a
//! channel attached, streamed fragments and progression outcomes are sent
//! over it as [`SessionEvent`]s; otherwise reporting is a no-op.

use crate::progression::{GoalOutcome, MilestoneOutcome, SkipReason};
use tokio::sync::mpsc::UnboundedSender;

/// The pipeline stage a fragment or report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Summary,
    MilestoneCompletion,
    GoalCompletion,
    GoalCreation,
    Character,
    ImagePrompt,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Summary => "summary",
            Stage::MilestoneCompletion => "milestone completion",
            Stage::GoalCompletion => "goal completion",
            Stage::GoalCreation => "goal creation",
            Stage::Character => "character",
            Stage::ImagePrompt => "image prompt",
        }
    }
}

/// Something that happened during a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A stage started calling the model.
    StageStarted(Stage),
    /// A streamed piece of model output.
    Fragment { stage: Stage, text: String },
    /// A stage decided not to call the model.
    Skipped { stage: Stage, reason: SkipReason },
    /// A summary checkpoint was written.
    CheckpointCommitted { until_id: u64 },
    Goal(GoalOutcome),
    Milestone(MilestoneOutcome),
}

/// Optional sink for [`SessionEvent`]s.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    sender: Option<UnboundedSender<SessionEvent>>,
}

impl Reporter {
    /// A reporter that drops every event.
    pub fn silent() -> Self {
        Self::default()
    }

    pub fn new(sender: UnboundedSender<SessionEvent>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Publish an event. A closed receiver is ignored.
    pub fn emit(&self, event: SessionEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }

    pub fn fragment(&self, stage: Stage, text: &str) {
        if self.sender.is_some() {
            self.emit(SessionEvent::Fragment {
                stage,
                text: text.to_string(),
            });
        }
    }
}
