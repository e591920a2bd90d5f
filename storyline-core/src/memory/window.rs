//! Sliding-window compaction of the message log.
//!
//! The view of a conversation is the latest summary checkpoint plus a short
//! tail of recent messages. Messages that have fallen out of the tail but are
//! not yet covered by a checkpoint are *pending*: they must be summarized
//! before the view is usable.
//!
//! Given the last `window_size` messages, the boundary is the first message
//! of the tail (`window[window_size - tail_size]`). The low-water mark is the
//! `until_id` of the latest checkpoint strictly below the boundary, and the
//! pending messages are those with `low_water < id < boundary` that no stored
//! checkpoint covers yet.
//!
//! After a truncation the freshest checkpoint may reach past the new
//! boundary. It still covers everything up to its `until_id`, so it becomes
//! the summary of the view and nothing below it is pending.

use super::CompactionError;
use crate::model::{Message, StorylineId, SummaryCheckpoint};
use crate::store::{IdRange, Tables};
use tracing::{debug, info};

/// Shape of the sliding window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowConfig {
    /// Number of most recent messages inspected.
    pub window_size: usize,
    /// Number of messages kept verbatim at the end of the view.
    pub tail_size: usize,
}

impl WindowConfig {
    /// A window of `window_size` messages keeping `tail_size` of them.
    ///
    /// The tail is at least one message and never larger than the window.
    pub fn new(window_size: usize, tail_size: usize) -> Self {
        let window_size = window_size.max(1);
        Self {
            window_size,
            tail_size: tail_size.clamp(1, window_size),
        }
    }

    /// The window used for the character's conversation.
    pub fn conversation() -> Self {
        Self::new(8, 2)
    }

    /// The window used by the progression classifiers: only the current
    /// exchange stays verbatim.
    pub fn progression() -> Self {
        Self::new(2, 2)
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self::conversation()
    }
}

/// A snapshot of one storyline's conversation under a [`WindowConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub storyline: StorylineId,
    /// Freshest checkpoint, the summary preceding the tail.
    pub latest_checkpoint: Option<SummaryCheckpoint>,
    /// `until_id` of the latest checkpoint strictly below the boundary, or 0.
    pub low_water_mark: u64,
    /// Id of the first tail message when the log fills the window.
    pub boundary_id: Option<u64>,
    /// Messages awaiting summarization, ascending.
    pub pending: Vec<Message>,
    /// Most recent messages, ascending.
    pub tail: Vec<Message>,
}

impl ConversationView {
    /// True when nothing is waiting to be summarized.
    pub fn is_current(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn summary(&self) -> Option<&str> {
        self.latest_checkpoint.as_ref().map(|c| c.content.as_str())
    }

    /// The `until_id` a checkpoint over the pending messages would carry.
    pub fn pending_until(&self) -> Option<u64> {
        self.pending.last().map(|m| m.id)
    }
}

/// Computes views and commits checkpoints for one window shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct Compactor {
    config: WindowConfig,
}

impl Compactor {
    pub fn new(config: WindowConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> WindowConfig {
        self.config
    }

    /// Compute the current view. Read-only.
    pub fn view(
        &self,
        tables: &dyn Tables,
        storyline: &StorylineId,
    ) -> Result<ConversationView, CompactionError> {
        let WindowConfig {
            window_size,
            tail_size,
        } = self.config;
        let window = tables.latest_messages(storyline, window_size)?;

        if window.len() < window_size {
            debug!(
                storyline = %storyline,
                messages = window.len(),
                window_size,
                "log shorter than window, no compaction needed"
            );
            return Ok(ConversationView {
                storyline: storyline.clone(),
                latest_checkpoint: None,
                low_water_mark: 0,
                boundary_id: None,
                pending: Vec::new(),
                tail: window,
            });
        }

        let split = window_size - tail_size;
        let boundary_id = window[split].id;
        let low_water_mark = tables
            .latest_checkpoint(storyline, Some(boundary_id))?
            .map_or(0, |c| c.until_id);
        let latest_checkpoint = tables.latest_checkpoint(storyline, None)?;
        let covered = latest_checkpoint.as_ref().map_or(0, |c| c.until_id);
        let pending = if covered < boundary_id {
            tables.messages(storyline, IdRange::between(covered, boundary_id))?
        } else {
            Vec::new()
        };
        let tail = window[split..].to_vec();

        debug!(
            storyline = %storyline,
            boundary_id,
            low_water_mark,
            covered,
            pending = pending.len(),
            "computed conversation view"
        );

        Ok(ConversationView {
            storyline: storyline.clone(),
            latest_checkpoint,
            low_water_mark,
            boundary_id: Some(boundary_id),
            pending,
            tail,
        })
    }

    /// Persist a checkpoint covering the pending messages of `view`.
    ///
    /// The latest checkpoint below the boundary must still be the one the
    /// view observed, and the new `until_id` must exceed every stored
    /// checkpoint. Otherwise fails with [`CompactionError::CheckpointRace`].
    pub fn commit(
        &self,
        tables: &mut dyn Tables,
        view: &ConversationView,
        summary: &str,
    ) -> Result<SummaryCheckpoint, CompactionError> {
        let storyline = &view.storyline;
        let (Some(until_id), Some(boundary_id)) = (view.pending_until(), view.boundary_id) else {
            return Err(CompactionError::NothingPending(storyline.clone()));
        };

        let below = tables
            .latest_checkpoint(storyline, Some(boundary_id))?
            .map_or(0, |c| c.until_id);
        let latest = tables
            .latest_checkpoint(storyline, None)?
            .map_or(0, |c| c.until_id);
        if below != view.low_water_mark || latest >= until_id {
            return Err(CompactionError::CheckpointRace {
                storyline: storyline.clone(),
                expected: view.low_water_mark,
                found: latest,
            });
        }

        let from = view.latest_checkpoint.as_ref().map_or(0, |c| c.until_id);
        let current: Vec<u64> = tables
            .messages(storyline, IdRange::between(from, until_id + 1))?
            .iter()
            .map(|m| m.id)
            .collect();
        let observed: Vec<u64> = view.pending.iter().map(|m| m.id).collect();
        if current != observed {
            return Err(CompactionError::CheckpointRace {
                storyline: storyline.clone(),
                expected: view.low_water_mark,
                found: latest,
            });
        }

        let checkpoint = SummaryCheckpoint {
            storyline: storyline.clone(),
            until_id,
            content: summary.to_string(),
        };
        tables.insert_checkpoint(&checkpoint)?;
        info!(
            storyline = %storyline,
            until_id,
            summarized = view.pending.len(),
            "committed summary checkpoint"
        );
        Ok(checkpoint)
    }
}
