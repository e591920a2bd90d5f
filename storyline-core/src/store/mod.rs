//! Persistence seam for the four storyline partitions.
//!
//! All reads and writes go through [`Store::transaction`]: the closure receives
//! a [`Tables`] handle, and its result decides the outcome. `Ok` commits every
//! write made through the handle, `Err` discards all of them.
//!
//! Two backends are provided:
//! - [`MemoryStore`], a copy-on-write in-memory store
//! - [`SqliteStore`], a SQLite database file

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::model::{Goal, Message, Milestone, Persistence, Role, Storyline, StorylineId, SummaryCheckpoint};
use thiserror::Error;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint until_id {until_id} for '{storyline}' does not advance past {latest}")]
    StaleCheckpoint {
        storyline: StorylineId,
        until_id: u64,
        latest: u64,
    },

    #[error("milestone order {order} in '{storyline}' is already used by '{existing}'")]
    DuplicateMilestoneOrder {
        storyline: StorylineId,
        order: i64,
        existing: String,
    },

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

/// Exclusive bounds on message ids.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdRange {
    /// Only ids strictly greater than this.
    pub after: Option<u64>,
    /// Only ids strictly less than this.
    pub before: Option<u64>,
}

impl IdRange {
    pub fn all() -> Self {
        Self::default()
    }

    /// Ids with `after < id < before`.
    pub fn between(after: u64, before: u64) -> Self {
        Self {
            after: Some(after),
            before: Some(before),
        }
    }

    pub fn contains(&self, id: u64) -> bool {
        self.after.is_none_or(|after| id > after) && self.before.is_none_or(|before| id < before)
    }
}

/// Selection of goals by completion and persistence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GoalFilter {
    pub completed: Option<bool>,
    pub exclude: Option<Persistence>,
}

impl GoalFilter {
    pub fn all() -> Self {
        Self::default()
    }

    /// Goals not yet completed.
    pub fn active() -> Self {
        Self {
            completed: Some(false),
            exclude: None,
        }
    }

    pub fn excluding(mut self, persistence: Persistence) -> Self {
        self.exclude = Some(persistence);
        self
    }

    pub fn matches(&self, goal: &Goal) -> bool {
        self.completed.is_none_or(|completed| goal.completed == completed)
            && self.exclude != Some(goal.persistence)
    }
}

/// Operations available inside a transaction.
///
/// Every operation is scoped to one storyline; no call reads or writes
/// another partition.
pub trait Tables {
    // Storylines

    fn storyline(&self, id: &StorylineId) -> Result<Option<Storyline>, StoreError>;

    fn upsert_storyline(&mut self, storyline: &Storyline) -> Result<(), StoreError>;

    /// Remove the storyline record and everything partitioned under it.
    fn delete_storyline(&mut self, id: &StorylineId) -> Result<bool, StoreError>;

    // Messages

    /// Append a message, allocating the next id for the storyline.
    fn append_message(
        &mut self,
        storyline: &StorylineId,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Messages in `range`, ascending by id.
    fn messages(&self, storyline: &StorylineId, range: IdRange) -> Result<Vec<Message>, StoreError>;

    /// The last `limit` messages, ascending by id.
    fn latest_messages(
        &self,
        storyline: &StorylineId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// Delete messages with `id >= from_id`.
    fn delete_messages_from(
        &mut self,
        storyline: &StorylineId,
        from_id: u64,
    ) -> Result<usize, StoreError>;

    // Checkpoints

    /// Insert a checkpoint whose `until_id` exceeds every stored one.
    fn insert_checkpoint(&mut self, checkpoint: &SummaryCheckpoint) -> Result<(), StoreError>;

    /// The checkpoint with the highest `until_id`, restricted to
    /// `until_id < below` when given.
    fn latest_checkpoint(
        &self,
        storyline: &StorylineId,
        below: Option<u64>,
    ) -> Result<Option<SummaryCheckpoint>, StoreError>;

    /// All checkpoints, ascending by `until_id`.
    fn checkpoints(&self, storyline: &StorylineId) -> Result<Vec<SummaryCheckpoint>, StoreError>;

    /// Delete checkpoints with `until_id >= from_until_id`.
    fn delete_checkpoints_from(
        &mut self,
        storyline: &StorylineId,
        from_until_id: u64,
    ) -> Result<usize, StoreError>;

    // Goals

    fn goal(&self, storyline: &StorylineId, name: &str) -> Result<Option<Goal>, StoreError>;

    /// Goals matching `filter`, ordered by name.
    fn goals(&self, storyline: &StorylineId, filter: GoalFilter) -> Result<Vec<Goal>, StoreError>;

    /// Insert or overwrite the goal keyed by `(storyline, name)`.
    fn upsert_goal(&mut self, goal: &Goal) -> Result<(), StoreError>;

    fn delete_goal(&mut self, storyline: &StorylineId, name: &str) -> Result<bool, StoreError>;

    // Milestones

    /// All milestones, ascending by order.
    fn milestones(&self, storyline: &StorylineId) -> Result<Vec<Milestone>, StoreError>;

    /// Insert or overwrite the milestone keyed by `(storyline, name)`.
    ///
    /// Fails with [`StoreError::DuplicateMilestoneOrder`] if another
    /// milestone already holds the same order.
    fn upsert_milestone(&mut self, milestone: &Milestone) -> Result<(), StoreError>;

    fn delete_milestone(&mut self, storyline: &StorylineId, name: &str)
        -> Result<bool, StoreError>;
}

/// A backend able to run a closure as one atomic unit.
pub trait Store {
    /// Run `f` against the tables. Writes are committed only if `f` returns
    /// `Ok`; on `Err` the store is left exactly as it was.
    fn transaction<T, E>(
        &mut self,
        f: impl FnOnce(&mut dyn Tables) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>;
}
