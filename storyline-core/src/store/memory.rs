//! In-memory backend.
//!
//! A transaction works on a draft of the tables and swaps it in only when the
//! closure succeeds, so a failed transaction leaves no trace. Partitions are
//! shared between the draft and the committed tables until written, so only
//! the storylines a transaction touches are copied.

use super::{GoalFilter, IdRange, Store, StoreError, Tables};
use crate::model::{Goal, Message, Milestone, Role, Storyline, StorylineId, SummaryCheckpoint};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
struct Partition {
    record: Option<Storyline>,
    last_message_id: u64,
    messages: BTreeMap<u64, Message>,
    checkpoints: BTreeMap<u64, SummaryCheckpoint>,
    goals: BTreeMap<String, Goal>,
    milestones: BTreeMap<String, Milestone>,
}

#[derive(Debug, Clone, Default)]
struct MemoryTables {
    partitions: BTreeMap<StorylineId, Arc<Partition>>,
}

impl MemoryTables {
    fn partition(&self, storyline: &StorylineId) -> Option<&Partition> {
        self.partitions.get(storyline).map(Arc::as_ref)
    }

    fn partition_mut(&mut self, storyline: &StorylineId) -> &mut Partition {
        Arc::make_mut(self.partitions.entry(storyline.clone()).or_default())
    }
}

/// Ephemeral store, used by tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: MemoryTables,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn transaction<T, E>(
        &mut self,
        f: impl FnOnce(&mut dyn Tables) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let mut draft = self.tables.clone();
        let out = f(&mut draft)?;
        self.tables = draft;
        Ok(out)
    }
}

impl Tables for MemoryTables {
    fn storyline(&self, id: &StorylineId) -> Result<Option<Storyline>, StoreError> {
        Ok(self.partition(id).and_then(|p| p.record.clone()))
    }

    fn upsert_storyline(&mut self, storyline: &Storyline) -> Result<(), StoreError> {
        self.partition_mut(&storyline.id).record = Some(storyline.clone());
        Ok(())
    }

    fn delete_storyline(&mut self, id: &StorylineId) -> Result<bool, StoreError> {
        Ok(self.partitions.remove(id).is_some_and(|p| {
            p.record.is_some()
                || !p.messages.is_empty()
                || !p.checkpoints.is_empty()
                || !p.goals.is_empty()
                || !p.milestones.is_empty()
        }))
    }

    fn append_message(
        &mut self,
        storyline: &StorylineId,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        let partition = self.partition_mut(storyline);
        partition.last_message_id += 1;
        let message = Message {
            storyline: storyline.clone(),
            id: partition.last_message_id,
            role,
            content: content.to_string(),
        };
        partition.messages.insert(message.id, message.clone());
        Ok(message)
    }

    fn messages(&self, storyline: &StorylineId, range: IdRange) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .partition(storyline)
            .map(|p| {
                p.messages
                    .values()
                    .filter(|m| range.contains(m.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn latest_messages(
        &self,
        storyline: &StorylineId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let mut latest: Vec<Message> = self
            .partition(storyline)
            .map(|p| p.messages.values().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        latest.reverse();
        Ok(latest)
    }

    fn delete_messages_from(
        &mut self,
        storyline: &StorylineId,
        from_id: u64,
    ) -> Result<usize, StoreError> {
        let partition = self.partition_mut(storyline);
        let removed = partition.messages.split_off(&from_id);
        Ok(removed.len())
    }

    fn insert_checkpoint(&mut self, checkpoint: &SummaryCheckpoint) -> Result<(), StoreError> {
        let partition = self.partition_mut(&checkpoint.storyline);
        if let Some(&latest) = partition.checkpoints.keys().next_back() {
            if checkpoint.until_id <= latest {
                return Err(StoreError::StaleCheckpoint {
                    storyline: checkpoint.storyline.clone(),
                    until_id: checkpoint.until_id,
                    latest,
                });
            }
        }
        partition
            .checkpoints
            .insert(checkpoint.until_id, checkpoint.clone());
        Ok(())
    }

    fn latest_checkpoint(
        &self,
        storyline: &StorylineId,
        below: Option<u64>,
    ) -> Result<Option<SummaryCheckpoint>, StoreError> {
        Ok(self.partition(storyline).and_then(|p| {
            p.checkpoints
                .values()
                .rev()
                .find(|c| below.is_none_or(|below| c.until_id < below))
                .cloned()
        }))
    }

    fn checkpoints(&self, storyline: &StorylineId) -> Result<Vec<SummaryCheckpoint>, StoreError> {
        Ok(self
            .partition(storyline)
            .map(|p| p.checkpoints.values().cloned().collect())
            .unwrap_or_default())
    }

    fn delete_checkpoints_from(
        &mut self,
        storyline: &StorylineId,
        from_until_id: u64,
    ) -> Result<usize, StoreError> {
        let partition = self.partition_mut(storyline);
        Ok(partition.checkpoints.split_off(&from_until_id).len())
    }

    fn goal(&self, storyline: &StorylineId, name: &str) -> Result<Option<Goal>, StoreError> {
        Ok(self
            .partition(storyline)
            .and_then(|p| p.goals.get(name).cloned()))
    }

    fn goals(&self, storyline: &StorylineId, filter: GoalFilter) -> Result<Vec<Goal>, StoreError> {
        Ok(self
            .partition(storyline)
            .map(|p| {
                p.goals
                    .values()
                    .filter(|g| filter.matches(g))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn upsert_goal(&mut self, goal: &Goal) -> Result<(), StoreError> {
        self.partition_mut(&goal.storyline)
            .goals
            .insert(goal.name.clone(), goal.clone());
        Ok(())
    }

    fn delete_goal(&mut self, storyline: &StorylineId, name: &str) -> Result<bool, StoreError> {
        Ok(self.partition_mut(storyline).goals.remove(name).is_some())
    }

    fn milestones(&self, storyline: &StorylineId) -> Result<Vec<Milestone>, StoreError> {
        let mut milestones: Vec<Milestone> = self
            .partition(storyline)
            .map(|p| p.milestones.values().cloned().collect())
            .unwrap_or_default();
        milestones.sort_by_key(|m| m.order);
        Ok(milestones)
    }

    fn upsert_milestone(&mut self, milestone: &Milestone) -> Result<(), StoreError> {
        let partition = self.partition_mut(&milestone.storyline);
        if let Some(existing) = partition
            .milestones
            .values()
            .find(|m| m.order == milestone.order && m.name != milestone.name)
        {
            return Err(StoreError::DuplicateMilestoneOrder {
                storyline: milestone.storyline.clone(),
                order: milestone.order,
                existing: existing.name.clone(),
            });
        }
        partition
            .milestones
            .insert(milestone.name.clone(), milestone.clone());
        Ok(())
    }

    fn delete_milestone(
        &mut self,
        storyline: &StorylineId,
        name: &str,
    ) -> Result<bool, StoreError> {
        Ok(self.partition_mut(storyline).milestones.remove(name).is_some())
    }
}
