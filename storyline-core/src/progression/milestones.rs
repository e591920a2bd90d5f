//! The milestone sequencer.
//!
//! The active milestone is never stored. It is recomputed on each read as the
//! lowest-order milestone that is not completed, so completing one advances
//! the storyline without any explicit step.

use super::extract::Classification;
use crate::model::{Milestone, StorylineId};
use crate::store::{Store, StoreError};
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use tracing::{info, warn};

/// Where a storyline stands in its scripted milestones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// `milestone` is the current step, `position` is 1-based.
    Active {
        milestone: Milestone,
        position: usize,
        total: usize,
    },
    /// Every milestone is completed; the story may go anywhere.
    OpenEnded { total: usize },
    /// No milestones are defined.
    Unscripted,
}

impl Progress {
    /// Compute progress from milestones in any order.
    pub fn of(milestones: &[Milestone]) -> Self {
        if milestones.is_empty() {
            return Progress::Unscripted;
        }
        let total = milestones.len();
        let completed = milestones.iter().filter(|m| m.completed).count();
        match milestones
            .iter()
            .filter(|m| !m.completed)
            .min_by_key(|m| m.order)
        {
            Some(active) => Progress::Active {
                milestone: active.clone(),
                position: completed + 1,
                total,
            },
            None => Progress::OpenEnded { total },
        }
    }

    pub fn active(&self) -> Option<&Milestone> {
        match self {
            Progress::Active { milestone, .. } => Some(milestone),
            _ => None,
        }
    }

    /// The milestone section of the character's instructions.
    pub fn character_prompt(&self, character_name: &str) -> String {
        match self {
            Progress::Active {
                milestone,
                position,
                total,
            } => format!(
                "We are currently at milestone ({position}/{total}) '{}' described as:\n{}\n\n---\n\n\
                 '{character_name}' must steer the conversation towards the completion of the milestone.\n",
                milestone.name, milestone.description
            ),
            Progress::OpenEnded { .. } | Progress::Unscripted => {
                "<All milestones have been completed the storyline may now head in any direction>"
                    .to_string()
            }
        }
    }

    /// The active milestone as the classifiers see it.
    pub fn markdown(&self) -> String {
        match self {
            Progress::Active { milestone, .. } => format!(
                "## Milestone#{}: {}\n{}\n",
                milestone.order, milestone.name, milestone.description
            ),
            Progress::OpenEnded { .. } => {
                "<All milestones complete. No milestones remaining.>".to_string()
            }
            Progress::Unscripted => "<No milestones defined. The story is unscripted.>".to_string(),
        }
    }
}

/// Result of a milestone directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilestoneOutcome {
    Completed { name: String },
    StillIncomplete { name: String },
    AlreadyCompleted { name: String },
    NotFound { name: String },
    /// An edit was refused because another milestone has this name.
    AlreadyExists { name: String },
    Updated { name: String },
    /// There was no active milestone to classify.
    OpenEnded,
}

/// Errors from a bulk milestone import.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("invalid milestone list: {0}")]
    Json(#[from] serde_json::Error),

    #[error("milestone '{0}' appears more than once")]
    DuplicateName(String),

    #[error("milestone order {0} appears more than once")]
    DuplicateOrder(i64),

    #[error("milestone '{0}' already exists")]
    AlreadyExists(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Deserialize)]
struct MilestoneEntry {
    order: i64,
    name: String,
    #[serde(default)]
    description: String,
}

/// Milestone operations for one storyline.
pub struct Sequencer<'a, S: Store> {
    store: &'a mut S,
    storyline: StorylineId,
}

impl<'a, S: Store> Sequencer<'a, S> {
    pub fn new(store: &'a mut S, storyline: StorylineId) -> Self {
        Self { store, storyline }
    }

    /// All milestones by order.
    pub fn list(&mut self) -> Result<Vec<Milestone>, StoreError> {
        let storyline = &self.storyline;
        self.store.transaction(|t| t.milestones(storyline))
    }

    pub fn progress(&mut self) -> Result<Progress, StoreError> {
        Ok(Progress::of(&self.list()?))
    }

    pub fn active(&mut self) -> Result<Option<Milestone>, StoreError> {
        Ok(self.progress()?.active().cloned())
    }

    /// Mark `name` completed.
    pub fn complete(&mut self, name: &str) -> Result<MilestoneOutcome, StoreError> {
        let storyline = &self.storyline;
        let outcome = self.store.transaction(|t| {
            let existing = t.milestones(storyline)?.into_iter().find(|m| m.name == name);
            let outcome = match existing {
                None => MilestoneOutcome::NotFound {
                    name: name.to_string(),
                },
                Some(m) if m.completed => MilestoneOutcome::AlreadyCompleted {
                    name: name.to_string(),
                },
                Some(mut m) => {
                    m.completed = true;
                    t.upsert_milestone(&m)?;
                    MilestoneOutcome::Completed {
                        name: name.to_string(),
                    }
                }
            };
            Ok::<_, StoreError>(outcome)
        })?;

        match &outcome {
            MilestoneOutcome::NotFound { name } => {
                warn!(storyline = %storyline, milestone = %name, "milestone not found")
            }
            other => info!(storyline = %storyline, outcome = ?other, "milestone updated"),
        }
        Ok(outcome)
    }

    /// Apply a classifier verdict to the milestone named `name`.
    pub fn apply_classification(
        &mut self,
        name: &str,
        verdict: Classification,
    ) -> Result<MilestoneOutcome, StoreError> {
        match verdict {
            Classification::Complete => self.complete(name),
            Classification::Incomplete => {
                info!(storyline = %self.storyline, milestone = name, "milestone still incomplete");
                Ok(MilestoneOutcome::StillIncomplete {
                    name: name.to_string(),
                })
            }
        }
    }

    /// Insert or overwrite a milestone.
    pub fn upsert(&mut self, milestone: Milestone) -> Result<(), StoreError> {
        let milestone = Milestone {
            storyline: self.storyline.clone(),
            ..milestone
        };
        self.store.transaction(|t| t.upsert_milestone(&milestone))
    }

    /// Rename or edit the milestone stored as `original_name`.
    ///
    /// Renaming onto another existing milestone is refused.
    pub fn update(
        &mut self,
        original_name: &str,
        milestone: Milestone,
    ) -> Result<MilestoneOutcome, StoreError> {
        let storyline = &self.storyline;
        let milestone = Milestone {
            storyline: storyline.clone(),
            ..milestone
        };
        let outcome = self.store.transaction(|t| {
            let existing = t.milestones(storyline)?;
            if !existing.iter().any(|m| m.name == original_name) {
                return Ok::<_, StoreError>(MilestoneOutcome::NotFound {
                    name: original_name.to_string(),
                });
            }
            if milestone.name != original_name && existing.iter().any(|m| m.name == milestone.name) {
                return Ok(MilestoneOutcome::AlreadyExists {
                    name: milestone.name.clone(),
                });
            }
            t.delete_milestone(storyline, original_name)?;
            t.upsert_milestone(&milestone)?;
            Ok(MilestoneOutcome::Updated {
                name: milestone.name.clone(),
            })
        })?;
        info!(storyline = %storyline, outcome = ?outcome, "milestone edit");
        Ok(outcome)
    }

    pub fn delete(&mut self, name: &str) -> Result<bool, StoreError> {
        let storyline = &self.storyline;
        self.store.transaction(|t| t.delete_milestone(storyline, name))
    }

    /// Add milestones from a JSON list of `{"order", "name", "description"}`.
    ///
    /// The whole list is added in one transaction; any duplicate name or
    /// order, within the list or against stored milestones, rejects it.
    pub fn import_json(&mut self, json: &str) -> Result<usize, ImportError> {
        let entries: Vec<MilestoneEntry> = serde_json::from_str(json)?;

        let mut names = HashSet::new();
        let mut orders = HashSet::new();
        for entry in &entries {
            if !names.insert(entry.name.as_str()) {
                return Err(ImportError::DuplicateName(entry.name.clone()));
            }
            if !orders.insert(entry.order) {
                return Err(ImportError::DuplicateOrder(entry.order));
            }
        }

        let storyline = &self.storyline;
        let count = self.store.transaction(|t| {
            let existing = t.milestones(storyline)?;
            for entry in &entries {
                if existing.iter().any(|m| m.name == entry.name) {
                    return Err(ImportError::AlreadyExists(entry.name.clone()));
                }
                let milestone = Milestone::new(
                    storyline.clone(),
                    entry.order,
                    entry.name.clone(),
                    entry.description.clone(),
                );
                t.upsert_milestone(&milestone)?;
            }
            Ok(entries.len())
        })?;
        info!(storyline = %storyline, count, "milestones imported");
        Ok(count)
    }
}
