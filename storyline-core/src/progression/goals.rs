//! The goal progression store.
//!
//! A goal is Active until it is completed. Creation and completion only ever
//! move goals forward; [`GoalBook::update`] is the editor's escape hatch for
//! overwriting fields directly (including reopening a completed goal).
//!
//! Every mutation runs in its own transaction, so a batch applies each entry
//! independently and reports one [`GoalOutcome`] per key.

use super::extract::Classification;
use crate::model::{Goal, Persistence, StorylineId};
use crate::store::{GoalFilter, Store, StoreError};
use serde_json::{Map, Value};
use tracing::{info, warn};

/// Result of applying one goal directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GoalOutcome {
    Created { name: String },
    /// A goal with this name already exists; nothing was changed.
    AlreadyExists { name: String },
    Completed { name: String },
    AlreadyCompleted { name: String },
    /// Classified INCOMPLETE; nothing to do.
    Skipped { name: String },
    NotFound { name: String },
    Updated { name: String },
    /// The directive for this key could not be applied.
    Invalid { name: String, reason: String },
}

impl GoalOutcome {
    pub fn name(&self) -> &str {
        match self {
            GoalOutcome::Created { name }
            | GoalOutcome::AlreadyExists { name }
            | GoalOutcome::Completed { name }
            | GoalOutcome::AlreadyCompleted { name }
            | GoalOutcome::Skipped { name }
            | GoalOutcome::NotFound { name }
            | GoalOutcome::Updated { name }
            | GoalOutcome::Invalid { name, .. } => name,
        }
    }

    /// True for outcomes the user should be warned about.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            GoalOutcome::AlreadyExists { .. }
                | GoalOutcome::NotFound { .. }
                | GoalOutcome::Invalid { .. }
        )
    }
}

/// Goal operations for one storyline.
pub struct GoalBook<'a, S: Store> {
    store: &'a mut S,
    storyline: StorylineId,
}

impl<'a, S: Store> GoalBook<'a, S> {
    pub fn new(store: &'a mut S, storyline: StorylineId) -> Self {
        Self { store, storyline }
    }

    /// Create an Active goal unless one with `name` exists.
    pub fn create(
        &mut self,
        name: &str,
        description: &str,
        persistence: Persistence,
    ) -> Result<GoalOutcome, StoreError> {
        let storyline = &self.storyline;
        let outcome = self.store.transaction(|t| {
            if t.goal(storyline, name)?.is_some() {
                return Ok::<_, StoreError>(GoalOutcome::AlreadyExists {
                    name: name.to_string(),
                });
            }
            let goal = Goal::new(storyline.clone(), name, description).with_persistence(persistence);
            t.upsert_goal(&goal)?;
            Ok(GoalOutcome::Created {
                name: name.to_string(),
            })
        })?;
        log_outcome(storyline, &outcome);
        Ok(outcome)
    }

    /// Mark `name` completed.
    pub fn complete(&mut self, name: &str) -> Result<GoalOutcome, StoreError> {
        let storyline = &self.storyline;
        let outcome = self.store.transaction(|t| {
            let outcome = match t.goal(storyline, name)? {
                None => GoalOutcome::NotFound {
                    name: name.to_string(),
                },
                Some(goal) if goal.completed => GoalOutcome::AlreadyCompleted {
                    name: name.to_string(),
                },
                Some(mut goal) => {
                    goal.completed = true;
                    t.upsert_goal(&goal)?;
                    GoalOutcome::Completed {
                        name: name.to_string(),
                    }
                }
            };
            Ok::<_, StoreError>(outcome)
        })?;
        log_outcome(storyline, &outcome);
        Ok(outcome)
    }

    /// Apply a `name -> "COMPLETE" | "INCOMPLETE"` mapping in key order.
    ///
    /// A failure on one key is reported as [`GoalOutcome::Invalid`] and does
    /// not stop the remaining keys.
    pub fn apply_classifications(&mut self, payload: &Map<String, Value>) -> Vec<GoalOutcome> {
        payload
            .iter()
            .map(|(name, value)| {
                let verdict = value.as_str().and_then(|v| v.parse::<Classification>().ok());
                match verdict {
                    Some(Classification::Incomplete) => GoalOutcome::Skipped { name: name.clone() },
                    Some(Classification::Complete) => self
                        .complete(name)
                        .unwrap_or_else(|e| invalid(&self.storyline, name, e.to_string())),
                    None => invalid(
                        &self.storyline,
                        name,
                        format!("expected COMPLETE or INCOMPLETE, got {value}"),
                    ),
                }
            })
            .collect()
    }

    /// Apply a `name -> description` mapping in key order.
    ///
    /// A value may also be `{"description": ..., "persistence": ...}`; a bare
    /// string creates a goal with the default persistence.
    pub fn apply_creations(&mut self, payload: &Map<String, Value>) -> Vec<GoalOutcome> {
        payload
            .iter()
            .map(|(name, value)| match creation_fields(name, value) {
                Ok((description, persistence)) => self
                    .create(name.trim(), &description, persistence)
                    .unwrap_or_else(|e| invalid(&self.storyline, name, e.to_string())),
                Err(reason) => invalid(&self.storyline, name, reason),
            })
            .collect()
    }

    /// Overwrite the goal stored as `original_name` with `goal`.
    ///
    /// Renaming onto another existing goal is refused.
    pub fn update(&mut self, original_name: &str, goal: Goal) -> Result<GoalOutcome, StoreError> {
        let storyline = &self.storyline;
        let goal = Goal {
            storyline: storyline.clone(),
            ..goal
        };
        let outcome = self.store.transaction(|t| {
            if t.goal(storyline, original_name)?.is_none() {
                return Ok::<_, StoreError>(GoalOutcome::NotFound {
                    name: original_name.to_string(),
                });
            }
            if goal.name != original_name && t.goal(storyline, &goal.name)?.is_some() {
                return Ok(GoalOutcome::AlreadyExists {
                    name: goal.name.clone(),
                });
            }
            t.delete_goal(storyline, original_name)?;
            t.upsert_goal(&goal)?;
            Ok(GoalOutcome::Updated {
                name: goal.name.clone(),
            })
        })?;
        log_outcome(storyline, &outcome);
        Ok(outcome)
    }

    pub fn delete(&mut self, name: &str) -> Result<bool, StoreError> {
        let storyline = &self.storyline;
        let deleted = self.store.transaction(|t| t.delete_goal(storyline, name))?;
        if deleted {
            info!(storyline = %storyline, goal = name, "goal deleted");
        }
        Ok(deleted)
    }

    /// Reopen every completed goal. Returns how many were reopened.
    pub fn uncheck_all(&mut self) -> Result<usize, StoreError> {
        let storyline = &self.storyline;
        self.store.transaction(|t| {
            let done = t.goals(
                storyline,
                GoalFilter {
                    completed: Some(true),
                    exclude: None,
                },
            )?;
            for mut goal in done.iter().cloned() {
                goal.completed = false;
                t.upsert_goal(&goal)?;
            }
            Ok(done.len())
        })
    }

    /// Every goal, active ones first, then by name.
    pub fn list(&mut self) -> Result<Vec<Goal>, StoreError> {
        let storyline = &self.storyline;
        let mut goals = self.store.transaction(|t| t.goals(storyline, GoalFilter::all()))?;
        goals.sort_by(|a, b| (a.completed, &a.name).cmp(&(b.completed, &b.name)));
        Ok(goals)
    }

    /// Incomplete goals by name, optionally leaving out `Forever` ones.
    pub fn active(&mut self, exclude_forever: bool) -> Result<Vec<Goal>, StoreError> {
        let storyline = &self.storyline;
        let filter = if exclude_forever {
            GoalFilter::active().excluding(Persistence::Forever)
        } else {
            GoalFilter::active()
        };
        self.store.transaction(|t| t.goals(storyline, filter))
    }
}

fn creation_fields(name: &str, value: &Value) -> Result<(String, Persistence), String> {
    if name.trim().is_empty() {
        return Err("goal name is empty".to_string());
    }
    let (description, persistence) = match value {
        Value::String(description) => (description.as_str(), Persistence::default()),
        Value::Object(fields) => {
            let description = fields
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let persistence = match fields.get("persistence").and_then(Value::as_str) {
                Some(p) => p.parse().map_err(|e| format!("{e}"))?,
                None => Persistence::default(),
            };
            (description, persistence)
        }
        other => return Err(format!("expected a description, got {other}")),
    };
    if description.trim().is_empty() {
        return Err("goal description is empty".to_string());
    }
    Ok((description.trim().to_string(), persistence))
}

fn invalid(storyline: &StorylineId, name: &str, reason: String) -> GoalOutcome {
    let outcome = GoalOutcome::Invalid {
        name: name.to_string(),
        reason,
    };
    log_outcome(storyline, &outcome);
    outcome
}

fn log_outcome(storyline: &StorylineId, outcome: &GoalOutcome) {
    if outcome.is_warning() {
        warn!(storyline = %storyline, ?outcome, "goal directive not applied");
    } else {
        info!(storyline = %storyline, ?outcome, "goal updated");
    }
}

/// Render goals as the markdown table the prompts embed.
pub fn goals_markdown(goals: &[Goal]) -> String {
    let mut table = String::from("## Current Goals\n");
    table.push_str("| Name | Description | Completed | Persistence |\n");
    table.push_str("| --- | --- | --- | --- |\n");
    for goal in goals {
        table.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            goal.name, goal.description, goal.completed, goal.persistence
        ));
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_create_twice_reports_conflict() {
        let mut store = MemoryStore::new();
        let mut book = GoalBook::new(&mut store, StorylineId::new("s"));

        assert_eq!(
            book.create("Escape", "Leave the cell", Persistence::Medium).unwrap(),
            GoalOutcome::Created {
                name: "Escape".to_string()
            }
        );
        assert_eq!(
            book.create("Escape", "Something else", Persistence::High).unwrap(),
            GoalOutcome::AlreadyExists {
                name: "Escape".to_string()
            }
        );

        let goals = book.list().unwrap();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].description, "Leave the cell");
    }

    #[test]
    fn test_complete_is_idempotent() {
        let mut store = MemoryStore::new();
        let mut book = GoalBook::new(&mut store, StorylineId::new("s"));
        book.create("g", "d", Persistence::Low).unwrap();

        assert!(matches!(book.complete("g").unwrap(), GoalOutcome::Completed { .. }));
        assert!(matches!(
            book.complete("g").unwrap(),
            GoalOutcome::AlreadyCompleted { .. }
        ));
        assert!(matches!(book.complete("x").unwrap(), GoalOutcome::NotFound { .. }));
    }

    #[test]
    fn test_creation_payload_forms() {
        let mut store = MemoryStore::new();
        let mut book = GoalBook::new(&mut store, StorylineId::new("s"));

        let outcomes = book.apply_creations(&object(json!({
            "Plain": "A plain goal",
            "Rich": {"description": "A rich goal", "persistence": "forever"},
            "": "no name",
            "Blank": "  ",
            "Odd": 3
        })));

        assert!(matches!(outcomes[0], GoalOutcome::Created { .. }));
        assert!(matches!(outcomes[1], GoalOutcome::Created { .. }));
        assert!(outcomes[2..].iter().all(|o| matches!(o, GoalOutcome::Invalid { .. })));

        let goals = book.list().unwrap();
        let rich = goals.iter().find(|g| g.name == "Rich").unwrap();
        assert_eq!(rich.persistence, Persistence::Forever);
        let plain = goals.iter().find(|g| g.name == "Plain").unwrap();
        assert_eq!(plain.persistence, Persistence::Medium);
    }

    #[test]
    fn test_unknown_verdict_does_not_block_batch() {
        let mut store = MemoryStore::new();
        let mut book = GoalBook::new(&mut store, StorylineId::new("s"));
        book.create("a", "d", Persistence::Medium).unwrap();
        book.create("b", "d", Persistence::Medium).unwrap();

        let outcomes = book.apply_classifications(&object(json!({
            "a": "DONE",
            "b": "COMPLETE"
        })));

        assert!(matches!(outcomes[0], GoalOutcome::Invalid { .. }));
        assert!(matches!(outcomes[1], GoalOutcome::Completed { .. }));
    }

    #[test]
    fn test_update_reopens_and_renames() {
        let mut store = MemoryStore::new();
        let storyline = StorylineId::new("s");
        let mut book = GoalBook::new(&mut store, storyline.clone());
        book.create("a", "d", Persistence::Medium).unwrap();
        book.create("b", "d", Persistence::Medium).unwrap();
        book.complete("a").unwrap();

        let renamed = Goal::new(storyline.clone(), "c", "new").with_persistence(Persistence::High);
        assert!(matches!(
            book.update("a", renamed).unwrap(),
            GoalOutcome::Updated { .. }
        ));
        let clash = Goal::new(storyline, "b", "clash");
        assert!(matches!(
            book.update("c", clash).unwrap(),
            GoalOutcome::AlreadyExists { .. }
        ));

        let names: Vec<String> = book.active(false).unwrap().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_uncheck_all_and_active_filter() {
        let mut store = MemoryStore::new();
        let mut book = GoalBook::new(&mut store, StorylineId::new("s"));
        book.create("forever", "d", Persistence::Forever).unwrap();
        book.create("once", "d", Persistence::Low).unwrap();
        book.complete("once").unwrap();

        assert_eq!(book.active(true).unwrap().len(), 0);
        assert_eq!(book.uncheck_all().unwrap(), 1);
        assert_eq!(book.active(true).unwrap().len(), 1);
        assert_eq!(book.active(false).unwrap().len(), 2);
        assert!(book.delete("forever").unwrap());
        assert!(!book.delete("forever").unwrap());
    }

    #[test]
    fn test_goals_markdown_rows() {
        let goal = Goal::new(StorylineId::new("s"), "Escape", "Leave");
        let table = goals_markdown(&[goal]);
        assert!(table.contains("| Escape | Leave | false | Medium |"));
    }
}
