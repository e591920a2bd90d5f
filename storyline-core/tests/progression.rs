//! Directive extraction, the goal and milestone stores, and the classifier
//! steps driven by a scripted model.

use serde_json::json;
use storyline_core::events::{Reporter, SessionEvent, Stage};
use storyline_core::memory::{Compactor, ConversationView, WindowConfig};
use storyline_core::model::{Goal, Milestone, Persistence, Role, StorylineId, SummaryCheckpoint};
use storyline_core::progression::extract::{extract, Payload, PayloadKind};
use storyline_core::progression::prompts::{
    GOAL_CLASSIFICATIONS_MARKER, MILESTONE_CLASSIFICATION_MARKER, NEW_GOALS_MARKER,
};
use storyline_core::progression::{
    Classification, GoalBook, GoalOutcome, MilestoneOutcome, ParseError, Progress, Progression,
    ProgressionError, Sequencer, SkipReason, StepOutcome,
};
use storyline_core::store::{MemoryStore, Store, StoreError};
use storyline_core::testing::{ScriptedAgent, ScriptedResponse};
use tokio::sync::mpsc;

fn storyline() -> StorylineId {
    StorylineId::new("lighthouse")
}

// Extraction

#[test]
fn test_extract_object_after_marker() {
    let payload = extract(
        "blah GOAL CLASSIFICATIONS: {\"a\":\"COMPLETE\"}",
        GOAL_CLASSIFICATIONS_MARKER,
        PayloadKind::JsonObject,
    )
    .unwrap();
    let Payload::Object(map) = payload else {
        panic!("expected an object");
    };
    assert_eq!(serde_json::Value::Object(map), json!({"a": "COMPLETE"}));
}

#[test]
fn test_extract_missing_marker() {
    let err = extract("no marker here", "X:", PayloadKind::JsonObject).unwrap_err();
    assert_eq!(
        err,
        ParseError::MarkerNotFound {
            marker: "X:".to_string()
        }
    );
}

#[test]
fn test_extract_trims_trailing_commentary() {
    let payload = extract(
        "thinking... NEW GOALS: {\"a\":1} trailing junk",
        NEW_GOALS_MARKER,
        PayloadKind::JsonObject,
    )
    .unwrap();
    let Payload::Object(map) = payload else {
        panic!("expected an object");
    };
    assert_eq!(map.get("a"), Some(&json!(1)));
}

#[test]
fn test_extract_uses_last_marker() {
    // The reasoning quotes the marker before the real answer.
    let text = "I should end with MILESTONE CLASSIFICATION: COMPLETE or INCOMPLETE.\n\
                Not there yet.\nMILESTONE CLASSIFICATION: INCOMPLETE\n";
    let payload = extract(text, MILESTONE_CLASSIFICATION_MARKER, PayloadKind::Classification).unwrap();
    assert_eq!(payload, Payload::Classification(Classification::Incomplete));
}

#[test]
fn test_extract_classification_is_exact() {
    let err = extract(
        "MILESTONE CLASSIFICATION: complete",
        MILESTONE_CLASSIFICATION_MARKER,
        PayloadKind::Classification,
    )
    .unwrap_err();
    assert!(matches!(err, ParseError::UnknownEnumValue { value, .. } if value == "complete"));
}

#[test]
fn test_extract_malformed_json() {
    let err = extract(
        "NEW GOALS: {\"a\": }",
        NEW_GOALS_MARKER,
        PayloadKind::JsonObject,
    )
    .unwrap_err();
    assert!(matches!(err, ParseError::MalformedPayload { .. }));
}

// Goal store

#[test]
fn test_goal_batch_mixed_verdicts() {
    let mut store = MemoryStore::new();
    let mut book = GoalBook::new(&mut store, storyline());
    book.create("g1", "Find the key", Persistence::Medium).unwrap();
    book.create("g2", "Light the lamp", Persistence::Medium).unwrap();

    let payload = json!({"g1": "COMPLETE", "g2": "INCOMPLETE", "g3": "COMPLETE"});
    let outcomes = book.apply_classifications(payload.as_object().unwrap());

    assert_eq!(
        outcomes,
        vec![
            GoalOutcome::Completed { name: "g1".into() },
            GoalOutcome::Skipped { name: "g2".into() },
            GoalOutcome::NotFound { name: "g3".into() },
        ]
    );
    assert!(outcomes[2].is_warning());

    let goals = book.list().unwrap();
    assert_eq!(goals.len(), 2);
    assert_eq!(goals[0].name, "g2");
    assert!(!goals[0].completed);
    assert_eq!(goals[1].name, "g1");
    assert!(goals[1].completed);
}

#[test]
fn test_goal_batch_reports_bad_verdict_and_continues() {
    let mut store = MemoryStore::new();
    let mut book = GoalBook::new(&mut store, storyline());
    book.create("g1", "Find the key", Persistence::Medium).unwrap();
    book.create("g2", "Light the lamp", Persistence::Medium).unwrap();

    let payload = json!({"g1": "MAYBE", "g2": "COMPLETE"});
    let outcomes = book.apply_classifications(payload.as_object().unwrap());

    assert!(matches!(&outcomes[0], GoalOutcome::Invalid { name, .. } if name == "g1"));
    assert_eq!(outcomes[1], GoalOutcome::Completed { name: "g2".into() });
}

#[test]
fn test_completed_goal_stays_completed() {
    let mut store = MemoryStore::new();
    let mut book = GoalBook::new(&mut store, storyline());
    book.create("g1", "Find the key", Persistence::Low).unwrap();

    assert_eq!(book.complete("g1").unwrap(), GoalOutcome::Completed { name: "g1".into() });
    assert_eq!(
        book.complete("g1").unwrap(),
        GoalOutcome::AlreadyCompleted { name: "g1".into() }
    );
    assert_eq!(
        book.create("g1", "Again", Persistence::Low).unwrap(),
        GoalOutcome::AlreadyExists { name: "g1".into() }
    );

    // Only the editor can reopen it.
    let reopened = Goal::new(storyline(), "g1", "Find the key");
    assert_eq!(
        book.update("g1", reopened).unwrap(),
        GoalOutcome::Updated { name: "g1".into() }
    );
    assert_eq!(book.active(false).unwrap().len(), 1);
}

#[test]
fn test_goal_creations_accept_both_shapes() {
    let mut store = MemoryStore::new();
    let mut book = GoalBook::new(&mut store, storyline());

    let payload = json!({
        "Find the keeper": "Ask around the harbour",
        "Stay alive": {"description": "Avoid the cliffs", "persistence": "Forever"},
        "": "nameless",
        "Odd": 42,
    });
    let outcomes = book.apply_creations(payload.as_object().unwrap());

    assert_eq!(outcomes[0], GoalOutcome::Created { name: "Find the keeper".into() });
    assert_eq!(outcomes[1], GoalOutcome::Created { name: "Stay alive".into() });
    assert!(matches!(outcomes[2], GoalOutcome::Invalid { .. }));
    assert!(matches!(outcomes[3], GoalOutcome::Invalid { .. }));

    let classifiable = book.active(true).unwrap();
    assert_eq!(classifiable.len(), 1);
    assert_eq!(classifiable[0].name, "Find the keeper");
    assert_eq!(book.active(false).unwrap().len(), 2);
}

// Milestone sequencer

#[test]
fn test_milestones_advance_to_open_ended() {
    let mut store = MemoryStore::new();
    let mut sequencer = Sequencer::new(&mut store, storyline());
    sequencer.upsert(Milestone::new(storyline(), 2, "B", "Second")).unwrap();
    sequencer.upsert(Milestone::new(storyline(), 1, "A", "First")).unwrap();

    assert_eq!(sequencer.active().unwrap().unwrap().name, "A");

    assert_eq!(
        sequencer.complete("A").unwrap(),
        MilestoneOutcome::Completed { name: "A".into() }
    );
    assert_eq!(sequencer.active().unwrap().unwrap().name, "B");

    sequencer.complete("B").unwrap();
    assert_eq!(sequencer.progress().unwrap(), Progress::OpenEnded { total: 2 });
    assert_eq!(
        sequencer.complete("B").unwrap(),
        MilestoneOutcome::AlreadyCompleted { name: "B".into() }
    );
    assert_eq!(
        sequencer.complete("C").unwrap(),
        MilestoneOutcome::NotFound { name: "C".into() }
    );
}

#[test]
fn test_milestone_import_is_all_or_nothing() {
    let mut store = MemoryStore::new();
    let mut sequencer = Sequencer::new(&mut store, storyline());
    sequencer.upsert(Milestone::new(storyline(), 5, "Storm", "")).unwrap();

    let err = sequencer
        .import_json(r#"[{"order": 1, "name": "Arrive"}, {"order": 2, "name": "Storm"}]"#)
        .unwrap_err();
    assert!(err.to_string().contains("Storm"));
    assert_eq!(sequencer.list().unwrap().len(), 1);

    let count = sequencer
        .import_json(r#"[{"order": 1, "name": "Arrive", "description": "Reach the island"}]"#)
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(sequencer.active().unwrap().unwrap().name, "Arrive");
}

// Classifier steps

/// A store holding `[user, assistant, user]` and a summary of the first
/// message, with the converged progression view over it.
fn exchange_store() -> (MemoryStore, ConversationView) {
    let mut store = MemoryStore::new();
    let id = storyline();
    let view = store
        .transaction(|t| -> Result<ConversationView, StoreError> {
            t.append_message(&id, Role::User, "We row towards the lighthouse.")?;
            t.append_message(&id, Role::Assistant, "The door is already open.")?;
            t.append_message(&id, Role::User, "I climb the stairs and light the lamp.")?;
            t.insert_checkpoint(&SummaryCheckpoint {
                storyline: id.clone(),
                until_id: 1,
                content: "The player set out for the lighthouse.".to_string(),
            })?;
            Ok(Compactor::new(WindowConfig::progression())
                .view(t, &id)
                .map_err(|e| StoreError::Corrupt(e.to_string()))?)
        })
        .unwrap();
    assert!(view.is_current());
    (store, view)
}

#[tokio::test]
async fn test_goal_classifier_completes_goals() {
    let (mut store, view) = exchange_store();
    GoalBook::new(&mut store, storyline())
        .create("Light the lamp", "Get the light working", Persistence::High)
        .unwrap();
    GoalBook::new(&mut store, storyline())
        .create("Stay calm", "Never panic", Persistence::Forever)
        .unwrap();

    let agent = ScriptedAgent::new([ScriptedResponse::text(
        "The player lit the lamp.\nGOAL CLASSIFICATIONS: {\"Light the lamp\": \"COMPLETE\"}",
    )]);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let reporter = Reporter::new(tx);
    let outcome = Progression::new(&agent, &reporter)
        .classify_goals(&mut store, &view)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        StepOutcome::Goals(vec![GoalOutcome::Completed {
            name: "Light the lamp".into()
        }])
    );

    // Forever goals are not offered for classification.
    let prompt = agent.calls()[0].prompt();
    assert!(prompt.contains("Light the lamp"));
    assert!(!prompt.contains("Stay calm"));
    assert!(prompt.contains("The player set out for the lighthouse."));
    assert!(prompt.contains("User: I climb the stairs and light the lamp."));

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(events.first(), Some(&SessionEvent::StageStarted(Stage::GoalCompletion)));
    assert!(events.contains(&SessionEvent::Goal(GoalOutcome::Completed {
        name: "Light the lamp".into()
    })));
}

#[tokio::test]
async fn test_goal_classifier_skips_without_goals() {
    let (mut store, view) = exchange_store();
    let agent = ScriptedAgent::default();
    let reporter = Reporter::silent();

    let outcome = Progression::new(&agent, &reporter)
        .classify_goals(&mut store, &view)
        .await
        .unwrap();
    assert_eq!(outcome, StepOutcome::Skipped(SkipReason::NoActiveGoals));
    assert_eq!(agent.call_count(), 0);
}

#[tokio::test]
async fn test_parse_failure_leaves_goals_untouched() {
    let (mut store, view) = exchange_store();
    GoalBook::new(&mut store, storyline())
        .create("Light the lamp", "Get the light working", Persistence::High)
        .unwrap();

    let agent = ScriptedAgent::new([ScriptedResponse::text("I am not sure what happened.")]);
    let reporter = Reporter::silent();
    let err = Progression::new(&agent, &reporter)
        .classify_goals(&mut store, &view)
        .await
        .unwrap_err();

    assert!(matches!(err, ProgressionError::Parse(ParseError::MarkerNotFound { .. })));
    assert_eq!(GoalBook::new(&mut store, storyline()).active(false).unwrap().len(), 1);
}

#[tokio::test]
async fn test_goal_creation_respects_ceiling() {
    let (mut store, view) = exchange_store();
    for i in 0..3 {
        GoalBook::new(&mut store, storyline())
            .create(&format!("goal {i}"), "something", Persistence::Low)
            .unwrap();
    }

    let agent = ScriptedAgent::default();
    let reporter = Reporter::silent();
    let outcome = Progression::new(&agent, &reporter)
        .with_goal_creation_ceiling(2)
        .create_goals(&mut store, &view)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Skipped(SkipReason::TooManyActiveGoals { count: 3, limit: 2 })
    );

    let agent = ScriptedAgent::new([ScriptedResponse::text(
        "NEW GOALS: {\"Reach the top\": \"Climb every stair\"} hope that helps",
    )]);
    let outcome = Progression::new(&agent, &reporter)
        .create_goals(&mut store, &view)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Goals(vec![GoalOutcome::Created {
            name: "Reach the top".into()
        }])
    );
}

#[tokio::test]
async fn test_milestone_classifier_advances_storyline() {
    let (mut store, view) = exchange_store();
    Sequencer::new(&mut store, storyline())
        .import_json(
            r#"[{"order": 1, "name": "Light", "description": "The lamp is lit"},
                {"order": 2, "name": "Signal", "description": "A ship answers"}]"#,
        )
        .unwrap();

    let agent = ScriptedAgent::new([ScriptedResponse::text(
        "The lamp burns.\nMILESTONE CLASSIFICATION: COMPLETE\n",
    )]);
    let reporter = Reporter::silent();
    let outcome = Progression::new(&agent, &reporter)
        .classify_milestone(&mut store, None, &view)
        .await
        .unwrap();

    assert_eq!(
        outcome,
        StepOutcome::Milestone(MilestoneOutcome::Completed {
            name: "Light".into()
        })
    );
    assert!(agent.calls()[0].prompt().contains("Milestone#1: Light"));
    assert_eq!(
        Sequencer::new(&mut store, storyline()).active().unwrap().unwrap().name,
        "Signal"
    );
}

#[tokio::test]
async fn test_milestone_classifier_skips_unscripted() {
    let (mut store, view) = exchange_store();
    let agent = ScriptedAgent::default();
    let reporter = Reporter::silent();

    let outcome = Progression::new(&agent, &reporter)
        .classify_milestone(&mut store, None, &view)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        StepOutcome::Skipped(SkipReason::NoActiveMilestone(Progress::Unscripted))
    );
}
