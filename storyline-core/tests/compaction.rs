//! Window compaction and summary convergence over a real store.

use storyline_core::events::Reporter;
use storyline_core::memory::{CompactionError, Compactor, Summarizer, WindowConfig};
use storyline_core::model::{Role, StorylineId, SummaryCheckpoint};
use storyline_core::store::{MemoryStore, Store, StoreError, Tables};
use storyline_core::testing::{ScriptedAgent, ScriptedResponse};
use storyline_core::{StoryConfig, StorySession};

fn storyline() -> StorylineId {
    StorylineId::new("harbour")
}

fn append_n<S: Store>(store: &mut S, n: usize) {
    let id = storyline();
    store
        .transaction(|t| -> Result<(), StoreError> {
            for i in 0..n {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                t.append_message(&id, role, &format!("message {}", i + 1))?;
            }
            Ok(())
        })
        .unwrap();
}

fn summaries(count: usize) -> ScriptedAgent {
    ScriptedAgent::new((1..=count).map(|i| ScriptedResponse::text(format!("summary {i}"))))
}

#[test]
fn test_ten_messages_in_conversation_window() {
    let mut store = MemoryStore::new();
    append_n(&mut store, 10);

    let compactor = Compactor::new(WindowConfig::new(8, 2));
    let view = store
        .transaction(|t| compactor.view(t, &storyline()))
        .unwrap();

    assert_eq!(view.boundary_id, Some(9));
    assert_eq!(view.low_water_mark, 0);
    assert_eq!(
        view.pending.iter().map(|m| m.id).collect::<Vec<_>>(),
        (1..=8).collect::<Vec<_>>()
    );
    assert_eq!(view.tail.iter().map(|m| m.id).collect::<Vec<_>>(), vec![9, 10]);
    assert!(view.summary().is_none());
}

#[tokio::test]
async fn test_converged_view_accounts_for_every_message() {
    for (window_size, tail_size) in [(8, 2), (2, 2), (5, 3), (4, 1)] {
        for n in 0..=20 {
            let mut store = MemoryStore::new();
            append_n(&mut store, n);

            let agent = summaries(4);
            let summarizer = Summarizer::new(&agent, Compactor::new(WindowConfig::new(window_size, tail_size)));
            let view = summarizer
                .converge(&mut store, &storyline(), &Reporter::silent())
                .await
                .unwrap();

            let label = format!("window {window_size}/{tail_size}, {n} messages");
            assert!(view.is_current(), "{label}");
            assert!(agent.call_count() <= 1, "{label}");
            assert!(view.tail.len() <= window_size.max(tail_size), "{label}");

            // Every message is either summarized or in the tail.
            let covered = view.low_water_mark;
            let tail_ids: Vec<u64> = view.tail.iter().map(|m| m.id).collect();
            for id in 1..=n as u64 {
                assert!(id <= covered || tail_ids.contains(&id), "{label}: message {id} lost");
            }
            if let Some(first) = tail_ids.first() {
                assert_eq!(*first, covered + 1, "{label}");
                assert_eq!(*tail_ids.last().unwrap(), n as u64, "{label}");
            }
        }
    }
}

#[tokio::test]
async fn test_incremental_checkpoints_chain_summaries() {
    let mut store = MemoryStore::new();
    let id = storyline();
    let agent = summaries(20);
    let summarizer = Summarizer::new(&agent, Compactor::new(WindowConfig::new(4, 2)));

    for _ in 0..10 {
        append_n(&mut store, 1);
        summarizer
            .converge(&mut store, &id, &Reporter::silent())
            .await
            .unwrap();
    }

    let checkpoints = store.transaction(|t| t.checkpoints(&id)).unwrap();
    assert!(checkpoints.len() > 1);
    assert!(checkpoints.windows(2).all(|w| w[0].until_id < w[1].until_id));

    // Each later request carries the summary before it.
    let calls = agent.calls();
    assert!(!calls[0].prompt().contains("## Summary"));
    assert!(calls[1].prompt().contains("## Summary\nsummary 1"));
    assert!(calls.iter().all(|c| c.prompt().trim_end().ends_with("SUMMARY:")));
}

#[tokio::test]
async fn test_provider_failure_leaves_no_checkpoint() {
    for failure in [
        ScriptedResponse::provider_error("overloaded"),
        ScriptedResponse::FailMidStream(
            vec!["The party".to_string()],
            storyline_core::AgentError::Interrupted("connection reset".to_string()),
        ),
    ] {
        let mut store = MemoryStore::new();
        append_n(&mut store, 10);
        let agent = ScriptedAgent::new([failure]);
        let summarizer = Summarizer::new(&agent, Compactor::new(WindowConfig::conversation()));

        let err = summarizer
            .converge(&mut store, &storyline(), &Reporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, CompactionError::Agent(_)));
        assert!(store
            .transaction(|t| t.checkpoints(&storyline()))
            .unwrap()
            .is_empty());
    }
}

#[tokio::test]
async fn test_gives_up_after_max_attempts() {
    let mut store = MemoryStore::new();
    append_n(&mut store, 10);
    let agent = summaries(1);
    let summarizer =
        Summarizer::new(&agent, Compactor::new(WindowConfig::conversation())).with_max_attempts(0);

    let err = summarizer
        .converge(&mut store, &storyline(), &Reporter::silent())
        .await
        .unwrap_err();
    assert!(matches!(err, CompactionError::ConvergenceFailure { attempts: 0, .. }));
    assert_eq!(agent.call_count(), 0);
}

/// Writes a rival checkpoint just before the `nth` transaction runs.
struct RacingStore {
    inner: MemoryStore,
    transactions: usize,
    nth: usize,
    rival: SummaryCheckpoint,
}

impl Store for RacingStore {
    fn transaction<T, E>(
        &mut self,
        f: impl FnOnce(&mut dyn Tables) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        self.transactions += 1;
        if self.transactions == self.nth {
            let rival = self.rival.clone();
            self.inner
                .transaction(|t| t.insert_checkpoint(&rival))
                .map_err(E::from)?;
        }
        self.inner.transaction(f)
    }
}

#[tokio::test]
async fn test_race_is_retried_from_fresh_view() {
    let mut inner = MemoryStore::new();
    append_n(&mut inner, 10);
    let mut store = RacingStore {
        inner,
        transactions: 0,
        nth: 2,
        rival: SummaryCheckpoint {
            storyline: storyline(),
            until_id: 4,
            content: "rival summary".to_string(),
        },
    };

    let agent = summaries(2);
    let summarizer = Summarizer::new(&agent, Compactor::new(WindowConfig::conversation()));
    let view = summarizer
        .converge(&mut store, &storyline(), &Reporter::silent())
        .await
        .unwrap();

    assert_eq!(agent.call_count(), 2);
    assert_eq!(view.low_water_mark, 8);
    assert_eq!(view.summary(), Some("summary 2"));

    // The retry only summarized what the rival had not covered.
    let retry = agent.calls()[1].prompt();
    assert!(retry.contains("rival summary"));
    assert!(!retry.contains("message 4\n"));
    assert!(retry.contains("message 5\n"));

    let ids: Vec<u64> = store
        .inner
        .transaction(|t| t.checkpoints(&storyline()))
        .unwrap()
        .iter()
        .map(|c| c.until_id)
        .collect();
    assert_eq!(ids, vec![4, 8]);
}

fn session_with(agent: ScriptedAgent) -> StorySession<MemoryStore, ScriptedAgent> {
    StorySession::new(MemoryStore::new(), agent, StoryConfig::default())
}

#[tokio::test]
async fn test_truncation_below_checkpoint_reopens_window() {
    let id = storyline();
    let mut session = session_with(summaries(2));
    append_n(session.store_mut(), 10);

    let view = session.view(&id).await.unwrap();
    assert_eq!(view.summary(), Some("summary 1"));

    let truncation = session.truncate_from(&id, 6).unwrap();
    assert_eq!(truncation.messages, 5);
    assert_eq!(truncation.checkpoints, 1);

    let view = session.view(&id).await.unwrap();
    assert!(view.summary().is_none());
    assert_eq!(view.tail.len(), 5);
    assert_eq!(session.history(&id).unwrap().len(), 5);
    assert_eq!(session.agent().call_count(), 1);
}

#[tokio::test]
async fn test_repeated_view_without_writes_is_identical() {
    let id = storyline();
    let mut session = session_with(summaries(1));
    append_n(session.store_mut(), 12);

    let first = session.view(&id).await.unwrap();
    let second = session.view(&id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(session.agent().call_count(), 1);

    let compactor = Compactor::new(WindowConfig::conversation());
    let a = session
        .store_mut()
        .transaction(|t| compactor.view(t, &id))
        .unwrap();
    let b = session
        .store_mut()
        .transaction(|t| compactor.view(t, &id))
        .unwrap();
    assert_eq!(a, b);
    assert_eq!(a, first);
}

#[tokio::test]
async fn test_checkpoint_surviving_truncation_keeps_view_current() {
    let id = storyline();
    let mut script = vec![ScriptedResponse::text("reply 1")];
    for turn in 2..=6 {
        script.push(ScriptedResponse::text(format!("summary of turn {turn}")));
        script.push(ScriptedResponse::text("NEW GOALS: {}"));
        script.push(ScriptedResponse::text(format!("reply {turn}")));
    }
    let mut session = session_with(ScriptedAgent::new(script));
    for turn in 1..=6 {
        session.send(&id, &format!("player turn {turn}")).await.unwrap();
    }
    let until: Vec<u64> = session
        .store_mut()
        .transaction(|t| t.checkpoints(&id))
        .unwrap()
        .iter()
        .map(|c| c.until_id)
        .collect();
    assert_eq!(until, vec![1, 3, 5, 7, 9]);
    let calls = session.agent().call_count();

    // Dropping the last exchange moves the boundary onto checkpoint 9, which
    // still covers everything before it.
    let truncation = session.delete_from(&id, 11).unwrap();
    assert_eq!(truncation.messages, 2);
    assert_eq!(truncation.checkpoints, 0);

    let view = session.view(&id).await.unwrap();
    assert!(view.is_current());
    assert_eq!(view.boundary_id, Some(9));
    assert_eq!(view.summary(), Some("summary of turn 6"));
    assert_eq!(view.tail.iter().map(|m| m.id).collect::<Vec<_>>(), vec![9, 10]);
    assert_eq!(session.agent().call_count(), calls);

    // Replaying the turn needs no new summary.
    session.agent().push(ScriptedResponse::text("NEW GOALS: {}"));
    session.agent().push(ScriptedResponse::text("reply 7"));
    let report = session.send(&id, "player turn 7").await.unwrap();
    assert_eq!(report.reply.id, 14);
    assert_eq!(report.reply.content, "reply 7");
    assert_eq!(session.agent().call_count(), calls + 2);
    let character = session.agent().calls().pop().unwrap();
    assert!(character.messages[0].content.contains("summary of turn 6"));
}
