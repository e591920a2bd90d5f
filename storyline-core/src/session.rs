//! StorySession - the primary public API for running a storyline.
//!
//! A session owns a [`Store`] and an [`LlmAgent`] and drives one turn at a
//! time: the player's message is appended, the progression classifiers run
//! over the current exchange, and the character's reply is streamed and
//! appended. Everything is scoped to an explicit [`StorylineId`].

use crate::agent::{collect_text, AgentError, AgentMessage, LlmAgent};
use crate::config::StoryConfig;
use crate::events::{Reporter, SessionEvent, Stage};
use crate::memory::{CompactionError, Compactor, ConversationView, Summarizer, WindowConfig};
use crate::model::{Message, Role, Storyline, StorylineId};
use crate::progression::prompts;
use crate::progression::{GoalBook, Progression, ProgressionError, Sequencer, StepOutcome};
use crate::store::{IdRange, Store, StoreError};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, instrument};

/// Errors from session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    #[error("progression error: {0}")]
    Progression(#[from] ProgressionError),

    #[error("model error: {0}")]
    Agent(#[from] AgentError),

    #[error("message is empty")]
    EmptyMessage,

    #[error("message {id} not found in '{storyline}'")]
    MessageNotFound { storyline: StorylineId, id: u64 },

    #[error("message {id} is a {role} message; only assistant replies can be regenerated")]
    NotRegenerable { id: u64, role: &'static str },

    #[error("'{storyline}' has no player message awaiting a reply")]
    NothingToAnswer { storyline: StorylineId },

    #[error("'{storyline}' has no messages yet")]
    EmptyStoryline { storyline: StorylineId },

    #[error("message {id} in '{storyline}' is still awaiting a reply")]
    AwaitingReply { storyline: StorylineId, id: u64 },
}

impl SessionError {
    /// True when the same call may simply be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SessionError::Agent(_)
                | SessionError::Compaction(CompactionError::Agent(_))
                | SessionError::Progression(ProgressionError::Agent(_))
                | SessionError::Progression(ProgressionError::Parse(_))
        )
    }
}

/// What one turn did.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnReport {
    pub milestone: StepOutcome,
    pub goal_completion: StepOutcome,
    pub goal_creation: StepOutcome,
    /// The appended assistant message.
    pub reply: Message,
}

/// Counts removed by a truncation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Truncation {
    pub messages: usize,
    pub checkpoints: usize,
}

/// A storyline session.
pub struct StorySession<S: Store, A: LlmAgent> {
    store: S,
    agent: A,
    config: StoryConfig,
    reporter: Reporter,
}

impl<S: Store, A: LlmAgent> StorySession<S, A> {
    pub fn new(store: S, agent: A, config: StoryConfig) -> Self {
        Self {
            store,
            agent,
            config,
            reporter: Reporter::silent(),
        }
    }

    /// Publish [`SessionEvent`]s on `sender` while turns run.
    pub fn with_events(mut self, sender: UnboundedSender<SessionEvent>) -> Self {
        self.reporter = Reporter::new(sender);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    pub fn config(&self) -> &StoryConfig {
        &self.config
    }

    // Storylines

    pub fn storyline(&mut self, id: &StorylineId) -> Result<Option<Storyline>, SessionError> {
        Ok(self.store.transaction(|t| t.storyline(id))?)
    }

    pub fn save_storyline(&mut self, storyline: &Storyline) -> Result<(), SessionError> {
        self.store.transaction(|t| t.upsert_storyline(storyline))?;
        info!(storyline = %storyline.id, "storyline saved");
        Ok(())
    }

    /// Remove a storyline and everything recorded under it.
    pub fn delete_storyline(&mut self, id: &StorylineId) -> Result<bool, SessionError> {
        let deleted = self.store.transaction(|t| t.delete_storyline(id))?;
        if deleted {
            info!(storyline = %id, "storyline deleted");
        }
        Ok(deleted)
    }

    pub fn goals(&mut self, id: &StorylineId) -> GoalBook<'_, S> {
        GoalBook::new(&mut self.store, id.clone())
    }

    pub fn milestones(&mut self, id: &StorylineId) -> Sequencer<'_, S> {
        Sequencer::new(&mut self.store, id.clone())
    }

    // Message log

    /// The full log, ascending.
    pub fn history(&mut self, id: &StorylineId) -> Result<Vec<Message>, SessionError> {
        Ok(self.store.transaction(|t| t.messages(id, IdRange::all()))?)
    }

    pub fn append(
        &mut self,
        id: &StorylineId,
        role: Role,
        content: &str,
    ) -> Result<Message, SessionError> {
        Ok(self
            .store
            .transaction(|t| t.append_message(id, role, content))?)
    }

    /// Delete messages from `from_id` on, along with every checkpoint that
    /// covers any of them.
    pub fn truncate_from(
        &mut self,
        id: &StorylineId,
        from_id: u64,
    ) -> Result<Truncation, SessionError> {
        let truncation = self.store.transaction(|t| {
            Ok::<_, StoreError>(Truncation {
                messages: t.delete_messages_from(id, from_id)?,
                checkpoints: t.delete_checkpoints_from(id, from_id)?,
            })
        })?;
        info!(
            storyline = %id,
            from_id,
            messages = truncation.messages,
            checkpoints = truncation.checkpoints,
            "log truncated"
        );
        Ok(truncation)
    }

    /// Delete the message `message_id` and everything after it.
    pub fn delete_from(
        &mut self,
        id: &StorylineId,
        message_id: u64,
    ) -> Result<Truncation, SessionError> {
        self.message(id, message_id)?;
        self.truncate_from(id, message_id)
    }

    fn message(&mut self, id: &StorylineId, message_id: u64) -> Result<Message, SessionError> {
        let found = self.store.transaction(|t| {
            t.messages(id, IdRange::between(message_id.saturating_sub(1), message_id + 1))
        })?;
        found
            .into_iter()
            .next()
            .ok_or_else(|| SessionError::MessageNotFound {
                storyline: id.clone(),
                id: message_id,
            })
    }

    fn last_message(&mut self, id: &StorylineId) -> Result<Option<Message>, SessionError> {
        Ok(self
            .store
            .transaction(|t| t.latest_messages(id, 1))?
            .pop())
    }

    /// The converged view the character sees.
    pub async fn view(&mut self, id: &StorylineId) -> Result<ConversationView, SessionError> {
        let window = self.config.conversation_window;
        self.converge(id, window).await
    }

    async fn converge(
        &mut self,
        id: &StorylineId,
        window: WindowConfig,
    ) -> Result<ConversationView, SessionError> {
        let summarizer = Summarizer::new(&self.agent, Compactor::new(window))
            .with_max_attempts(self.config.max_summary_attempts);
        Ok(summarizer
            .converge(&mut self.store, id, &self.reporter)
            .await?)
    }

    // Turns

    /// Append the player's message and run a full turn.
    #[instrument(skip(self, text), fields(storyline = %id))]
    pub async fn send(&mut self, id: &StorylineId, text: &str) -> Result<TurnReport, SessionError> {
        if text.trim().is_empty() {
            return Err(SessionError::EmptyMessage);
        }
        if let Some(last) = self.last_message(id)? {
            if last.role == Role::User {
                return Err(SessionError::AwaitingReply {
                    storyline: id.clone(),
                    id: last.id,
                });
            }
        }
        let message = self.append(id, Role::User, text)?;
        info!(message_id = message.id, "player message appended");
        self.run_turn(id).await
    }

    /// Run a turn for a player message left unanswered by a failed turn.
    #[instrument(skip(self), fields(storyline = %id))]
    pub async fn resume(&mut self, id: &StorylineId) -> Result<TurnReport, SessionError> {
        match self.last_message(id)? {
            Some(last) if last.role == Role::User => self.run_turn(id).await,
            _ => Err(SessionError::NothingToAnswer {
                storyline: id.clone(),
            }),
        }
    }

    /// Discard the assistant reply `message_id` and everything after it,
    /// then answer the preceding player message again.
    #[instrument(skip(self), fields(storyline = %id))]
    pub async fn regenerate(
        &mut self,
        id: &StorylineId,
        message_id: u64,
    ) -> Result<TurnReport, SessionError> {
        let message = self.message(id, message_id)?;
        if message.role != Role::Assistant {
            return Err(SessionError::NotRegenerable {
                id: message_id,
                role: message.role.as_str(),
            });
        }
        self.truncate_from(id, message_id)?;
        self.resume(id).await
    }

    /// Stream a keyword prompt for an image of the latest message.
    ///
    /// The prompt is returned, not stored.
    #[instrument(skip(self), fields(storyline = %id))]
    pub async fn image_prompt(&mut self, id: &StorylineId) -> Result<String, SessionError> {
        let view = self.view(id).await?;
        let last = view
            .tail
            .last()
            .ok_or_else(|| SessionError::EmptyStoryline {
                storyline: id.clone(),
            })?;
        let request = prompts::image_prompt(view.summary(), last);

        self.reporter.emit(SessionEvent::StageStarted(Stage::ImagePrompt));
        let stream = self
            .agent
            .run(prompts::IMAGE_INSTRUCTIONS, &[AgentMessage::user(request)])
            .await?;
        let text = collect_text(stream, Stage::ImagePrompt, &self.reporter).await?;
        info!(storyline = %id, message_id = last.id, "image prompt generated");
        Ok(text.trim().to_string())
    }

    async fn run_turn(&mut self, id: &StorylineId) -> Result<TurnReport, SessionError> {
        let record = self.storyline(id)?;

        let window = self.config.progression_window;
        let view = self.converge(id, window).await?;
        let progression = Progression::new(&self.agent, &self.reporter)
            .with_goal_creation_ceiling(self.config.goal_creation_ceiling);
        let milestone = progression
            .classify_milestone(&mut self.store, record.as_ref(), &view)
            .await?;
        let goal_completion = progression.classify_goals(&mut self.store, &view).await?;
        let goal_creation = progression.create_goals(&mut self.store, &view).await?;

        let reply = self.respond(id, record.as_ref()).await?;
        Ok(TurnReport {
            milestone,
            goal_completion,
            goal_creation,
            reply,
        })
    }

    /// Stream the character's reply to the current view and append it.
    async fn respond(
        &mut self,
        id: &StorylineId,
        record: Option<&Storyline>,
    ) -> Result<Message, SessionError> {
        let view = self.view(id).await?;
        let character_name = record.map_or_else(
            || self.config.character_name.clone(),
            |r| r.character_name.clone(),
        );
        let goals = self.goals(id).active(false)?;
        let progress = self.milestones(id).progress()?;

        let mut messages = Vec::with_capacity(view.tail.len() + 2);
        if let Some(summary) = view.summary() {
            messages.push(AgentMessage::system(prompts::summary_preface(summary)));
        }
        if let Some((last, earlier)) = view.tail.split_last() {
            messages.extend(earlier.iter().map(|m| AgentMessage::new(m.role, &m.content)));
            messages.push(AgentMessage::system(prompts::character_guidance(
                &character_name,
                &goals,
                &progress,
            )));
            messages.push(AgentMessage::new(last.role, &last.content));
        }

        let instructions = prompts::character_instructions(record, &character_name);
        self.reporter.emit(SessionEvent::StageStarted(Stage::Character));
        let stream = self.agent.run(&instructions, &messages).await?;
        let text = collect_text(stream, Stage::Character, &self.reporter).await?;

        let reply = self.append(id, Role::Assistant, &text)?;
        info!(storyline = %id, message_id = reply.id, "character replied");
        Ok(reply)
    }
}
