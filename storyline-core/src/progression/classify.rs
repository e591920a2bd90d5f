//! The three classifier steps run after each player turn.
//!
//! Every step follows the same shape: check whether there is anything to
//! classify, build the prompt, stream the model's answer to completion,
//! extract the directive and only then touch the store. A provider or parse
//! failure therefore never leaves a partial update behind.

use super::extract::{extract_classification, extract_object};
use super::prompts::{
    self, GOAL_CLASSIFICATIONS_MARKER, MILESTONE_CLASSIFICATION_MARKER, NEW_GOALS_MARKER,
};
use super::{
    current_exchange, CurrentExchange, GoalBook, ProgressionError, Sequencer, SkipReason,
    StepOutcome,
};
use crate::agent::{collect_text, AgentMessage, LlmAgent};
use crate::events::{Reporter, SessionEvent, Stage};
use crate::memory::ConversationView;
use crate::model::{Storyline, StorylineId};
use crate::store::{GoalFilter, Store};
use tracing::{debug, info, instrument};

/// Runs the classifier steps against one agent.
pub struct Progression<'a, A: LlmAgent + ?Sized> {
    agent: &'a A,
    reporter: &'a Reporter,
    goal_creation_ceiling: usize,
}

impl<'a, A: LlmAgent + ?Sized> Progression<'a, A> {
    pub fn new(agent: &'a A, reporter: &'a Reporter) -> Self {
        Self {
            agent,
            reporter,
            goal_creation_ceiling: 5,
        }
    }

    /// Skip goal creation when more than `ceiling` goals are incomplete.
    pub fn with_goal_creation_ceiling(mut self, ceiling: usize) -> Self {
        self.goal_creation_ceiling = ceiling;
        self
    }

    fn skip(&self, stage: Stage, reason: SkipReason) -> StepOutcome {
        info!(stage = stage.label(), ?reason, "classifier skipped");
        self.reporter.emit(SessionEvent::Skipped {
            stage,
            reason: reason.clone(),
        });
        StepOutcome::Skipped(reason)
    }

    async fn ask(
        &self,
        stage: Stage,
        instructions: &str,
        prompt: String,
    ) -> Result<String, ProgressionError> {
        self.reporter.emit(SessionEvent::StageStarted(stage));
        let stream = self
            .agent
            .run(instructions, &[AgentMessage::user(prompt)])
            .await?;
        let text = collect_text(stream, stage, self.reporter).await?;
        debug!(stage = stage.label(), response = %text, "classifier response");
        Ok(text)
    }

    /// The exchange to classify, or `None` when the assistant has not spoken.
    fn exchange<'v>(
        view: &'v ConversationView,
    ) -> Result<Option<CurrentExchange<'v>>, ProgressionError> {
        let exchange = current_exchange(view)?;
        Ok(exchange.assistant.is_some().then_some(exchange))
    }

    /// Decide whether the active milestone has been reached.
    #[instrument(skip_all, fields(storyline = %view.storyline))]
    pub async fn classify_milestone<S: Store>(
        &self,
        store: &mut S,
        record: Option<&Storyline>,
        view: &ConversationView,
    ) -> Result<StepOutcome, ProgressionError> {
        let stage = Stage::MilestoneCompletion;
        let progress = Sequencer::new(store, view.storyline.clone()).progress()?;
        let Some(active) = progress.active().cloned() else {
            return Ok(self.skip(stage, SkipReason::NoActiveMilestone(progress)));
        };
        let Some(exchange) = Self::exchange(view)? else {
            return Ok(self.skip(stage, SkipReason::NothingToClassify));
        };

        let prompt = prompts::milestone_prompt(record, view.summary(), &exchange, &progress);
        let text = self
            .ask(stage, prompts::MILESTONE_INSTRUCTIONS, prompt)
            .await?;
        let verdict = extract_classification(&text, MILESTONE_CLASSIFICATION_MARKER)?;

        let outcome = Sequencer::new(store, view.storyline.clone())
            .apply_classification(&active.name, verdict)?;
        self.reporter.emit(SessionEvent::Milestone(outcome.clone()));
        Ok(StepOutcome::Milestone(outcome))
    }

    /// Mark goals the latest exchange completed.
    #[instrument(skip_all, fields(storyline = %view.storyline))]
    pub async fn classify_goals<S: Store>(
        &self,
        store: &mut S,
        view: &ConversationView,
    ) -> Result<StepOutcome, ProgressionError> {
        let stage = Stage::GoalCompletion;
        // Forever goals are never classified.
        let goals = GoalBook::new(store, view.storyline.clone()).active(true)?;
        if goals.is_empty() {
            return Ok(self.skip(stage, SkipReason::NoActiveGoals));
        }
        let Some(exchange) = Self::exchange(view)? else {
            return Ok(self.skip(stage, SkipReason::NothingToClassify));
        };

        let prompt = prompts::goal_completion_prompt(view.summary(), &exchange, &goals);
        let text = self.ask(stage, prompts::GOAL_INSTRUCTIONS, prompt).await?;
        let payload = extract_object(&text, GOAL_CLASSIFICATIONS_MARKER)?;

        let outcomes = GoalBook::new(store, view.storyline.clone()).apply_classifications(&payload);
        for outcome in &outcomes {
            self.reporter.emit(SessionEvent::Goal(outcome.clone()));
        }
        Ok(StepOutcome::Goals(outcomes))
    }

    /// Ask whether new goals are needed and create them.
    #[instrument(skip_all, fields(storyline = %view.storyline))]
    pub async fn create_goals<S: Store>(
        &self,
        store: &mut S,
        view: &ConversationView,
    ) -> Result<StepOutcome, ProgressionError> {
        let stage = Stage::GoalCreation;
        let incomplete = count_incomplete(store, &view.storyline)?;
        if incomplete > self.goal_creation_ceiling {
            return Ok(self.skip(
                stage,
                SkipReason::TooManyActiveGoals {
                    count: incomplete,
                    limit: self.goal_creation_ceiling,
                },
            ));
        }
        let Some(exchange) = Self::exchange(view)? else {
            return Ok(self.skip(stage, SkipReason::NothingToClassify));
        };

        let progress = Sequencer::new(store, view.storyline.clone()).progress()?;
        let goals = GoalBook::new(store, view.storyline.clone()).active(false)?;
        let prompt = prompts::goal_creation_prompt(view.summary(), &exchange, &progress, &goals);
        let text = self.ask(stage, prompts::GOAL_INSTRUCTIONS, prompt).await?;
        let payload = extract_object(&text, NEW_GOALS_MARKER)?;

        let outcomes = GoalBook::new(store, view.storyline.clone()).apply_creations(&payload);
        for outcome in &outcomes {
            self.reporter.emit(SessionEvent::Goal(outcome.clone()));
        }
        Ok(StepOutcome::Goals(outcomes))
    }
}

fn count_incomplete<S: Store>(
    store: &mut S,
    storyline: &StorylineId,
) -> Result<usize, ProgressionError> {
    let active = store.transaction(|t| t.goals(storyline, GoalFilter::active()))?;
    Ok(active.len())
}
