//! Prompt construction for the classifiers and the character.

use super::goals::goals_markdown;
use super::milestones::Progress;
use super::CurrentExchange;
use crate::model::{Goal, Message, Storyline};
use serde_json::{Map, Value};

pub const GOAL_CLASSIFICATIONS_MARKER: &str = "GOAL CLASSIFICATIONS:";
pub const NEW_GOALS_MARKER: &str = "NEW GOALS:";
pub const MILESTONE_CLASSIFICATION_MARKER: &str = "MILESTONE CLASSIFICATION:";

pub const GOAL_INSTRUCTIONS: &str = "You are an intelligent goal managing agent in a roleplaying game. \
You manage the goals of the main AI in the game. \
You will be provided with a summary of the conversation between the user and the AI character \
so far, followed by the most recent messages. \
You will then be asked to perform various tasks involving managing the goals.";

pub const MILESTONE_INSTRUCTIONS: &str = "You are an intelligent milestone managing agent in a roleplaying game. \
You manage the milestones of the main AI in the game. \
You will be provided with a summary of the conversation between the user and the AI character \
so far, followed by the most recent messages. \
You will then be asked to perform various tasks involving managing the milestones.";

pub const IMAGE_INSTRUCTIONS: &str = "You are a helpful assistant who is an expert in providing concise \
image generation prompts based on the provided information. \
The prompt must not contain full sentences or paragraphs, but rather a comma separated list of keywords. \
Larger, more complex prompts result in unwanted artefacts in the image, \
so use unambiguous keywords that clearly and vividly capture the scene. \
Keywords like artistic, vivid or beautiful can help. \
Keywords may describe the scene, physical traits and visual actions.";

const UNSCRIPTED: &str = "There is no explicit storyline, this game is in unscripted mode.";

/// The storyline text, or the unscripted notice when there is no record.
pub fn storyline_description(record: Option<&Storyline>) -> String {
    record
        .map(Storyline::rendered_description)
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| UNSCRIPTED.to_string())
}

fn summary_section(lead: &str, summary: Option<&str>) -> String {
    match summary {
        Some(summary) => format!("{lead}\n## Summary\n{summary}\n\n"),
        None => String::new(),
    }
}

fn recent_messages(exchange: &CurrentExchange<'_>) -> String {
    let ai = exchange.assistant.map_or("", |m| m.content.as_str());
    format!(
        "## Recent Messages\n---\nAI: {ai}\n---\nUser: {}\n---\n",
        exchange.user.content
    )
}

/// An illustrative classification of `goals`, used as a worked example.
fn goal_completion_example(goals: &[Goal]) -> String {
    let classifications: Map<String, Value> = goals
        .iter()
        .enumerate()
        .map(|(i, g)| {
            let verdict = if i % 2 == 0 { "INCOMPLETE" } else { "COMPLETE" };
            (g.name.clone(), Value::from(verdict))
        })
        .collect();
    format!(
        "## Internal Goal Completion Classification Reasoning\n...\n\n{GOAL_CLASSIFICATIONS_MARKER} {}\n",
        Value::Object(classifications)
    )
}

pub fn goal_completion_prompt(
    summary: Option<&str>,
    exchange: &CurrentExchange<'_>,
    goals: &[Goal],
) -> String {
    let mut prompt = summary_section(
        "Let me first give you a summary of the conversation so far:",
        summary,
    );
    prompt.push_str("Here are the most recent messages:\n");
    prompt.push_str(&recent_messages(exchange));
    prompt.push_str("\nFinally, here are the current goals of the AI character:\n");
    prompt.push_str("## Goals (alphabetical order)\n");
    prompt.push_str(&goals_markdown(goals));
    prompt.push('\n');
    prompt.push_str(include_str!("prompts/goal_completion.txt"));
    prompt.push_str("\nFor example:\n---\n");
    prompt.push_str(&goal_completion_example(goals));
    prompt
}

pub fn goal_creation_prompt(
    summary: Option<&str>,
    exchange: &CurrentExchange<'_>,
    progress: &Progress,
    goals: &[Goal],
) -> String {
    let mut prompt = String::from(
        "Can you help me decide if any new goals need to be created for the AI in the game? \
         And only if yes, what should they be?\n\n",
    );
    prompt.push_str(&summary_section(
        "Let me start by giving you a summary of the conversation so far:\n",
        summary,
    ));
    prompt.push_str("Here are the most recent messages:\n");
    prompt.push_str(&recent_messages(exchange));
    prompt.push_str("\nThe currently active milestone in the storyline is:\n");
    prompt.push_str(&progress.markdown());
    prompt.push_str("\nAnd here are the active goals of the AI character:\n");
    prompt.push_str(&goals_markdown(goals));
    prompt.push('\n');
    prompt.push_str(include_str!("prompts/goal_creation.txt"));
    prompt
}

pub fn milestone_prompt(
    record: Option<&Storyline>,
    summary: Option<&str>,
    exchange: &CurrentExchange<'_>,
    progress: &Progress,
) -> String {
    let mut prompt = String::from(
        "Can you help me classify the current milestone as either INCOMPLETE/COMPLETE \
         based on the conversation so far?\n\n",
    );
    prompt.push_str("Let me start by giving you some context about the overall storyline of the game:\n");
    prompt.push_str(&storyline_description(record));
    prompt.push_str("\n\n");
    prompt.push_str(&summary_section(
        "Next, let me give you a summary of the conversation so far:",
        summary,
    ));
    prompt.push_str("And here are the most recent messages:\n");
    prompt.push_str(&recent_messages(exchange));
    prompt.push_str("\nFinally, here is the current milestone of the AI character you need to classify:\n");
    prompt.push_str(&progress.markdown());
    prompt.push('\n');
    prompt.push_str(include_str!("prompts/milestone_classification.txt"));
    if let Some(milestone) = progress.active() {
        prompt.push_str("\nFor example:\n---\n");
        prompt.push_str(&include_str!("prompts/milestone_example.txt").replace("{milestone}", &milestone.name));
    }
    prompt
}

/// System instructions for the character.
pub fn character_instructions(record: Option<&Storyline>, character_name: &str) -> String {
    format!(
        "You are '{character_name}' a character in a roleplaying game.\n\
         In addition to playing the role of '{character_name}', you also cater to 'Meta requests'.\n\
         These requests are usually prefixed with 'Meta request:' and are used to manage the game's progression.\n\n\
         The storyline of the game is as follows:\n{}\n",
        storyline_description(record)
    )
}

/// The note placed just before the player's latest message.
pub fn character_guidance(character_name: &str, goals: &[Goal], progress: &Progress) -> String {
    let mut note = format!("{character_name}'s internal goals are:\n");
    note.push_str(&goals_markdown(goals));
    note.push_str(
        &include_str!("prompts/character_guidance.txt")
            .replace("{milestone}", &progress.character_prompt(character_name))
            .replace("{character}", character_name),
    );
    note
}

/// The note that opens the character's context when a summary exists.
pub fn summary_preface(summary: &str) -> String {
    format!("Let me first give you a summary of the conversation so far:\n{summary}")
}

/// Request for an image prompt illustrating `message`.
pub fn image_prompt(summary: Option<&str>, message: &Message) -> String {
    let mut prompt = summary_section(
        "Let me first give you a summary of the conversation so far.\n\
         It is only context and may not be relevant to the image prompt you need to generate.",
        summary,
    );
    prompt.push_str("The actual message for which you need to generate an image prompt is:\n");
    prompt.push_str(&message.content);
    prompt.push('\n');
    prompt.push_str(include_str!("prompts/image_request.txt"));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Milestone, Role, StorylineId};

    fn message(id: u64, role: Role, content: &str) -> Message {
        Message {
            storyline: StorylineId::new("s"),
            id,
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_storyline_description_fallback() {
        assert_eq!(storyline_description(None), UNSCRIPTED);
        let record = Storyline::new(StorylineId::new("s"), "{character_name} waits.")
            .with_character_name("Ari");
        assert_eq!(storyline_description(Some(&record)), "Ari waits.");
    }

    #[test]
    fn test_goal_completion_prompt_lists_goals_and_example() {
        let ai = message(1, Role::Assistant, "I hand over the key.");
        let user = message(2, Role::User, "Thanks!");
        let exchange = CurrentExchange {
            assistant: Some(&ai),
            user: &user,
        };
        let goals = vec![
            Goal::new(StorylineId::new("s"), "Give key", "Hand over the key"),
            Goal::new(StorylineId::new("s"), "Smile", "Be friendly"),
        ];

        let prompt = goal_completion_prompt(Some("They met."), &exchange, &goals);
        assert!(prompt.starts_with("Let me first give you a summary"));
        assert!(prompt.contains("AI: I hand over the key.\n---\nUser: Thanks!"));
        assert!(prompt.contains("| Give key | Hand over the key |"));
        assert!(prompt.contains(r#"GOAL CLASSIFICATIONS: {"Give key":"INCOMPLETE","Smile":"COMPLETE"}"#));
    }

    #[test]
    fn test_milestone_prompt_names_active_milestone() {
        let user = message(1, Role::User, "Hello");
        let exchange = CurrentExchange {
            assistant: None,
            user: &user,
        };
        let progress = Progress::of(&[Milestone::new(StorylineId::new("s"), 1, "Meet", "They meet")]);

        let prompt = milestone_prompt(None, None, &exchange, &progress);
        assert!(prompt.contains("## Milestone#1: Meet"));
        assert!(prompt.contains("Classify the milestone 'Meet'"));
        assert!(!prompt.contains("## Summary"));
    }

    #[test]
    fn test_character_guidance_substitutes_names() {
        let note = character_guidance("Mara", &[], &Progress::Unscripted);
        assert!(note.starts_with("Mara's internal goals are:"));
        assert!(note.contains("aren't visible to Mara"));
        assert!(note.contains("may now head in any direction"));
    }

    #[test]
    fn test_image_prompt_illustrates_last_message() {
        let reply = message(4, Role::Assistant, "Mara raises the lantern over the cliff.");
        let prompt = image_prompt(Some("They climbed the tower."), &reply);
        assert!(prompt.contains("## Summary\nThey climbed the tower."));
        assert!(prompt.contains("generate an image prompt is:\nMara raises the lantern over the cliff.\n"));
        assert!(prompt.trim_end().ends_with("visual representation."));

        let bare = image_prompt(None, &reply);
        assert!(bare.starts_with("The actual message"));
    }
}
