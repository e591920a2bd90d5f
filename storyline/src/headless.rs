//! Line-oriented protocol for playing a storyline.
//!
//! - Lines starting with `#` are commands (see `#help`)
//! - Anything else is sent as the player's message
//! - Output lines are tagged: `[CHARACTER]`, `[GOAL]`, `[MILESTONE]`, `[ERROR]`...

use std::future::Future;
use std::io::{self, BufRead, Write};
use storyline_core::progression::{goals_markdown, SkipReason};
use storyline_core::{
    ClaudeAgent, GoalOutcome, Milestone, MilestoneOutcome, Persistence, Role, SessionError, SessionEvent,
    Stage, Store, StorySession, Storyline, StorylineId,
};
use tokio::sync::mpsc::UnboundedReceiver;

const HELP: &str = "\
  #quit                          - Exit
  #history                       - Show the conversation
  #summary                       - Show the current summary
  #image                         - Suggest an image prompt for the latest message
  #retry                         - Answer the last player message again after a failure
  #regenerate [id]               - Replace an assistant reply (default: the last one)
  #delete <id>                   - Delete a message and everything after it
  #storyline                     - Show the storyline
  #storyline set <description>   - Describe the storyline ({character_name} is substituted)
  #storyline character <name>    - Name the character
  #goals                         - List goals
  #goal add <name> | <description> [| <persistence>]
  #goal done <name>              - Mark a goal completed
  #goal delete <name>            - Delete a goal
  #goal reopen                   - Mark every goal incomplete
  #milestones                    - List milestones
  #milestone import <path>       - Add milestones from a JSON file
  #milestone done <name>         - Mark a milestone completed
  #milestone rename <name> | <new name>
  #milestone delete <name>       - Delete a milestone
  #help                          - Show this help
  (anything else is sent as the player's message)";

/// Run the session on stdin/stdout until `#quit` or end of input.
pub async fn run_headless<S: Store>(
    mut session: StorySession<S, ClaudeAgent>,
    id: StorylineId,
    mut events: UnboundedReceiver<SessionEvent>,
) -> Result<(), SessionError> {
    println!("=== Storyline: {id} ===");
    match session.storyline(&id)? {
        Some(record) => println!("Character: {}", record.character_name),
        None => println!("Character: {} (unscripted)", session.config().character_name),
    }
    println!("Messages so far: {}", session.history(&id)?.len());
    println!();
    println!("Commands:");
    println!("{HELP}");
    println!();

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    for line in stdin.lock().lines() {
        let line = match line {
            Ok(l) => l,
            Err(e) => {
                eprintln!("Error reading input: {e}");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(command) = line.strip_prefix('#') {
            let (name, rest) = split_word(command);
            match name {
                "quit" | "exit" => {
                    println!("Goodbye!");
                    break;
                }
                "help" => {
                    println!("[HELP]");
                    println!("{HELP}");
                }
                "history" => show_history(&mut session, &id),
                "summary" => match drive(session.view(&id), &mut events).await {
                    Ok(view) => match view.summary() {
                        Some(summary) => println!("[SUMMARY]\n{summary}"),
                        None => println!("[SUMMARY] Nothing has been summarized yet."),
                    },
                    Err(e) => report_error(&e),
                },
                "image" => match drive(session.image_prompt(&id), &mut events).await {
                    Ok(prompt) => println!("[IMAGE PROMPT]\n{prompt}"),
                    Err(e) => report_error(&e),
                },
                "retry" => {
                    let result = drive(session.resume(&id), &mut events).await;
                    finish_turn(result);
                }
                "regenerate" => {
                    let target = match rest.parse::<u64>() {
                        Ok(message_id) => Some(message_id),
                        Err(_) if rest.is_empty() => last_reply(&mut session, &id),
                        Err(_) => {
                            println!("[ERROR] Usage: #regenerate [id]");
                            continue;
                        }
                    };
                    match target {
                        Some(message_id) => {
                            let result = drive(session.regenerate(&id, message_id), &mut events).await;
                            finish_turn(result);
                        }
                        None => println!("[ERROR] There is no reply to regenerate."),
                    }
                }
                "delete" => match rest.parse::<u64>() {
                    Ok(message_id) => match session.delete_from(&id, message_id) {
                        Ok(truncation) => println!(
                            "[DELETED] {} messages, {} summaries",
                            truncation.messages, truncation.checkpoints
                        ),
                        Err(e) => report_error(&e),
                    },
                    Err(_) => println!("[ERROR] Usage: #delete <id>"),
                },
                "storyline" => storyline_command(&mut session, &id, rest),
                "goals" => match session.goals(&id).list() {
                    Ok(goals) => print!("{}", goals_markdown(&goals)),
                    Err(e) => report_error(&e.into()),
                },
                "goal" => goal_command(&mut session, &id, rest),
                "milestones" => show_milestones(&mut session, &id),
                "milestone" => milestone_command(&mut session, &id, rest),
                _ => println!("[ERROR] Unknown command. Type #help for help."),
            }
            stdout.flush().ok();
            continue;
        }

        let result = drive(session.send(&id, line), &mut events).await;
        finish_turn(result);
    }

    Ok(())
}

/// Await `task`, printing session events as they arrive.
async fn drive<T, F>(task: F, events: &mut UnboundedReceiver<SessionEvent>) -> T
where
    F: Future<Output = T>,
{
    tokio::pin!(task);
    let mut printer = EventPrinter::default();
    let output = loop {
        tokio::select! {
            output = &mut task => break output,
            Some(event) = events.recv() => printer.print(event),
        }
    };
    while let Ok(event) = events.try_recv() {
        printer.print(event);
    }
    printer.finish();
    output
}

fn finish_turn(result: Result<storyline_core::TurnReport, SessionError>) {
    match result {
        Ok(report) => println!("[REPLY #{}]", report.reply.id),
        Err(e) => report_error(&e),
    }
    println!();
}

fn report_error(e: &SessionError) {
    println!("[ERROR] {e}");
    if e.is_transient() {
        println!("[HINT] Type #retry to try again.");
    }
}

#[derive(Default)]
struct EventPrinter {
    streaming: bool,
}

impl EventPrinter {
    fn print(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Fragment {
                stage: Stage::Character,
                text,
            } => {
                print!("{text}");
                io::stdout().flush().ok();
            }
            // Classifier reasoning is not shown.
            SessionEvent::Fragment { .. } => {}
            SessionEvent::StageStarted(Stage::Character) => {
                self.end_stream();
                println!("[CHARACTER]");
                self.streaming = true;
            }
            SessionEvent::StageStarted(stage) => {
                self.end_stream();
                println!("[WORKING] {}", stage.label());
            }
            SessionEvent::Skipped { stage, reason } => {
                self.end_stream();
                println!("[SKIPPED] {}: {}", stage.label(), describe_skip(&reason));
            }
            SessionEvent::CheckpointCommitted { until_id } => {
                self.end_stream();
                println!("[SUMMARY] Summarized up to message {until_id}");
            }
            SessionEvent::Goal(outcome) => {
                self.end_stream();
                println!("[GOAL] {}", describe_goal(&outcome));
            }
            SessionEvent::Milestone(outcome) => {
                self.end_stream();
                println!("[MILESTONE] {}", describe_milestone(&outcome));
            }
        }
    }

    fn end_stream(&mut self) {
        if self.streaming {
            println!();
            self.streaming = false;
        }
    }

    fn finish(&mut self) {
        self.end_stream();
    }
}

fn describe_skip(reason: &SkipReason) -> String {
    match reason {
        SkipReason::NoActiveGoals => "no active goals".to_string(),
        SkipReason::TooManyActiveGoals { count, limit } => {
            format!("{count} goals are active (limit {limit})")
        }
        SkipReason::NoActiveMilestone(progress) => progress.markdown(),
        SkipReason::NothingToClassify => "waiting for the first reply".to_string(),
    }
}

fn describe_goal(outcome: &GoalOutcome) -> String {
    match outcome {
        GoalOutcome::Created { name } => format!("New goal: {name}"),
        GoalOutcome::AlreadyExists { name } => format!("Goal already exists: {name}"),
        GoalOutcome::Completed { name } => format!("Completed: {name}"),
        GoalOutcome::AlreadyCompleted { name } => format!("Already completed: {name}"),
        GoalOutcome::Skipped { name } => format!("Still in progress: {name}"),
        GoalOutcome::NotFound { name } => format!("Goal not found: {name}"),
        GoalOutcome::Updated { name } => format!("Updated: {name}"),
        GoalOutcome::Invalid { name, reason } => format!("Ignored '{name}': {reason}"),
    }
}

fn describe_milestone(outcome: &MilestoneOutcome) -> String {
    match outcome {
        MilestoneOutcome::Completed { name } => format!("Reached: {name}"),
        MilestoneOutcome::StillIncomplete { name } => format!("Not yet reached: {name}"),
        MilestoneOutcome::AlreadyCompleted { name } => format!("Already reached: {name}"),
        MilestoneOutcome::NotFound { name } => format!("Milestone not found: {name}"),
        MilestoneOutcome::AlreadyExists { name } => format!("Milestone already exists: {name}"),
        MilestoneOutcome::Updated { name } => format!("Updated: {name}"),
        MilestoneOutcome::OpenEnded => "All milestones complete".to_string(),
    }
}

fn split_word(input: &str) -> (&str, &str) {
    let input = input.trim();
    match input.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (input, ""),
    }
}

fn last_reply<S: Store>(session: &mut StorySession<S, ClaudeAgent>, id: &StorylineId) -> Option<u64> {
    session
        .history(id)
        .ok()?
        .iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .map(|m| m.id)
}

fn show_history<S: Store>(session: &mut StorySession<S, ClaudeAgent>, id: &StorylineId) {
    match session.history(id) {
        Ok(messages) if messages.is_empty() => println!("[HISTORY] No messages yet."),
        Ok(messages) => {
            println!("[HISTORY]");
            for message in messages {
                println!("#{} {}: {}", message.id, message.role.as_str(), message.content);
            }
        }
        Err(e) => report_error(&e),
    }
}

fn storyline_command<S: Store>(
    session: &mut StorySession<S, ClaudeAgent>,
    id: &StorylineId,
    args: &str,
) {
    let current = match session.storyline(id) {
        Ok(current) => current,
        Err(e) => return report_error(&e),
    };
    let (action, value) = split_word(args);
    let updated = match (action, value) {
        ("", _) => {
            match current {
                Some(record) => {
                    println!("[STORYLINE] Character: {}", record.character_name);
                    println!("{}", record.rendered_description());
                }
                None => println!("[STORYLINE] No storyline set, playing unscripted."),
            }
            return;
        }
        (_, "") => {
            println!("[ERROR] Usage: #storyline set <description> | #storyline character <name>");
            return;
        }
        ("set", description) => {
            let record = current.unwrap_or_else(|| {
                Storyline::new(id.clone(), "")
                    .with_character_name(session.config().character_name.clone())
            });
            Storyline {
                description: description.to_string(),
                ..record
            }
        }
        ("character", name) => {
            let record = current.unwrap_or_else(|| Storyline::new(id.clone(), ""));
            record.with_character_name(name)
        }
        _ => {
            println!("[ERROR] Unknown storyline command. Type #help for help.");
            return;
        }
    };
    match session.save_storyline(&updated) {
        Ok(()) => println!("[STORYLINE] Saved."),
        Err(e) => report_error(&e),
    }
}

fn goal_command<S: Store>(session: &mut StorySession<S, ClaudeAgent>, id: &StorylineId, args: &str) {
    let (action, rest) = split_word(args);
    let mut goals = session.goals(id);
    let result = match action {
        "add" => {
            let parts: Vec<&str> = rest.split('|').map(str::trim).collect();
            let (name, description) = match parts.as_slice() {
                [name, description, ..] if !name.is_empty() && !description.is_empty() => {
                    (*name, *description)
                }
                _ => {
                    println!("[ERROR] Usage: #goal add <name> | <description> [| <persistence>]");
                    return;
                }
            };
            let persistence = match parts.get(2) {
                Some(p) => match p.parse::<Persistence>() {
                    Ok(p) => p,
                    Err(e) => {
                        println!("[ERROR] {e}");
                        return;
                    }
                },
                None => Persistence::default(),
            };
            goals
                .create(name, description, persistence)
                .map(|outcome| describe_goal(&outcome))
        }
        "done" if !rest.is_empty() => goals.complete(rest).map(|outcome| describe_goal(&outcome)),
        "delete" if !rest.is_empty() => goals.delete(rest).map(|deleted| {
            if deleted {
                format!("Deleted: {rest}")
            } else {
                format!("Goal not found: {rest}")
            }
        }),
        "reopen" => goals
            .uncheck_all()
            .map(|count| format!("Reopened {count} goals")),
        _ => {
            println!("[ERROR] Unknown goal command. Type #help for help.");
            return;
        }
    };
    match result {
        Ok(message) => println!("[GOAL] {message}"),
        Err(e) => report_error(&e.into()),
    }
}

fn show_milestones<S: Store>(session: &mut StorySession<S, ClaudeAgent>, id: &StorylineId) {
    let mut sequencer = session.milestones(id);
    let milestones = match sequencer.list() {
        Ok(milestones) => milestones,
        Err(e) => return report_error(&e.into()),
    };
    if milestones.is_empty() {
        println!("[MILESTONES] None defined, the story is unscripted.");
        return;
    }
    println!("[MILESTONES]");
    for milestone in &milestones {
        let mark = if milestone.completed { "x" } else { " " };
        println!(
            "  [{mark}] {}. {}: {}",
            milestone.order, milestone.name, milestone.description
        );
    }
    if let Ok(progress) = sequencer.progress() {
        print!("{}", progress.markdown());
        println!();
    }
}

fn milestone_command<S: Store>(
    session: &mut StorySession<S, ClaudeAgent>,
    id: &StorylineId,
    args: &str,
) {
    let (action, rest) = split_word(args);
    if rest.is_empty() {
        println!("[ERROR] Usage: #milestone import <path> | done <name> | rename <name> | <new name> | delete <name>");
        return;
    }
    let mut sequencer = session.milestones(id);
    let message = match action {
        "import" => {
            let json = match std::fs::read_to_string(rest) {
                Ok(json) => json,
                Err(e) => {
                    println!("[ERROR] Could not read {rest}: {e}");
                    return;
                }
            };
            match sequencer.import_json(&json) {
                Ok(count) => format!("Imported {count} milestones"),
                Err(e) => {
                    println!("[ERROR] {e}");
                    return;
                }
            }
        }
        "done" => match sequencer.complete(rest) {
            Ok(outcome) => describe_milestone(&outcome),
            Err(e) => return report_error(&e.into()),
        },
        "rename" => {
            let Some((name, new_name)) = rest.split_once('|') else {
                println!("[ERROR] Usage: #milestone rename <name> | <new name>");
                return;
            };
            let (name, new_name) = (name.trim(), new_name.trim());
            let existing = match sequencer.list() {
                Ok(milestones) => milestones.into_iter().find(|m| m.name == name),
                Err(e) => return report_error(&e.into()),
            };
            let Some(existing) = existing else {
                println!("[MILESTONE] Milestone not found: {name}");
                return;
            };
            let renamed = Milestone {
                name: new_name.to_string(),
                ..existing
            };
            match sequencer.update(name, renamed) {
                Ok(outcome) => describe_milestone(&outcome),
                Err(e) => return report_error(&e.into()),
            }
        }
        "delete" => match sequencer.delete(rest) {
            Ok(true) => format!("Deleted: {rest}"),
            Ok(false) => format!("Milestone not found: {rest}"),
            Err(e) => return report_error(&e.into()),
        },
        _ => {
            println!("[ERROR] Unknown milestone command. Type #help for help.");
            return;
        }
    };
    println!("[MILESTONE] {message}");
}
