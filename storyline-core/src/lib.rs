//! Long-running role-play storylines on top of a language model.
//!
//! This crate provides:
//! - A per-storyline message log with summary checkpoints that keep the
//!   model's context bounded
//! - Extraction of structured directives from free-form model output
//! - Goal and milestone progression driven by classifier prompts
//! - SQLite and in-memory persistence
//!
//! # Quick Start
//!
//! ```ignore
//! use storyline_core::{ClaudeAgent, SqliteStore, StoryConfig, StorySession, StorylineId};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StoryConfig::from_env()?;
//!     let store = SqliteStore::open("story.db")?;
//!     let agent = ClaudeAgent::from_env()?;
//!     let mut session = StorySession::new(store, agent, config);
//!
//!     let tavern = StorylineId::new("tavern");
//!     let report = session.send(&tavern, "I push open the door.").await?;
//!     println!("{}", report.reply.content);
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod events;
pub mod memory;
pub mod model;
pub mod progression;
pub mod session;
pub mod store;
pub mod testing;

// Primary public API
pub use agent::{AgentError, AgentMessage, ClaudeAgent, LlmAgent};
pub use config::{ConfigError, StoryConfig};
pub use events::{SessionEvent, Stage};
pub use memory::{CompactionError, ConversationView, WindowConfig};
pub use model::{Goal, Message, Milestone, Persistence, Role, Storyline, StorylineId};
pub use progression::{GoalOutcome, MilestoneOutcome, Progress, StepOutcome};
pub use session::{SessionError, StorySession, TurnReport, Truncation};
pub use store::{MemoryStore, SqliteStore, Store, StoreError};
pub use testing::{ScriptedAgent, ScriptedResponse};
