//! Records shared by the message log, the compactor and the progression stores.
//!
//! Every record carries the [`StorylineId`] of the partition it belongs to;
//! nothing in this crate reads an ambient "current storyline".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Identifier of a storyline partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StorylineId(String);

impl StorylineId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorylineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StorylineId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for StorylineId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A value stored as text could not be decoded.
#[derive(Debug, Clone, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            other => Err(UnknownVariant {
                kind: "role",
                value: other.to_string(),
            }),
        }
    }
}

/// One turn of the conversation.
///
/// `id` is the sole ordering key within a storyline and is never reused, even
/// after the log is truncated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub storyline: StorylineId,
    pub id: u64,
    pub role: Role,
    pub content: String,
}

/// A summary covering every message with `id <= until_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCheckpoint {
    pub storyline: StorylineId,
    pub until_id: u64,
    pub content: String,
}

/// How strongly the character should keep pursuing a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Persistence {
    Low,
    #[default]
    Medium,
    High,
    Forever,
}

impl Persistence {
    pub const ALL: [Persistence; 4] = [
        Persistence::Low,
        Persistence::Medium,
        Persistence::High,
        Persistence::Forever,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Persistence::Low => "Low",
            Persistence::Medium => "Medium",
            Persistence::High => "High",
            Persistence::Forever => "Forever",
        }
    }
}

impl fmt::Display for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Persistence {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Persistence::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownVariant {
                kind: "persistence",
                value: s.to_string(),
            })
    }
}

/// A named goal the character works towards over several turns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Goal {
    pub storyline: StorylineId,
    pub name: String,
    pub description: String,
    pub completed: bool,
    pub persistence: Persistence,
}

impl Goal {
    /// A new, active goal.
    pub fn new(
        storyline: StorylineId,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            storyline,
            name: name.into(),
            description: description.into(),
            completed: false,
            persistence: Persistence::default(),
        }
    }

    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = persistence;
        self
    }
}

/// A step of the scripted storyline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Milestone {
    pub storyline: StorylineId,
    pub name: String,
    pub order: i64,
    pub description: String,
    pub completed: bool,
}

impl Milestone {
    pub fn new(
        storyline: StorylineId,
        order: i64,
        name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            storyline,
            name: name.into(),
            order,
            description: description.into(),
            completed: false,
        }
    }
}

/// Placeholder in a storyline description replaced by the character's name.
pub const CHARACTER_NAME_PLACEHOLDER: &str = "{character_name}";

/// Descriptive record of a storyline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Storyline {
    pub id: StorylineId,
    pub description: String,
    pub character_name: String,
    pub player_name: String,
}

impl Storyline {
    pub fn new(id: StorylineId, description: impl Into<String>) -> Self {
        Self {
            id,
            description: description.into(),
            character_name: "Character".to_string(),
            player_name: "Player".to_string(),
        }
    }

    pub fn with_character_name(mut self, name: impl Into<String>) -> Self {
        self.character_name = name.into();
        self
    }

    pub fn with_player_name(mut self, name: impl Into<String>) -> Self {
        self.player_name = name.into();
        self
    }

    /// The description with the character's name filled in.
    pub fn rendered_description(&self) -> String {
        self.description
            .replace(CHARACTER_NAME_PLACEHOLDER, &self.character_name)
    }
}
