//! SQLite backend.

use super::schema::SCHEMA;
use super::{GoalFilter, IdRange, Store, StoreError, Tables};
use crate::model::{Goal, Message, Milestone, Role, Storyline, StorylineId, SummaryCheckpoint};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Store backed by a single SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and install the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.display(), "Opened storyline database");

        Ok(Self {
            conn,
            path: Some(path),
        })
    }

    /// A private database that lives only as long as this store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

impl Store for SqliteStore {
    fn transaction<T, E>(
        &mut self,
        f: impl FnOnce(&mut dyn Tables) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let tx = self.conn.transaction().map_err(StoreError::from)?;
        let mut tables = SqliteTables { conn: &tx };
        // Dropping an uncommitted transaction rolls it back
        let out = f(&mut tables)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }
}

struct SqliteTables<'c> {
    conn: &'c Connection,
}

fn to_sql_id(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::Corrupt(format!("id {id} exceeds SQLite range")))
}

fn from_sql_id(id: i64) -> Result<u64, StoreError> {
    u64::try_from(id).map_err(|_| StoreError::Corrupt(format!("negative id {id}")))
}

type MessageRow = (String, i64, String, String);

fn message_from_row((storyline, id, role, content): MessageRow) -> Result<Message, StoreError> {
    Ok(Message {
        storyline: StorylineId::new(storyline),
        id: from_sql_id(id)?,
        role: role
            .parse::<Role>()
            .map_err(|e| StoreError::Corrupt(e.to_string()))?,
        content,
    })
}

type GoalRow = (String, String, String, bool, String);

fn goal_from_row((storyline, name, description, completed, persistence): GoalRow) -> Result<Goal, StoreError> {
    Ok(Goal {
        storyline: StorylineId::new(storyline),
        name,
        description,
        completed,
        persistence: persistence
            .parse()
            .map_err(|e: crate::model::UnknownVariant| StoreError::Corrupt(e.to_string()))?,
    })
}

impl Tables for SqliteTables<'_> {
    fn storyline(&self, id: &StorylineId) -> Result<Option<Storyline>, StoreError> {
        let record = self
            .conn
            .query_row(
                "SELECT id, description, character_name, player_name FROM storylines WHERE id = ?1",
                params![id.as_str()],
                |row| {
                    Ok(Storyline {
                        id: StorylineId::new(row.get::<_, String>(0)?),
                        description: row.get(1)?,
                        character_name: row.get(2)?,
                        player_name: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(record)
    }

    fn upsert_storyline(&mut self, storyline: &Storyline) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO storylines(id, description, character_name, player_name) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET description = excluded.description, \
             character_name = excluded.character_name, player_name = excluded.player_name",
            params![
                storyline.id.as_str(),
                storyline.description,
                storyline.character_name,
                storyline.player_name,
            ],
        )?;
        Ok(())
    }

    fn delete_storyline(&mut self, id: &StorylineId) -> Result<bool, StoreError> {
        let mut removed = self
            .conn
            .execute("DELETE FROM storylines WHERE id = ?1", params![id.as_str()])?;
        for table in ["messages", "checkpoints", "goals", "milestones"] {
            removed += self.conn.execute(
                &format!("DELETE FROM {table} WHERE storyline_id = ?1"),
                params![id.as_str()],
            )?;
        }
        self.conn.execute(
            "DELETE FROM message_sequences WHERE storyline_id = ?1",
            params![id.as_str()],
        )?;
        debug!(storyline = %id, removed, "Deleted storyline");
        Ok(removed > 0)
    }

    fn append_message(
        &mut self,
        storyline: &StorylineId,
        role: Role,
        content: &str,
    ) -> Result<Message, StoreError> {
        self.conn.execute(
            "INSERT INTO message_sequences(storyline_id, last_id) VALUES (?1, 1) \
             ON CONFLICT(storyline_id) DO UPDATE SET last_id = last_id + 1",
            params![storyline.as_str()],
        )?;
        let id: i64 = self.conn.query_row(
            "SELECT last_id FROM message_sequences WHERE storyline_id = ?1",
            params![storyline.as_str()],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO messages(storyline_id, id, role, content) VALUES (?1, ?2, ?3, ?4)",
            params![storyline.as_str(), id, role.as_str(), content],
        )?;

        Ok(Message {
            storyline: storyline.clone(),
            id: from_sql_id(id)?,
            role,
            content: content.to_string(),
        })
    }

    fn messages(&self, storyline: &StorylineId, range: IdRange) -> Result<Vec<Message>, StoreError> {
        let after = range.after.map(to_sql_id).transpose()?;
        let before = range.before.map(to_sql_id).transpose()?;

        let mut stmt = self.conn.prepare(
            "SELECT storyline_id, id, role, content FROM messages \
             WHERE storyline_id = ?1 AND (?2 IS NULL OR id > ?2) AND (?3 IS NULL OR id < ?3) \
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![storyline.as_str(), after, before], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<MessageRow>, _>>()?;

        rows.into_iter().map(message_from_row).collect()
    }

    fn latest_messages(
        &self,
        storyline: &StorylineId,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self.conn.prepare(
            "SELECT storyline_id, id, role, content FROM messages \
             WHERE storyline_id = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![storyline.as_str(), limit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<MessageRow>, _>>()?;

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        messages.reverse();
        Ok(messages)
    }

    fn delete_messages_from(
        &mut self,
        storyline: &StorylineId,
        from_id: u64,
    ) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM messages WHERE storyline_id = ?1 AND id >= ?2",
            params![storyline.as_str(), to_sql_id(from_id)?],
        )?)
    }

    fn insert_checkpoint(&mut self, checkpoint: &SummaryCheckpoint) -> Result<(), StoreError> {
        let latest: Option<i64> = self.conn.query_row(
            "SELECT MAX(until_id) FROM checkpoints WHERE storyline_id = ?1",
            params![checkpoint.storyline.as_str()],
            |row| row.get(0),
        )?;
        if let Some(latest) = latest.map(from_sql_id).transpose()? {
            if checkpoint.until_id <= latest {
                return Err(StoreError::StaleCheckpoint {
                    storyline: checkpoint.storyline.clone(),
                    until_id: checkpoint.until_id,
                    latest,
                });
            }
        }

        self.conn.execute(
            "INSERT INTO checkpoints(storyline_id, until_id, content) VALUES (?1, ?2, ?3)",
            params![
                checkpoint.storyline.as_str(),
                to_sql_id(checkpoint.until_id)?,
                checkpoint.content,
            ],
        )?;
        Ok(())
    }

    fn latest_checkpoint(
        &self,
        storyline: &StorylineId,
        below: Option<u64>,
    ) -> Result<Option<SummaryCheckpoint>, StoreError> {
        let below = below.map(to_sql_id).transpose()?;
        let row = self
            .conn
            .query_row(
                "SELECT until_id, content FROM checkpoints \
                 WHERE storyline_id = ?1 AND (?2 IS NULL OR until_id < ?2) \
                 ORDER BY until_id DESC LIMIT 1",
                params![storyline.as_str(), below],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()?;

        row.map(|(until_id, content)| {
            Ok(SummaryCheckpoint {
                storyline: storyline.clone(),
                until_id: from_sql_id(until_id)?,
                content,
            })
        })
        .transpose()
    }

    fn checkpoints(&self, storyline: &StorylineId) -> Result<Vec<SummaryCheckpoint>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT until_id, content FROM checkpoints WHERE storyline_id = ?1 ORDER BY until_id ASC",
        )?;
        let rows = stmt
            .query_map(params![storyline.as_str()], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(until_id, content)| {
                Ok(SummaryCheckpoint {
                    storyline: storyline.clone(),
                    until_id: from_sql_id(until_id)?,
                    content,
                })
            })
            .collect()
    }

    fn delete_checkpoints_from(
        &mut self,
        storyline: &StorylineId,
        from_until_id: u64,
    ) -> Result<usize, StoreError> {
        Ok(self.conn.execute(
            "DELETE FROM checkpoints WHERE storyline_id = ?1 AND until_id >= ?2",
            params![storyline.as_str(), to_sql_id(from_until_id)?],
        )?)
    }

    fn goal(&self, storyline: &StorylineId, name: &str) -> Result<Option<Goal>, StoreError> {
        let row = self
            .conn
            .query_row(
                "SELECT storyline_id, name, description, completed, persistence FROM goals \
                 WHERE storyline_id = ?1 AND name = ?2",
                params![storyline.as_str(), name],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .optional()?;
        row.map(goal_from_row).transpose()
    }

    fn goals(&self, storyline: &StorylineId, filter: GoalFilter) -> Result<Vec<Goal>, StoreError> {
        let excluded = filter.exclude.map(|p| p.name());
        let mut stmt = self.conn.prepare(
            "SELECT storyline_id, name, description, completed, persistence FROM goals \
             WHERE storyline_id = ?1 AND (?2 IS NULL OR completed = ?2) \
             AND (?3 IS NULL OR persistence != ?3) \
             ORDER BY name ASC",
        )?;
        let rows = stmt
            .query_map(params![storyline.as_str(), filter.completed, excluded], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
            })?
            .collect::<Result<Vec<GoalRow>, _>>()?;

        rows.into_iter().map(goal_from_row).collect()
    }

    fn upsert_goal(&mut self, goal: &Goal) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO goals(storyline_id, name, description, completed, persistence) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(storyline_id, name) DO UPDATE SET description = excluded.description, \
             completed = excluded.completed, persistence = excluded.persistence",
            params![
                goal.storyline.as_str(),
                goal.name,
                goal.description,
                goal.completed,
                goal.persistence.name(),
            ],
        )?;
        Ok(())
    }

    fn delete_goal(&mut self, storyline: &StorylineId, name: &str) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM goals WHERE storyline_id = ?1 AND name = ?2",
            params![storyline.as_str(), name],
        )?;
        Ok(removed > 0)
    }

    fn milestones(&self, storyline: &StorylineId) -> Result<Vec<Milestone>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, \"order\", description, completed FROM milestones \
             WHERE storyline_id = ?1 ORDER BY \"order\" ASC",
        )?;
        let milestones = stmt
            .query_map(params![storyline.as_str()], |row| {
                Ok(Milestone {
                    storyline: storyline.clone(),
                    name: row.get(0)?,
                    order: row.get(1)?,
                    description: row.get(2)?,
                    completed: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(milestones)
    }

    fn upsert_milestone(&mut self, milestone: &Milestone) -> Result<(), StoreError> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT name FROM milestones WHERE storyline_id = ?1 AND \"order\" = ?2 AND name != ?3",
                params![milestone.storyline.as_str(), milestone.order, milestone.name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(existing) = existing {
            return Err(StoreError::DuplicateMilestoneOrder {
                storyline: milestone.storyline.clone(),
                order: milestone.order,
                existing,
            });
        }

        self.conn.execute(
            "INSERT INTO milestones(storyline_id, name, \"order\", description, completed) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT(storyline_id, name) DO UPDATE SET \"order\" = excluded.\"order\", \
             description = excluded.description, completed = excluded.completed",
            params![
                milestone.storyline.as_str(),
                milestone.name,
                milestone.order,
                milestone.description,
                milestone.completed,
            ],
        )?;
        Ok(())
    }

    fn delete_milestone(
        &mut self,
        storyline: &StorylineId,
        name: &str,
    ) -> Result<bool, StoreError> {
        let removed = self.conn.execute(
            "DELETE FROM milestones WHERE storyline_id = ?1 AND name = ?2",
            params![storyline.as_str(), name],
        )?;
        Ok(removed > 0)
    }
}
