pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storylines (
    id TEXT PRIMARY KEY,
    description TEXT NOT NULL,
    character_name TEXT NOT NULL,
    player_name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS message_sequences (
    storyline_id TEXT PRIMARY KEY,
    last_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS messages (
    storyline_id TEXT NOT NULL,
    id INTEGER NOT NULL,
    role TEXT NOT NULL CHECK (role IN ('user', 'assistant', 'system')),
    content TEXT NOT NULL,
    PRIMARY KEY (storyline_id, id)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    storyline_id TEXT NOT NULL,
    until_id INTEGER NOT NULL,
    content TEXT NOT NULL,
    PRIMARY KEY (storyline_id, until_id)
);

CREATE TABLE IF NOT EXISTS goals (
    storyline_id TEXT NOT NULL,
    name TEXT NOT NULL,
    description TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    persistence TEXT NOT NULL DEFAULT 'Medium' CHECK (persistence IN ('Low', 'Medium', 'High', 'Forever')),
    PRIMARY KEY (storyline_id, name)
);

CREATE TABLE IF NOT EXISTS milestones (
    storyline_id TEXT NOT NULL,
    name TEXT NOT NULL,
    "order" INTEGER NOT NULL,
    description TEXT NOT NULL,
    completed INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (storyline_id, name),
    UNIQUE (storyline_id, "order")
);

CREATE INDEX IF NOT EXISTS idx_goals_completed ON goals(storyline_id, completed);
"#;
