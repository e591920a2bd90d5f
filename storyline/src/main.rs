//! Headless storyline runner.
//!
//! Plays one storyline on a line-oriented terminal protocol, persisting to
//! SQLite when a database is configured:
//!
//! ```bash
//! cargo run -p storyline -- --db story.db --storyline tavern --character Mara
//! ```

mod headless;

use clap::Parser;
use std::path::PathBuf;
use storyline_core::{
    ClaudeAgent, MemoryStore, SqliteStore, Store, StoryConfig, StorySession, StorylineId,
};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "storyline")]
#[command(about = "Role-play a storyline with summarized memory, goals and milestones")]
struct Cli {
    /// Storyline to play
    #[arg(short, long, default_value = "default")]
    storyline: String,

    /// SQLite database file (overrides STORYLINE_DB); omit to keep everything in memory
    #[arg(long)]
    db: Option<PathBuf>,

    /// Model override (overrides STORYLINE_MODEL)
    #[arg(long)]
    model: Option<String>,

    /// Character name used when the storyline has no record
    #[arg(long)]
    character: Option<String>,

    /// Maximum tokens per response
    #[arg(long)]
    max_tokens: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they never interleave with the protocol on stdout.
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storyline=info,storyline_core=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut config = StoryConfig::from_env()?;
    if let Some(db) = cli.db {
        config = config.with_database(db);
    }
    if let Some(model) = cli.model {
        config = config.with_model(model);
    }
    if let Some(character) = cli.character {
        config = config.with_character_name(character);
    }
    if let Some(tokens) = cli.max_tokens {
        config = config.with_max_tokens(tokens);
    }

    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        eprintln!("Error: ANTHROPIC_API_KEY environment variable not set.");
        eprintln!("Please set it in .env file or with: export ANTHROPIC_API_KEY=your_key_here");
        std::process::exit(1);
    }

    let mut agent = ClaudeAgent::from_env()?.with_max_tokens(config.max_tokens);
    if let Some(model) = &config.model {
        agent = agent.with_model(model);
    }
    if let Some(temperature) = config.temperature {
        agent = agent.with_temperature(temperature);
    }

    let storyline = StorylineId::new(cli.storyline);
    match config.database.clone() {
        Some(path) => {
            tracing::info!(path = %path.display(), "opening database");
            run(SqliteStore::open(&path)?, agent, config, storyline).await
        }
        None => {
            tracing::info!("no database configured, storyline will not be saved");
            run(MemoryStore::new(), agent, config, storyline).await
        }
    }
}

async fn run<S: Store>(
    store: S,
    agent: ClaudeAgent,
    config: StoryConfig,
    storyline: StorylineId,
) -> Result<(), Box<dyn std::error::Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    let session = StorySession::new(store, agent, config).with_events(tx);
    headless::run_headless(session, storyline, rx).await?;
    Ok(())
}
