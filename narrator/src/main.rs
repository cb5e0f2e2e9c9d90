//! Headless interactive narrator.
//!
//! Reads player input line by line and prints the narrator's replies.
//!
//! ```bash
//! cargo run -p narrator -- --world world.json --date 1520-03-14 --location Toledo
//! ```

mod headless;

use clap::Parser;
use narrator_core::{MemoryStore, NarratorConfig, NarratorSession};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "narrator", about = "Interactive narrator over a world file")]
struct Args {
    /// World file: `{"characters": [...], "events": [...], "laws": [...]}`
    #[arg(short, long)]
    world: PathBuf,

    /// Starting date (YYYY-MM-DD)
    #[arg(long, default_value = "")]
    date: String,

    /// Starting location
    #[arg(long, default_value = "")]
    location: String,

    /// Story so far, carried into the first prompt
    #[arg(long, default_value = "")]
    summary: String,

    /// Model for router calls
    #[arg(long, env = "NARRATOR_ROUTER_MODEL")]
    router_model: Option<String>,

    /// Model for generation calls
    #[arg(long, env = "NARRATOR_MODEL")]
    model: Option<String>,

    /// Sticky context budget in estimated tokens
    #[arg(long)]
    sticky_budget: Option<usize>,

    /// Open the session with a scene-setting turn
    #[arg(long)]
    open: bool,
}

impl Args {
    fn config(&self) -> NarratorConfig {
        let mut config = NarratorConfig::default();
        if let Some(model) = &self.router_model {
            config = config.with_router_model(model);
        }
        if let Some(model) = &self.model {
            config = config.with_generation_model(model);
        }
        if let Some(budget) = self.sticky_budget {
            config = config.with_sticky_budget(budget);
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logs go to stderr so stdout stays a clean transcript
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("narrator=info".parse()?),
        )
        .init();

    if std::env::var("ANTHROPIC_API_KEY").is_err() {
        eprintln!("Error: ANTHROPIC_API_KEY environment variable not set.");
        eprintln!("Please set it in .env file or with: export ANTHROPIC_API_KEY=your_key_here");
        std::process::exit(1);
    }

    let store = MemoryStore::load(&args.world).await?;
    info!(
        characters = store.character_count(),
        events = store.event_count(),
        laws = store.law_count(),
        "world loaded"
    );

    let session = NarratorSession::from_env(Arc::new(store), args.config())?;
    session.try_with(|o| o.start_session(&args.date, &args.location, &args.summary))?;

    headless::run_headless(session, args.open).await?;
    Ok(())
}
