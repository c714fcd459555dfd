use std::path::PathBuf;

use clap::Parser;
use clap_complete::Shell;

use crate::config::DebateConfig;

#[derive(Parser, Debug)]
#[command(name = "debate-stream")]
#[command(version)]
#[command(about = "Stream a debate from the backend and render it with paced turn reveal")]
pub struct Args {
    /// Debate topic (or message, with --resume)
    pub topic: Option<String>,

    /// Debate participant; repeat for each speaker
    #[arg(long = "participant", short = 'p')]
    pub participants: Vec<String>,

    /// Path to a TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Backend base URL (overrides config and DEBATE_API_URL)
    #[arg(long)]
    pub api_url: Option<String>,

    /// Minimum hidden time before a turn's first text, in milliseconds
    #[arg(long)]
    pub dwell_ms: Option<u64>,

    /// Replay a captured NDJSON file instead of calling the backend
    #[arg(long)]
    pub replay: Option<PathBuf>,

    /// SQLite file for saved sessions
    #[arg(long)]
    pub session_db: Option<PathBuf>,

    /// Resume a saved session by id
    #[arg(long, conflicts_with = "replay")]
    pub resume: Option<i64>,

    /// List saved sessions and exit
    #[arg(long)]
    pub list_sessions: bool,

    /// Log malformed stream lines
    #[arg(long)]
    pub debug_stream: bool,

    /// Verbose logging to stderr
    #[arg(long, short)]
    pub verbose: bool,

    /// Print shell completions and exit
    #[arg(long, value_enum)]
    pub completions: Option<Shell>,
}

impl Args {
    /// Layer command-line overrides onto `config`.
    pub fn apply_to(&self, mut config: DebateConfig) -> DebateConfig {
        if let Some(url) = &self.api_url {
            config.api_base_url = url.clone();
        }
        if let Some(dwell) = self.dwell_ms {
            config.dwell_ms = dwell;
        }
        if let Some(db) = &self.session_db {
            config.session_db = Some(db.clone());
        }
        if !self.participants.is_empty() {
            config.participants = self.participants.clone();
        }
        if self.debug_stream {
            config.log_malformed_lines = true;
        }
        config
    }
}
