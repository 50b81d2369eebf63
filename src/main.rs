mod cli;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use kotoba::config::KotobaConfig;
use kotoba::server;

#[derive(Parser)]
#[command(name = "kotoba", version, about = "Streaming Japanese-tutor relay with a kanji vocabulary index")]
struct Cli {
    /// Config file (default: ~/.kotoba/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP server
    Serve,
    /// Manage access keys
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
    /// Inspect a caller's vocabulary index
    Vocab {
        #[command(subcommand)]
        action: VocabAction,
    },
    /// List a caller's chat sessions
    Sessions {
        /// Access key whose sessions to list
        #[arg(long)]
        scope: String,
    },
    /// Check database health
    Doctor,
}

#[derive(Subcommand)]
enum KeyAction {
    /// Create a new active key
    Create { label: String },
    /// List all keys
    List,
    /// Deactivate a key
    Deactivate { key: String },
}

#[derive(Subcommand)]
enum VocabAction {
    /// All units, most frequent first
    List {
        #[arg(long)]
        scope: String,
    },
    /// Units matching a character, level, reading or meaning
    Search {
        #[arg(long)]
        scope: String,
        query: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => KotobaConfig::load_from(path)?,
        None => KotobaConfig::load()?,
    };

    // Log to stderr so command output on stdout stays clean.
    let filter = EnvFilter::try_new(&config.server.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Serve => server::serve(config).await?,
        Command::Key { action } => match action {
            KeyAction::Create { label } => cli::keys::create(&config, &label)?,
            KeyAction::List => cli::keys::list(&config)?,
            KeyAction::Deactivate { key } => cli::keys::deactivate(&config, &key)?,
        },
        Command::Vocab { action } => match action {
            VocabAction::List { scope } => cli::vocab::list(&config, &scope)?,
            VocabAction::Search { scope, query } => cli::vocab::search(&config, &scope, &query)?,
        },
        Command::Sessions { scope } => cli::sessions::list(&config, &scope)?,
        Command::Doctor => cli::doctor::doctor(&config)?,
    }

    Ok(())
}
