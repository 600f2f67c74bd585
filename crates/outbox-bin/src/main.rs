//! Outbox relay - transactional outbox delivery for SQLite-backed services.

mod commands;
mod relay;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use outbox_config_and_utils::{init_logging, Config, Paths};
use outbox_store::{Database, OutboxStatus};

/// Outbox relay command-line interface.
#[derive(Parser)]
#[command(name = "outboxd")]
#[command(about = "Deliver transactional outbox events to an integration")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error). Defaults to the configured level
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Base directory for runtime files (config, database, logs). Defaults to ~/.outbox-relay
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a new pending event
    Enqueue {
        /// Event type, e.g. series.uploaded
        #[arg(long = "type")]
        event_type: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
    },
    /// Recover stale rows, claim due events and dispatch them
    Poll {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Dispatch a single event
    Dispatch { id: i64 },
    /// Report that the job delivering an event failed
    Fail {
        id: i64,
        #[arg(short, long)]
        message: String,
    },
    /// List events, newest first
    List {
        #[arg(long, value_parser = commands::parse_status)]
        status: Option<OutboxStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print one event as JSON
    Show { id: i64 },
    /// Run the relay loop until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    let config = Config::load(&paths)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_logging(level, config.log_format);

    match cli.command {
        Commands::Enqueue { event_type, payload } => {
            let db = Database::open(&config.database_file(&paths))?;
            let event = commands::enqueue(&db, &event_type, &payload)?;
            println!("{}", event.id);
        }
        Commands::Poll { limit } => {
            let dispatched = commands::poll(&config, &paths, limit).await?;
            println!("Dispatched {} outbox events.", dispatched);
        }
        Commands::Dispatch { id } => {
            println!("{}", commands::dispatch(&config, &paths, id).await?);
        }
        Commands::Fail { id, message } => {
            println!("{}", commands::fail(&config, &paths, id, &message).await?);
        }
        Commands::List { status, limit } => {
            let db = Database::open(&config.database_file(&paths))?;
            let events = db.list_events(status, limit)?;
            print!("{}", commands::render_events(&events, &db.count_by_status()?));
        }
        Commands::Show { id } => {
            let db = Database::open(&config.database_file(&paths))?;
            println!("{}", commands::show(&db, id)?);
        }
        Commands::Run => {
            commands::run(&config, &paths).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::parse_from([
            "outboxd",
            "enqueue",
            "--type",
            "series.uploaded",
            "--payload",
            r#"{"series_id":1}"#,
        ]);
        assert!(matches!(
            cli.command,
            Commands::Enqueue { ref event_type, .. } if event_type == "series.uploaded"
        ));

        let cli = Cli::parse_from(["outboxd", "list", "--status", "failed", "--base-dir", "/tmp/x"]);
        assert!(matches!(
            cli.command,
            Commands::List { status: Some(OutboxStatus::Failed), limit: 20 }
        ));
        assert_eq!(cli.base_dir, Some(PathBuf::from("/tmp/x")));

        let cli = Cli::parse_from(["outboxd", "poll"]);
        assert!(matches!(cli.command, Commands::Poll { limit: 50 }));
    }

    #[test]
    fn cli_rejects_unknown_status() {
        assert!(Cli::try_parse_from(["outboxd", "list", "--status", "stuck"]).is_err());
    }
}
