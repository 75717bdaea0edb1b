//! modtools-queue - Inspect and repair the modtools action queue
//!
//! Works on the local database only; no credentials or network needed.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libmodtools::platforms::urls::parse_list_ref;
use libmodtools::{
    logging, ActionEvent, ActionFilter, ActionQueue, ActionStatus, Config, Database, ModToolsError,
    PendingAction, QueueStats, Result,
};

#[derive(Parser, Debug)]
#[command(name = "modtools-queue")]
#[command(version)]
#[command(about = "Inspect, audit and repair the modtools action queue")]
#[command(long_about = "\
modtools-queue - Inspect and repair the modtools action queue

DESCRIPTION:
    modtools-queue reads and edits the local action queue that
    `modtools add_likes_to_be_processed` fills and `modtools process_list`
    drains. It never talks to the network.

    Lists are given as at:// URIs or as bsky.app links whose profile part
    is a DID (handles cannot be resolved offline).

USAGE:
    # Everything still pending
    modtools-queue list --status pending

    # Counts per list
    modtools-queue stats --format json

    # Put failed actions of a list back in the queue
    modtools-queue retry at://did:plc:me/app.bsky.graph.list/3kxyz

    # Never add action 42
    modtools-queue skip 42

    # Audit trail of action 42
    modtools-queue log 42

EXIT CODES:
    0 - Success
    1 - Error (database, configuration, unknown action)
    3 - Invalid input
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List actions
    List {
        /// Only actions for this list
        #[arg(long, value_name = "LIST")]
        list: Option<String>,

        /// Only actions in this status (pending, in_flight, done, failed, skipped)
        #[arg(long)]
        status: Option<String>,

        /// Only actions for this DID or handle
        #[arg(long)]
        subject: Option<String>,

        /// Show at most this many actions
        #[arg(long)]
        limit: Option<usize>,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Show per-list status counts
    Stats {
        /// Only this list
        #[arg(long, value_name = "LIST")]
        list: Option<String>,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Move failed actions of a list back to pending
    Retry {
        /// List at:// URI or DID-form URL
        list: String,
    },

    /// Mark a pending action as skipped
    Skip {
        /// Action id
        id: i64,
    },

    /// Show the status history of an action
    Log {
        /// Action id
        id: i64,

        /// Output format (text or json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_cli(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;
    let queue = ActionQueue::new(db, config.sync.reject_duplicate_pending);

    match cli.command {
        Commands::List {
            list,
            status,
            subject,
            limit,
            format,
        } => {
            validate_format(&format)?;
            let filter = ActionFilter {
                list: list.as_deref().map(local_list_uri).transpose()?,
                status: status.as_deref().map(|s| s.parse::<ActionStatus>()).transpose()?,
                subject: subject.map(|s| s.trim_start_matches('@').to_string()),
                limit,
            };
            cmd_list(&queue, &filter, &format).await
        }
        Commands::Stats { list, format } => {
            validate_format(&format)?;
            let list = list.as_deref().map(local_list_uri).transpose()?;
            cmd_stats(&queue, list.as_deref(), &format).await
        }
        Commands::Retry { list } => cmd_retry(&queue, &local_list_uri(&list)?).await,
        Commands::Skip { id } => cmd_skip(&queue, id).await,
        Commands::Log { id, format } => {
            validate_format(&format)?;
            cmd_log(&queue, id, &format).await
        }
    }
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(ModToolsError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

/// Canonical list at-uri without a network lookup
fn local_list_uri(input: &str) -> Result<String> {
    let record = parse_list_ref(input)?;
    if !record.is_resolved() {
        return Err(ModToolsError::InvalidInput(format!(
            "'{}' names the list owner by handle; use the at:// URI or the did: form of the URL",
            input.trim()
        )));
    }
    Ok(record.at_uri(&record.actor))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ModToolsError::InvalidInput(format!("Failed to serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn format_time(timestamp: i64) -> String {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}

/// List actions
async fn cmd_list(queue: &ActionQueue, filter: &ActionFilter, format: &str) -> Result<()> {
    let actions = queue.list(filter).await?;

    if format == "json" {
        return print_json(&actions);
    }

    for action in &actions {
        println!("{}", format_action_line(action));
    }
    Ok(())
}

fn format_action_line(action: &PendingAction) -> String {
    let mut line = format!(
        "{} | {} | {} | {} | attempts: {}",
        action.id,
        action.status,
        action.display_subject(),
        format_time(action.enqueued_at),
        action.attempts
    );
    if let Some(error) = &action.last_error {
        line.push_str(&format!(" | {}", error));
    }
    line
}

/// Show queue statistics
async fn cmd_stats(queue: &ActionQueue, list: Option<&str>, format: &str) -> Result<()> {
    let per_list = match list {
        Some(list) => vec![(list.to_string(), queue.stats(Some(list)).await?)],
        None => queue.stats_by_list().await?,
    };

    if format == "json" {
        let json: Vec<serde_json::Value> = per_list
            .iter()
            .map(|(list, stats)| serde_json::json!({ "list": list, "stats": stats }))
            .collect();
        return print_json(&json);
    }

    if per_list.is_empty() {
        println!("Queue is empty");
        return Ok(());
    }
    for (list, stats) in &per_list {
        print_stats_text(list, stats);
    }
    Ok(())
}

fn print_stats_text(list: &str, stats: &QueueStats) {
    println!("{}", list);
    for status in ActionStatus::ALL {
        let count = match status {
            ActionStatus::Pending => stats.pending,
            ActionStatus::InFlight => stats.in_flight,
            ActionStatus::Done => stats.done,
            ActionStatus::Failed => stats.failed,
            ActionStatus::Skipped => stats.skipped,
        };
        println!("  {:<10} {}", status.as_str(), count);
    }
    if let Some(oldest) = stats.oldest_pending {
        println!("  oldest pending: {}", format_time(oldest));
    }
}

async fn cmd_retry(queue: &ActionQueue, list: &str) -> Result<()> {
    let count = queue.retry_failed(list).await?;
    println!("Requeued {} failed action(s)", count);
    Ok(())
}

async fn cmd_skip(queue: &ActionQueue, id: i64) -> Result<()> {
    let action = queue.skip(id).await?;
    println!("Skipped action {} ({})", action.id, action.display_subject());
    Ok(())
}

/// Show the audit trail of one action
async fn cmd_log(queue: &ActionQueue, id: i64, format: &str) -> Result<()> {
    let events = queue.events(id).await?;

    if format == "json" {
        return print_json(&events);
    }

    for event in &events {
        println!("{}", format_event_line(event));
    }
    Ok(())
}

fn format_event_line(event: &ActionEvent) -> String {
    let from = event.from_status.map(|s| s.as_str()).unwrap_or("-");
    let mut line = format!("{} | {} -> {}", format_time(event.at), from, event.to_status);
    if let Some(detail) = &event.detail {
        line.push_str(&format!(" | {}", detail));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_list_uri() {
        assert_eq!(
            local_list_uri("https://bsky.app/profile/did:plc:me/lists/3kmod").unwrap(),
            "at://did:plc:me/app.bsky.graph.list/3kmod"
        );
        assert_eq!(
            local_list_uri("at://did:plc:me/app.bsky.graph.list/3kmod").unwrap(),
            "at://did:plc:me/app.bsky.graph.list/3kmod"
        );
        let err = local_list_uri("https://bsky.app/profile/me.bsky.social/lists/3kmod").unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_format_event_line() {
        let event = ActionEvent {
            id: 1,
            action_id: 7,
            from_status: None,
            to_status: ActionStatus::Pending,
            at: 0,
            detail: Some("staged from manual".to_string()),
        };
        assert_eq!(
            format_event_line(&event),
            "1970-01-01 00:00:00 | - -> pending | staged from manual"
        );
    }

    #[test]
    fn test_validate_format() {
        assert!(validate_format("text").is_ok());
        assert!(validate_format("json").is_ok());
        assert_eq!(validate_format("yaml").unwrap_err().exit_code(), 3);
    }
}
