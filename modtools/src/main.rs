//! modtools - Bluesky moderation-list synchronizer
//!
//! Stages the likers of a post for addition to a moderation list and drains
//! staged actions into the list, backing off whenever the server says so.

use clap::{Parser, Subcommand};
use libmodtools::logging;
use libmodtools::platforms::bluesky::BlueskyPlatform;
use libmodtools::platforms::urls::{parse_list_ref, parse_post_ref};
use libmodtools::platforms::Platform;
use libmodtools::{
    stage_likes, ActionQueue, Config, Database, ModToolsError, Result, StageReport, SyncOptions,
    SyncReport, Synchronizer,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "modtools")]
#[command(version)]
#[command(about = "Stage post likers for a Bluesky moderation list and sync them")]
#[command(long_about = "\
modtools - Bluesky moderation-list synchronizer

DESCRIPTION:
    modtools works in two steps. First it stages everyone who liked a post
    as a pending action against a moderation list. Then it drains the
    pending actions into the list, oldest first, pausing whenever the
    server (or the local hourly budget) asks it to slow down.

    Every action is tracked in a local SQLite database, so a drain can be
    interrupted at any time and resumed later. Accounts already added are
    never added twice.

USAGE:
    # Stage the likers of a post for the default list
    modtools add_likes_to_be_processed https://bsky.app/profile/someone.bsky.social/post/3kabc

    # Stage them for a specific list
    modtools add_likes_to_be_processed <POST_URL> --list https://bsky.app/profile/me.bsky.social/lists/3kxyz

    # Drain the list
    modtools process_list https://bsky.app/profile/me.bsky.social/lists/3kxyz

    # Machine-readable report
    modtools process_list <LIST_URL> --format json

SIGNALS:
    SIGTERM, SIGINT - Stop after the current action; the rest stays pending

CONFIGURATION:
    Configuration file: ~/.config/modtools/config.toml (or $MODTOOLS_CONFIG)
    App password: OS keyring (see modtools-creds) or $MODTOOLS_APP_PASSWORD

EXIT CODES:
    0 - Success (including a stopped or deferred drain)
    1 - Runtime error (network, database, configuration)
    2 - Authentication error (bad or missing app password)
    3 - Invalid input (malformed URL, unknown format)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format (text or json)
    #[arg(short, long, global = true, default_value = "text")]
    format: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Stage every liker of a post for addition to a list
    #[command(name = "add_likes_to_be_processed")]
    AddLikes {
        /// Post URL (bsky.app link or at:// URI)
        post_url: String,

        /// List URL; defaults to bluesky.default_list
        #[arg(short, long, value_name = "LIST_URL")]
        list: Option<String>,
    },

    /// Add every pending action of a list to the list
    #[command(name = "process_list")]
    ProcessList {
        /// List URL (bsky.app link or at:// URI)
        list_url: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(value: &str) -> Result<Self> {
        match value {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(ModToolsError::InvalidInput(format!(
                "Invalid format '{}'. Must be 'text' or 'json'",
                other
            ))),
        }
    }
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
    let format = OutputFormat::parse(&cli.format)?;

    match cli.command {
        Commands::AddLikes { post_url, list } => cmd_add_likes(&post_url, list.as_deref(), format).await,
        Commands::ProcessList { list_url } => cmd_process_list(&list_url, format).await,
    }
}

async fn cmd_add_likes(post_url: &str, list: Option<&str>, format: OutputFormat) -> Result<()> {
    // Malformed input fails before any configuration or network access
    parse_post_ref(post_url)?;
    if let Some(list_url) = list {
        parse_list_ref(list_url)?;
    }

    let config = Config::load()?;
    let list_url = match list {
        Some(list_url) => list_url.to_string(),
        None => config.bluesky.default_list.clone().ok_or_else(|| {
            ModToolsError::InvalidInput(
                "No list given. Pass --list <LIST_URL> or set bluesky.default_list".to_string(),
            )
        })?,
    };
    parse_list_ref(&list_url)?;

    let db = Database::new(&config.database.path).await?;
    let queue = ActionQueue::new(db, config.sync.reject_duplicate_pending);

    let mut platform = BlueskyPlatform::from_config(&config)?;
    platform.authenticate().await?;

    let report = stage_likes(&platform, &queue, post_url, &list_url).await?;
    print_stage_report(&report, format)
}

async fn cmd_process_list(list_url: &str, format: OutputFormat) -> Result<()> {
    parse_list_ref(list_url)?;

    let config = Config::load()?;
    let options = SyncOptions::from_config(&config.sync)?;
    let db = Database::new(&config.database.path).await?;
    let platform = BlueskyPlatform::from_config(&config)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    setup_signal_handlers(shutdown.clone())?;

    let mut synchronizer = Synchronizer::new(db, Box::new(platform), options).with_shutdown(shutdown);
    synchronizer.connect().await?;
    let list = synchronizer.platform().resolve_list(list_url).await?;

    let report = synchronizer.process(&list).await?;
    print_sync_report(&report, format)
}

/// Set up signal handlers for a graceful stop
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| ModToolsError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        if signals.forever().next().is_some() {
            tracing::info!("Received shutdown signal, stopping after the current action...");
            shutdown.store(true, Ordering::Relaxed);
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| ModToolsError::InvalidInput(format!("Failed to serialize output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn print_stage_report(report: &StageReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    println!("Post:  {}", report.post);
    println!("List:  {}", report.list);
    println!("Likers found:      {}", report.likers);
    println!("Newly staged:      {}", report.enqueued);
    if report.requeued > 0 {
        println!("Requeued (failed): {}", report.requeued);
    }
    println!("Already pending:   {}", report.already_queued);
    println!("Already added:     {}", report.already_done);
    if report.already_skipped > 0 {
        println!("Previously skipped: {}", report.already_skipped);
    }
    if report.newly_pending() > 0 {
        println!("\nRun `modtools process_list {}` to add them.", report.list);
    }
    Ok(())
}

fn print_sync_report(report: &SyncReport, format: OutputFormat) -> Result<()> {
    if format == OutputFormat::Json {
        return print_json(report);
    }

    println!("List: {}", report.list);
    if report.reclaimed > 0 {
        println!("Reclaimed stale:  {}", report.reclaimed);
    }
    println!("Added:            {}", report.done);
    println!("Skipped:          {}", report.skipped);
    println!("Failed:           {}", report.failed);
    if report.rate_limit_waits > 0 {
        println!("Rate-limit waits: {}", report.rate_limit_waits);
    }

    if report.interrupted {
        println!("\nStopped early; remaining actions stay pending.");
    } else if let Some(until) = report.deferred_until {
        let when = chrono::DateTime::from_timestamp(until, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| until.to_string());
        println!("\nRate limited until {}; run again after that.", when);
    } else if report.processed == 0 {
        println!("\nNothing to do.");
    }
    if report.failed > 0 {
        println!("Retry failures with `modtools-queue retry {}`.", report.list);
    }
    Ok(())
}
