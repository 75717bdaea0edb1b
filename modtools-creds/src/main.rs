//! modtools-creds - App password management for modtools
//!
//! Stores the Bluesky app password in the OS keyring, checks that it logs
//! in, and removes it again.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use libmodtools::config::Config;
use libmodtools::credentials::{CredentialManager, PASSWORD_ENV};
use libmodtools::logging;
use libmodtools::platforms::bluesky::BlueskyPlatform;
use libmodtools::platforms::Platform;
use libmodtools::ModToolsError;
use std::io::{self, IsTerminal, Read};

#[derive(Parser)]
#[command(name = "modtools-creds")]
#[command(version)]
#[command(about = "Manage the Bluesky app password used by modtools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the app password for the configured handle
    Set {
        /// Handle to store the password for (default: bluesky.handle)
        #[arg(long)]
        handle: Option<String>,

        /// Read the app password from stdin (for automation/agents)
        #[arg(long)]
        stdin: bool,
    },

    /// Delete the stored app password
    Delete {
        /// Handle to delete the password for (default: bluesky.handle)
        #[arg(long)]
        handle: Option<String>,
    },

    /// Test the app password by logging in to Bluesky
    Test,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_cli(cli.verbose);

    if let Err(e) = run_command(cli.command).await {
        eprintln!("Error: {:#}", e);
        let code = e
            .downcast_ref::<ModToolsError>()
            .map(ModToolsError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run_command(command: Commands) -> Result<()> {
    match command {
        Commands::Set { handle, stdin } => set_password(handle.as_deref(), stdin),
        Commands::Delete { handle } => delete_password(handle.as_deref()),
        Commands::Test => test_password().await,
    }
}

fn target_handle(config: &Config, handle: Option<&str>) -> String {
    handle
        .unwrap_or(&config.bluesky.handle)
        .trim()
        .trim_start_matches('@')
        .to_string()
}

/// Store the app password
fn set_password(handle: Option<&str>, use_stdin: bool) -> Result<()> {
    let config = Config::load()?;
    let handle = target_handle(&config, handle);
    let manager = CredentialManager::new(config.credentials.storage);

    let value = if use_stdin {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read app password from stdin")?;
        buffer.trim().to_string()
    } else {
        if !io::stdin().is_terminal() {
            anyhow::bail!("Not a TTY. Use --stdin to read the app password from stdin.");
        }
        rpassword::prompt_password(format!("Enter Bluesky app password for {}: ", handle))?
    };

    if value.is_empty() {
        anyhow::bail!("App password cannot be empty");
    }

    let backend = manager.store(&handle, &value)?;
    println!("✓ Stored app password for {} using {} backend", handle, backend);
    Ok(())
}

/// Delete the app password from every writable backend
fn delete_password(handle: Option<&str>) -> Result<()> {
    let config = Config::load()?;
    let handle = target_handle(&config, handle);
    let manager = CredentialManager::new(config.credentials.storage);

    match manager.delete(&handle)? {
        0 => println!("No stored app password for {}", handle),
        n => println!("✓ Deleted app password for {} from {} backend(s)", handle, n),
    }
    if std::env::var(PASSWORD_ENV).is_ok() {
        println!("Note: {} is still set in the environment", PASSWORD_ENV);
    }
    Ok(())
}

/// Log in with the stored app password
async fn test_password() -> Result<()> {
    let config = Config::load()?;
    let mut platform = BlueskyPlatform::from_config(&config)?;

    println!("Testing Bluesky credentials for {}...", platform.handle());
    platform.authenticate().await?;
    println!(
        "✓ Logged in as {} ({})",
        platform.handle(),
        platform.session_did().unwrap_or("unknown DID")
    );
    Ok(())
}
