//! teamdesk - command line host for the dashboard session layer.
//!
//! Logs in with a QR code, sends requests through the authenticated
//! pipeline, and sends the user back to `teamdesk login` when the session
//! can no longer be recovered.

mod commands;

use std::io;
use std::path::Path;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use teamdesk_core::Config;

/// Teamdesk dashboard client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Backend base URL (overrides config file and TEAMDESK_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in by scanning a QR code with a signed-in device
    Login,
    /// End the session on this machine
    Logout,
    /// Show the stored session state
    Status,
    /// Send a request through the authenticated pipeline
    Request {
        /// HTTP method (GET, POST, PUT, DELETE, ...)
        method: String,
        /// Endpoint path relative to the base URL, e.g. /teams
        endpoint: String,
        /// JSON request body
        #[arg(long)]
        data: Option<String>,
        /// Send without credentials
        #[arg(long)]
        skip_auth: bool,
        /// Print the raw HTTP status and body instead of the parsed envelope
        #[arg(long)]
        raw: bool,
    },
}

/// Initialize the tracing subscriber for logging.
///
/// Warnings go to stderr; everything the filter lets through also goes to a
/// daily log file when the log directory is usable.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = log_dir.and_then(|dir| {
        std::fs::create_dir_all(dir).ok()?;
        RollingFileAppender::builder()
            .rotation(Rotation::DAILY)
            .filename_prefix("teamdesk")
            .filename_suffix("log")
            .build(dir)
            .ok()
    });

    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(io::stderr));

    match file_appender {
        Some(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            registry.init();
            None
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load()?;
    if let Some(ref base_url) = cli.base_url {
        config.base_url = base_url.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let log_dir = config.cache_dir().ok().map(|dir| dir.join("logs"));
    let _log_guard = init_tracing(log_dir.as_deref());
    info!(base_url = %config.base_url, "teamdesk starting");

    match commands::run(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
