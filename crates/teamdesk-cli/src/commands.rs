//! Command implementations.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Method;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::debug;

use teamdesk_core::api::{ApiClient, ApiEnvelope, RequestOptions};
use teamdesk_core::auth::{QrLogin, QrLoginStatus, QrTicket, SessionEvent, SessionManager};
use teamdesk_core::Config;

use crate::Command;

/// Exit code when the session ended and the user has to log in again
const SESSION_ENDED_EXIT_CODE: u8 = 2;

pub async fn run(command: Command, config: Config) -> Result<ExitCode> {
    let session = Arc::new(SessionManager::new(config.session_store()?));
    let mut events = session.subscribe();
    let api = ApiClient::new(&config, session)?;

    let result = match command {
        Command::Login => login(api, &config).await,
        Command::Logout => logout(&api).await,
        Command::Status => status(&api, &config),
        Command::Request {
            method,
            endpoint,
            data,
            skip_auth,
            raw,
        } => send_request(&api, &method, &endpoint, data.as_deref(), skip_auth, raw).await,
    };

    let session_ended = report_session_events(&mut events);
    finish(result, session_ended)
}

/// A command that failed because the session ended exits with
/// [`SESSION_ENDED_EXIT_CODE`] after the user has been told to log in again.
fn finish(result: Result<ExitCode>, session_ended: bool) -> Result<ExitCode> {
    match result {
        Err(e) if session_ended => {
            debug!(error = %e, "Command failed after session ended");
            Ok(ExitCode::from(SESSION_ENDED_EXIT_CODE))
        }
        other => other,
    }
}

/// Tell the user about session changes. Returns true when the session was
/// terminated.
fn report_session_events(events: &mut broadcast::Receiver<SessionEvent>) -> bool {
    let mut terminated = false;
    loop {
        match events.try_recv() {
            Ok(SessionEvent::Terminated { reason }) => {
                eprintln!("Session ended: {}", reason);
                eprintln!("Run `teamdesk login` to sign in again.");
                terminated = true;
            }
            Ok(event) => debug!(?event, "Session event"),
            Err(TryRecvError::Lagged(skipped)) => debug!(skipped, "Missed session events"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    terminated
}

async fn login(api: ApiClient, config: &Config) -> Result<ExitCode> {
    if api.session().is_logged_in() {
        println!("Already logged in. Run `teamdesk logout` first to switch accounts.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut qr = QrLogin::from_config(api, config);
    let mut ticket = qr.generate().await.context("Failed to create a login code")?;

    loop {
        show_ticket(&ticket);

        let outcome = tokio::select! {
            outcome = qr.wait(print_status) => outcome?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nLogin cancelled.");
                return Ok(ExitCode::FAILURE);
            }
        };

        if outcome == QrLoginStatus::Success {
            return Ok(ExitCode::SUCCESS);
        }
        if !confirm("Generate a new code? [y/N] ")? {
            return Ok(ExitCode::FAILURE);
        }
        ticket = qr
            .regenerate()
            .await
            .context("Failed to create a login code")?;
    }
}

fn show_ticket(ticket: &QrTicket) {
    println!("\n=== Teamdesk Login ===\n");
    println!("Scan this code with a signed-in teamdesk app:");
    println!("  {}", ticket.qr_url);
    if let Some(secs) = ticket.expires_in {
        println!("The code is valid for {} seconds.", secs);
    }
    println!();
}

fn print_status(status: QrLoginStatus) {
    match status {
        QrLoginStatus::Pending => {}
        QrLoginStatus::Scanned => println!("Code scanned, confirm the login on your device..."),
        QrLoginStatus::Success => println!("Login successful!"),
        QrLoginStatus::Expired => println!("The login code expired."),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut answer = String::new();
    io::stdin().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

async fn logout(api: &ApiClient) -> Result<ExitCode> {
    api.logout().await;
    println!("Logged out.");
    Ok(ExitCode::SUCCESS)
}

fn status(api: &ApiClient, config: &Config) -> Result<ExitCode> {
    let session = api.session();
    println!("Backend:   {}", api.base_url());
    println!("Storage:   {:?}", config.session_backend);
    println!(
        "Logged in: {}",
        if session.is_logged_in() { "yes" } else { "no" }
    );
    Ok(ExitCode::SUCCESS)
}

async fn send_request(
    api: &ApiClient,
    method: &str,
    endpoint: &str,
    data: Option<&str>,
    skip_auth: bool,
    raw: bool,
) -> Result<ExitCode> {
    let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .with_context(|| format!("Invalid HTTP method: {}", method))?;
    let mut options = RequestOptions::new(method);
    if let Some(data) = data {
        let body = serde_json::from_str(data).context("--data is not valid JSON")?;
        options = options.body(body);
    }
    if skip_auth {
        options = options.skip_auth();
    }

    if raw {
        let response = api.request_raw(endpoint, options).await?;
        println!("{}", response.status);
        println!("{}", response.body);
        return Ok(if response.status.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let envelope: ApiEnvelope<serde_json::Value> = api.request(endpoint, options).await?;
    println!("{}", serde_json::to_string_pretty(&envelope)?);
    Ok(if envelope.success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
