//! QR-code login handshake.
//!
//! The server issues a code that the user scans with an already signed-in
//! device. The client polls the code's status until the scan is confirmed
//! (the server then hands out a one-time login grant that is exchanged for the
//! first token pair) or the code expires.

use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, RequestOptions, TokenPair};
use crate::config::Config;

/// Endpoint that issues a new QR login code
pub const QR_CODE_ENDPOINT: &str = "/auth/qrcode";

/// Endpoint that trades a login grant for a token pair
pub const QR_EXCHANGE_ENDPOINT: &str = "/auth/qrcode/exchange";

/// Shortest allowed status poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum QrLoginStatus {
    /// Code displayed, not scanned yet
    Pending,
    /// Scanned, waiting for the user to confirm on the device
    Scanned,
    Success,
    Expired,
}

impl QrLoginStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, QrLoginStatus::Success | QrLoginStatus::Expired)
    }

    fn can_advance_to(self, next: QrLoginStatus) -> bool {
        use QrLoginStatus::*;
        matches!(
            (self, next),
            (Pending, Scanned | Success | Expired) | (Scanned, Success | Expired)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct QrTicket {
    pub code_id: String,
    /// Content to render as the QR image
    pub qr_url: String,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct QrStatusResponse {
    status: QrLoginStatus,
    #[serde(default)]
    login_grant: Option<String>,
}

pub struct QrLogin {
    client: ApiClient,
    poll_interval: Duration,
    timeout: Duration,
    ticket: Option<QrTicket>,
    status: QrLoginStatus,
}

impl QrLogin {
    /// `poll_interval` is raised to [`MIN_POLL_INTERVAL`] if shorter.
    pub fn new(client: ApiClient, poll_interval: Duration, timeout: Duration) -> Self {
        Self {
            client,
            poll_interval: poll_interval.max(MIN_POLL_INTERVAL),
            timeout,
            ticket: None,
            status: QrLoginStatus::Pending,
        }
    }

    pub fn from_config(client: ApiClient, config: &Config) -> Self {
        Self::new(client, config.qr_poll_interval(), config.qr_login_timeout())
    }

    pub fn status(&self) -> QrLoginStatus {
        self.status
    }

    pub fn ticket(&self) -> Option<&QrTicket> {
        self.ticket.as_ref()
    }

    /// Request a new code and return to `Pending`.
    pub async fn generate(&mut self) -> Result<QrTicket, ApiError> {
        let ticket: QrTicket = self
            .client
            .request::<QrTicket>(QR_CODE_ENDPOINT, RequestOptions::new(Method::POST).skip_auth())
            .await?
            .into_data()?;
        info!(code_id = %ticket.code_id, "QR login code issued");
        self.ticket = Some(ticket.clone());
        self.status = QrLoginStatus::Pending;
        Ok(ticket)
    }

    /// Replace an expired (or abandoned) code with a fresh one.
    pub async fn regenerate(&mut self) -> Result<QrTicket, ApiError> {
        self.generate().await
    }

    /// Poll until the login succeeds or the code expires.
    ///
    /// `on_status` sees every forward transition. Polling stops for good once
    /// a terminal state is reached; call [`QrLogin::regenerate`] to start over.
    /// Dropping the returned future stops polling as well.
    pub async fn wait<F>(&mut self, mut on_status: F) -> Result<QrLoginStatus, ApiError>
    where
        F: FnMut(QrLoginStatus),
    {
        let code_id = match self.ticket {
            Some(ref ticket) if !self.status.is_terminal() => ticket.code_id.clone(),
            Some(_) => return Ok(self.status),
            None => {
                return Err(ApiError::Internal(anyhow::anyhow!(
                    "No QR code has been generated"
                )))
            }
        };

        let deadline = time::sleep(self.timeout);
        tokio::pin!(deadline);
        let mut ticker = time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // The deadline also cuts short a poll (or grant exchange) in flight
            let polled = tokio::select! {
                biased;
                _ = &mut deadline => None,
                _ = ticker.tick() => {
                    tokio::select! {
                        biased;
                        _ = &mut deadline => None,
                        polled = self.poll_once(&code_id, &mut on_status) => Some(polled?),
                    }
                }
            };

            match polled {
                Some(Some(done)) => return Ok(done),
                Some(None) => {}
                None => {
                    info!(code_id = %code_id, "QR login timed out");
                    self.advance(QrLoginStatus::Expired, &mut on_status);
                    return Ok(QrLoginStatus::Expired);
                }
            }
        }
    }

    /// One status poll. Returns the terminal state once reached.
    async fn poll_once<F>(
        &mut self,
        code_id: &str,
        on_status: &mut F,
    ) -> Result<Option<QrLoginStatus>, ApiError>
    where
        F: FnMut(QrLoginStatus),
    {
        let endpoint = format!("{}/{}/status", QR_CODE_ENDPOINT, code_id);
        let response: QrStatusResponse = match self
            .client
            .request::<QrStatusResponse>(&endpoint, RequestOptions::get().skip_auth())
            .await
            .and_then(|envelope| envelope.into_data())
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "QR status poll failed, will retry");
                return Ok(None);
            }
        };
        debug!(status = ?response.status, "QR status polled");

        match response.status {
            QrLoginStatus::Success => {
                let Some(grant) = response.login_grant else {
                    self.advance(QrLoginStatus::Expired, on_status);
                    return Err(ApiError::InvalidResponse(
                        "QR login succeeded without a login grant".to_string(),
                    ));
                };
                if let Err(e) = self.exchange(code_id, &grant).await {
                    // The grant is single-use; a new code is needed
                    self.advance(QrLoginStatus::Expired, on_status);
                    return Err(e);
                }
                self.advance(QrLoginStatus::Success, on_status);
                Ok(Some(QrLoginStatus::Success))
            }
            QrLoginStatus::Expired => {
                info!(code_id, "QR code expired");
                self.advance(QrLoginStatus::Expired, on_status);
                Ok(Some(QrLoginStatus::Expired))
            }
            status => {
                self.advance(status, on_status);
                Ok(None)
            }
        }
    }

    async fn exchange(&self, code_id: &str, grant: &str) -> Result<(), ApiError> {
        let body = json!({ "code_id": code_id, "login_grant": grant });
        let tokens: TokenPair = self
            .client
            .request::<TokenPair>(QR_EXCHANGE_ENDPOINT, RequestOptions::post(body).skip_auth())
            .await?
            .into_data()?;
        self.client.session().establish(&tokens)?;
        info!("QR login completed");
        Ok(())
    }

    fn advance<F>(&mut self, next: QrLoginStatus, on_status: &mut F)
    where
        F: FnMut(QrLoginStatus),
    {
        if self.status.can_advance_to(next) {
            self.status = next;
            on_status(next);
        } else if self.status != next {
            debug!(from = ?self.status, to = ?next, "Ignoring backwards QR status");
        }
    }
}
