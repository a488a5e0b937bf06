use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{broadcast, oneshot};
use tracing::{debug, error, info, warn};

use super::session::{SessionData, SessionStore};
use crate::api::{SessionError, TokenPair};

/// Capacity of the session event channel.
/// Events are rare (login, refresh, logout); 16 leaves room for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Notifications the session manager sends to its host environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A fresh session was established by a login flow.
    LoggedIn,
    /// The access token was refreshed and persisted.
    Refreshed,
    /// The user logged out on purpose.
    LoggedOut,
    /// The session ended because it could not be recovered. The host should
    /// send the user back to the login surface.
    Terminated { reason: SessionError },
}

type Waiter = oneshot::Sender<Result<String, SessionError>>;

#[derive(Default)]
struct RefreshState {
    in_progress: bool,
    pending: Vec<Waiter>,
}

/// Owns the session credential and coordinates token refresh.
///
/// At most one refresh runs at a time. Callers that need a new access token
/// while a refresh is in flight are queued and resolved with its outcome.
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    refresh: Mutex<RefreshState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            refresh: Mutex::new(RefreshState::default()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn access_token(&self) -> Option<String> {
        self.store.access_token()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.store.refresh_token()
    }

    pub fn is_logged_in(&self) -> bool {
        self.store.is_logged_in()
    }

    pub fn is_refreshing(&self) -> bool {
        self.state().in_progress
    }

    /// Number of callers waiting on the in-flight refresh.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    /// Store the first credential of a session (login).
    pub fn establish(&self, tokens: &TokenPair) -> anyhow::Result<()> {
        self.store.save(&SessionData {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            is_logged_in: true,
        })?;
        info!("Session established");
        self.emit(SessionEvent::LoggedIn);
        Ok(())
    }

    /// Explicit logout: clear every stored key.
    pub fn logout(&self) {
        self.clear_store();
        info!("Logged out");
        self.emit(SessionEvent::LoggedOut);
    }

    /// Obtain a new access token after a 401.
    ///
    /// The first caller becomes the refresh leader and runs `refresh` with the
    /// stored refresh token; concurrent callers wait for the leader's outcome.
    /// A failed refresh clears the session and emits
    /// [`SessionEvent::Terminated`] once.
    pub async fn refreshed_access_token<F, Fut>(&self, refresh: F) -> Result<String, SessionError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenPair, SessionError>>,
    {
        let waiter = {
            let mut state = self.state();
            if state.in_progress {
                let (tx, rx) = oneshot::channel();
                state.pending.push(tx);
                Some(rx)
            } else {
                state.in_progress = true;
                None
            }
        };

        if let Some(rx) = waiter {
            debug!("Refresh in progress, queueing request");
            return rx.await.unwrap_or(Err(SessionError::Abandoned));
        }

        let mut guard = RefreshGuard {
            manager: self,
            settled: false,
        };
        let outcome = self.run_refresh(refresh).await;
        guard.settle(&outcome);
        outcome
    }

    async fn run_refresh<F, Fut>(&self, refresh: F) -> Result<String, SessionError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<TokenPair, SessionError>>,
    {
        let Some(refresh_token) = self.store.refresh_token() else {
            warn!("No refresh token available, ending session");
            let err = SessionError::MissingRefreshToken;
            self.terminate(&err);
            return Err(err);
        };

        info!("Access token rejected, refreshing");
        let tokens = match refresh(refresh_token).await {
            Ok(tokens) => tokens,
            Err(err) => {
                error!(error = %err, "Token refresh failed");
                self.terminate(&err);
                return Err(err);
            }
        };

        let saved = self.store.save(&SessionData {
            access_token: tokens.access_token.clone(),
            refresh_token: tokens.refresh_token.clone(),
            is_logged_in: true,
        });
        if let Err(e) = saved {
            let err = SessionError::Storage(e.to_string());
            error!(error = %err, "Failed to persist refreshed tokens");
            self.terminate(&err);
            return Err(err);
        }

        info!("Access token refreshed");
        self.emit(SessionEvent::Refreshed);
        Ok(tokens.access_token)
    }

    /// Logout side effect for a fatal session error.
    fn terminate(&self, reason: &SessionError) {
        self.clear_store();
        self.emit(SessionEvent::Terminated {
            reason: reason.clone(),
        });
    }

    fn clear_store(&self) {
        if let Err(e) = self.store.clear() {
            error!(error = %e, "Failed to clear session store");
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine; the host may not listen.
        let _ = self.events.send(event);
    }

    fn state(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clear the in-progress flag and resolve every queued caller.
    fn settle(&self, outcome: &Result<String, SessionError>) {
        let pending = {
            let mut state = self.state();
            state.in_progress = false;
            std::mem::take(&mut state.pending)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "Resolving queued requests");
        }
        for waiter in pending {
            // A dropped receiver means that caller went away.
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// Releases the refresh flag even if the leader's future is dropped or panics.
struct RefreshGuard<'a> {
    manager: &'a SessionManager,
    settled: bool,
}

impl RefreshGuard<'_> {
    fn settle(&mut self, outcome: &Result<String, SessionError>) {
        self.settled = true;
        self.manager.settle(outcome);
    }
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            warn!("Token refresh abandoned, releasing queued requests");
            self.manager.settle(&Err(SessionError::Abandoned));
        }
    }
}
