use anyhow::{Context, Result};
use keyring::Entry;
use tracing::warn;

use super::session::{
    SessionData, SessionStore, ACCESS_TOKEN_KEY, LOGGED_IN_KEY, REFRESH_TOKEN_KEY,
};

const SERVICE_NAME: &str = "teamdesk";

/// Session stored in the OS keychain, one entry per fixed key.
///
/// The keychain has no multi-entry transaction, so a failed `save` clears
/// every key rather than leave a new access token next to a stale refresh
/// token.
pub struct KeyringSessionStore {
    access_token: Entry,
    refresh_token: Entry,
    logged_in: Entry,
}

impl KeyringSessionStore {
    pub fn new() -> Result<Self> {
        Self::with_service(SERVICE_NAME)
    }

    pub fn with_service(service: &str) -> Result<Self> {
        Ok(Self {
            access_token: Self::entry(service, ACCESS_TOKEN_KEY)?,
            refresh_token: Self::entry(service, REFRESH_TOKEN_KEY)?,
            logged_in: Self::entry(service, LOGGED_IN_KEY)?,
        })
    }

    fn entry(service: &str, key: &str) -> Result<Entry> {
        Entry::new(service, key)
            .with_context(|| format!("Failed to create keyring entry for {}", key))
    }

    fn get(entry: &Entry, key: &str) -> Result<Option<String>> {
        match entry.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read {} from keychain", key)),
        }
    }

    fn set(entry: &Entry, key: &str, value: &str) -> Result<()> {
        entry
            .set_password(value)
            .with_context(|| format!("Failed to store {} in keychain", key))
    }

    fn delete(entry: &Entry, key: &str) -> Result<()> {
        match entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {} from keychain", key)),
        }
    }

    fn write_all(&self, data: &SessionData) -> Result<()> {
        Self::set(&self.access_token, ACCESS_TOKEN_KEY, &data.access_token)?;
        Self::set(&self.refresh_token, REFRESH_TOKEN_KEY, &data.refresh_token)?;
        Self::set(
            &self.logged_in,
            LOGGED_IN_KEY,
            if data.is_logged_in { "true" } else { "false" },
        )
    }
}

impl SessionStore for KeyringSessionStore {
    fn load(&self) -> Result<Option<SessionData>> {
        let access_token = Self::get(&self.access_token, ACCESS_TOKEN_KEY)?;
        let refresh_token = Self::get(&self.refresh_token, REFRESH_TOKEN_KEY)?;
        let is_logged_in =
            Self::get(&self.logged_in, LOGGED_IN_KEY)?.as_deref() == Some("true");

        match (access_token, refresh_token) {
            (Some(access_token), Some(refresh_token)) => Ok(Some(SessionData {
                access_token,
                refresh_token,
                is_logged_in,
            })),
            _ => Ok(None),
        }
    }

    fn save(&self, data: &SessionData) -> Result<()> {
        let written = self.write_all(data);
        if written.is_err() {
            if let Err(e) = self.clear() {
                warn!(error = %e, "Failed to roll back partial keychain write");
            }
        }
        written
    }

    fn clear(&self) -> Result<()> {
        // Attempt every key even if one fails
        let results = [
            Self::delete(&self.access_token, ACCESS_TOKEN_KEY),
            Self::delete(&self.refresh_token, REFRESH_TOKEN_KEY),
            Self::delete(&self.logged_in, LOGGED_IN_KEY),
        ];
        results.into_iter().collect()
    }
}
