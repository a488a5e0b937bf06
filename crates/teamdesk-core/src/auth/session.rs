use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Session file name in cache directory
const SESSION_FILE: &str = "session.json";

/// Fixed storage keys for the persisted session.
pub const ACCESS_TOKEN_KEY: &str = "access_token";
pub const REFRESH_TOKEN_KEY: &str = "refresh_token";
pub const LOGGED_IN_KEY: &str = "is_logged_in";

/// The persisted session credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub access_token: String,
    pub refresh_token: String,
    pub is_logged_in: bool,
}

/// Persistent storage for the session credential.
///
/// Both tokens are written together by `save`; `clear` removes every key.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> Result<Option<SessionData>>;

    fn save(&self, data: &SessionData) -> Result<()>;

    fn clear(&self) -> Result<()>;

    fn access_token(&self) -> Option<String> {
        self.load_or_log().map(|d| d.access_token)
    }

    fn refresh_token(&self) -> Option<String> {
        self.load_or_log()
            .map(|d| d.refresh_token)
            .filter(|t| !t.is_empty())
    }

    fn is_logged_in(&self) -> bool {
        self.load_or_log().map(|d| d.is_logged_in).unwrap_or(false)
    }

    /// Load, treating an unreadable store as "no session".
    fn load_or_log(&self) -> Option<SessionData> {
        match self.load() {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to load session");
                None
            }
        }
    }
}

/// Session persisted as JSON in the cache directory.
pub struct FileSessionStore {
    cache_dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self { cache_dir }
    }

    fn session_path(&self) -> PathBuf {
        self.cache_dir.join(SESSION_FILE)
    }
}

impl SessionStore for FileSessionStore {
    fn load(&self) -> Result<Option<SessionData>> {
        let path = self.session_path();
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).context("Failed to read session file")?;
        let data: SessionData =
            serde_json::from_str(&contents).context("Failed to parse session file")?;
        Ok(Some(data))
    }

    fn save(&self, data: &SessionData) -> Result<()> {
        let path = self.session_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(data)?;
        // Write-then-rename so readers never see a half-written token pair
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, contents).context("Failed to write session file")?;
        std::fs::rename(&tmp, &path).context("Failed to replace session file")?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let path = self.session_path();
        if path.exists() {
            std::fs::remove_file(path).context("Failed to remove session file")?;
        }
        Ok(())
    }
}

/// In-process session storage.
#[derive(Default)]
pub struct MemorySessionStore {
    data: Mutex<Option<SessionData>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(data: SessionData) -> Self {
        Self {
            data: Mutex::new(Some(data)),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load(&self) -> Result<Option<SessionData>> {
        Ok(self.data.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn save(&self, data: &SessionData) -> Result<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = Some(data.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.data.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}
