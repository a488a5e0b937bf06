//! Authentication module for managing the user session.
//!
//! This module provides:
//! - `SessionStore`: persisted access/refresh tokens (file, keychain, memory)
//! - `SessionManager`: single-flight token refresh and session events
//! - `QrLogin`: QR-code login handshake that creates the first session

pub mod credentials;
pub mod manager;
pub mod qr_login;
pub mod session;

pub use credentials::KeyringSessionStore;
pub use manager::{SessionEvent, SessionManager};
pub use qr_login::{QrLogin, QrLoginStatus, QrTicket};
pub use session::{FileSessionStore, MemorySessionStore, SessionData, SessionStore};
