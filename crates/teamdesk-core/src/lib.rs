//! Session layer for the teamdesk administration dashboard.
//!
//! - [`api`]: authenticated request pipeline with transparent token refresh
//! - [`auth`]: session storage, refresh coordination and QR-code login
//! - [`config`]: user configuration

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, RequestOptions, SessionError};
pub use auth::{SessionEvent, SessionManager};
pub use config::Config;
