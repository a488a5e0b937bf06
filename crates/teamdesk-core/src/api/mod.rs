//! REST API client module for the dashboard backend.
//!
//! This module provides the `ApiClient` request pipeline. Every endpoint
//! answers with the `{ success, code, message, data }` envelope and
//! authenticates with a short-lived bearer token that is refreshed
//! transparently on a 401.

pub mod client;
pub mod envelope;
pub mod error;
pub mod transport;

pub use client::{ApiClient, RequestOptions, LOGOUT_ENDPOINT, REFRESH_ENDPOINT};
pub use envelope::{ApiEnvelope, TokenPair};
pub use error::{ApiError, SessionError};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
