//! HTTP transport seam.
//!
//! The request pipeline only needs "send this request, give me the status and
//! body". Keeping that behind a trait lets the pipeline run over `reqwest` in
//! production and over a scripted transport in tests.

use std::time::Duration;

use anyhow::Context;
use futures::future::BoxFuture;
use reqwest::{header::HeaderMap, Client, Method, StatusCode};
use serde::de::DeserializeOwned;

use super::ApiError;

/// A fully resolved outgoing request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
}

impl HttpRequest {
    /// The bearer token carried by this request, if any.
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(reqwest::header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
    }
}

/// A response with its body already read.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Parse the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ApiError::InvalidResponse(format!("Failed to parse JSON body: {}", e)))
    }
}

pub trait Transport: Send + Sync {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>>;
}

/// Transport backed by a shared `reqwest::Client`.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, ApiError> {
        let mut builder = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers);
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
        Box::pin(self.execute(request))
    }
}

/// Scripted transport for unit tests: every request is recorded and answered
/// by a handler closure.
#[cfg(test)]
pub(crate) mod fake {
    use std::sync::{Arc, Mutex};

    use super::*;

    type Handler =
        dyn Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, ApiError>> + Send + Sync;

    pub(crate) struct FakeTransport {
        requests: Mutex<Vec<HttpRequest>>,
        handler: Box<Handler>,
    }

    impl FakeTransport {
        pub(crate) fn new<F>(handler: F) -> Arc<Self>
        where
            F: Fn(HttpRequest) -> BoxFuture<'static, Result<HttpResponse, ApiError>>
                + Send
                + Sync
                + 'static,
        {
            Arc::new(Self {
                requests: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            })
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, path: &str) -> usize {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.url.ends_with(path))
                .count()
        }
    }

    impl Transport for FakeTransport {
        fn send(&self, request: HttpRequest) -> BoxFuture<'_, Result<HttpResponse, ApiError>> {
            self.requests.lock().unwrap().push(request.clone());
            (self.handler)(request)
        }
    }

    pub(crate) fn envelope(data: serde_json::Value) -> HttpResponse {
        HttpResponse::new(
            StatusCode::OK,
            serde_json::json!({ "success": true, "code": 0, "message": "ok", "data": data })
                .to_string(),
        )
    }

    pub(crate) fn unauthorized() -> HttpResponse {
        HttpResponse::new(
            StatusCode::UNAUTHORIZED,
            r#"{"success":false,"code":401,"message":"token expired","data":null}"#,
        )
    }
}
