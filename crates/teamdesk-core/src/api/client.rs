//! API client for the dashboard REST backend.
//!
//! Every call goes through [`ApiClient::request_raw`], which attaches the
//! stored bearer token and recovers from an expired access token with one
//! coordinated refresh followed by a single retry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use reqwest::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, warn};

use super::envelope::{ApiEnvelope, RefreshRequest, TokenPair};
use super::transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
use super::{ApiError, SessionError};
use crate::auth::SessionManager;
use crate::config::Config;

// ============================================================================
// Constants
// ============================================================================

/// Endpoint that exchanges a refresh token for a new token pair
pub const REFRESH_ENDPOINT: &str = "/auth/refresh";

/// Endpoint that invalidates the session server-side
pub const LOGOUT_ENDPOINT: &str = "/auth/logout";

/// Per-call options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub body: Option<serde_json::Value>,
    pub headers: HeaderMap,
    /// Do not attach credentials and never attempt a refresh.
    pub skip_auth: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            body: None,
            headers: HeaderMap::new(),
            skip_auth: false,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn get() -> Self {
        Self::new(Method::GET)
    }

    pub fn post(body: serde_json::Value) -> Self {
        Self::new(Method::POST).body(body)
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn skip_auth(mut self) -> Self {
        self.skip_auth = true;
        self
    }
}

/// Whether a dispatch is the original call or its single post-refresh retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    First,
    Retry,
}

/// API client for the dashboard backend.
/// Clone is cheap - the transport and session manager are shared.
#[derive(Clone)]
pub struct ApiClient {
    base_url: Arc<str>,
    transport: Arc<dyn Transport>,
    session: Arc<SessionManager>,
}

impl ApiClient {
    /// Create a client using the configured base URL and a reqwest transport
    pub fn new(config: &Config, session: Arc<SessionManager>) -> Result<Self> {
        let transport = ReqwestTransport::new(Duration::from_secs(config.request_timeout_secs))?;
        Ok(Self::with_transport(
            &config.base_url,
            Arc::new(transport),
            session,
        ))
    }

    pub fn with_transport(
        base_url: &str,
        transport: Arc<dyn Transport>,
        session: Arc<SessionManager>,
    ) -> Self {
        Self {
            base_url: Arc::from(base_url.trim_end_matches('/')),
            transport,
            session,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Perform a call and parse the response envelope.
    ///
    /// Non-2xx statuses become errors; a 401 that survives the refresh cycle
    /// surfaces as [`ApiError::Unauthorized`].
    pub async fn request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<ApiEnvelope<T>, ApiError> {
        let response = self.request_raw(endpoint, options).await?;
        if !response.status.is_success() {
            return Err(ApiError::from_status(response.status, &response.body));
        }
        response.json()
    }

    /// Perform a call and return the response without interpreting it.
    pub async fn request_raw(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<HttpResponse, ApiError> {
        let token = if options.skip_auth {
            None
        } else {
            self.session.access_token()
        };
        let response = self
            .dispatch(endpoint, &options, token.as_deref(), Attempt::First)
            .await?;

        if !Self::should_refresh(&response, &options, Attempt::First) {
            return Ok(response);
        }

        let token = self
            .session
            .refreshed_access_token(|refresh_token| self.exchange_refresh_token(refresh_token))
            .await?;

        debug!(endpoint, "Retrying request with refreshed token");
        self.dispatch(endpoint, &options, Some(&token), Attempt::Retry)
            .await
    }

    /// GET and unwrap the envelope's data
    pub async fn get<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request::<T>(endpoint, RequestOptions::get())
            .await?
            .into_data()
    }

    /// POST a JSON body and unwrap the envelope's data
    pub async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        self.request::<T>(endpoint, RequestOptions::post(Self::to_json(body)?))
            .await?
            .into_data()
    }

    /// PUT a JSON body and unwrap the envelope's data
    pub async fn put<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, ApiError> {
        let options = RequestOptions::new(Method::PUT).body(Self::to_json(body)?);
        self.request::<T>(endpoint, options).await?.into_data()
    }

    /// DELETE and unwrap the envelope's data
    pub async fn delete<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        self.request::<T>(endpoint, RequestOptions::new(Method::DELETE))
            .await?
            .into_data()
    }

    /// Log out: tell the server (best effort), then clear the local session.
    pub async fn logout(&self) {
        if let Some(token) = self.session.access_token() {
            let options = RequestOptions::new(Method::POST);
            // Single attempt: an expired token must not trigger a refresh here
            match self
                .dispatch(LOGOUT_ENDPOINT, &options, Some(&token), Attempt::First)
                .await
            {
                Ok(response) if !response.status.is_success() => {
                    debug!(status = %response.status, "Server-side logout not acknowledged");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Server-side logout failed"),
            }
        }
        self.session.logout();
    }

    fn should_refresh(response: &HttpResponse, options: &RequestOptions, attempt: Attempt) -> bool {
        response.is_unauthorized() && !options.skip_auth && attempt == Attempt::First
    }

    async fn dispatch(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        token: Option<&str>,
        attempt: Attempt,
    ) -> Result<HttpResponse, ApiError> {
        let request = self.build_request(endpoint, options, token)?;
        debug!(
            method = %request.method,
            endpoint,
            retry = attempt == Attempt::Retry,
            "Sending request"
        );
        let response = self.transport.send(request).await?;
        debug!(status = %response.status, endpoint, "Received response");
        Ok(response)
    }

    fn build_request(
        &self,
        endpoint: &str,
        options: &RequestOptions,
        token: Option<&str>,
    ) -> Result<HttpRequest, ApiError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));
        if options.body.is_some() {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/json"),
            );
        }
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(token) = token.filter(|_| !options.skip_auth) {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
                ApiError::Internal(anyhow::anyhow!("Access token is not a valid header value"))
            })?;
            headers.insert(header::AUTHORIZATION, value);
        }

        Ok(HttpRequest {
            method: options.method.clone(),
            url: format!("{}{}", self.base_url, endpoint),
            headers,
            body: options.body.clone(),
        })
    }

    /// Call the refresh endpoint. Never recurses into the refresh logic.
    async fn exchange_refresh_token(&self, refresh_token: String) -> Result<TokenPair, SessionError> {
        let body = Self::to_json(&RefreshRequest {
            refresh_token: &refresh_token,
        })
        .map_err(|e| SessionError::RefreshFailed(e.to_string()))?;

        let options = RequestOptions::post(body).skip_auth();
        let response = self
            .dispatch(REFRESH_ENDPOINT, &options, None, Attempt::First)
            .await
            .map_err(|e| SessionError::RefreshFailed(e.to_string()))?;

        let parsed = response.json::<ApiEnvelope<TokenPair>>();
        if let Ok(ref envelope) = parsed {
            if !envelope.success {
                return Err(SessionError::RefreshRejected {
                    code: envelope.code,
                    message: envelope.message.clone(),
                });
            }
        }
        if !response.status.is_success() {
            let err = ApiError::from_status(response.status, &response.body);
            return Err(SessionError::RefreshFailed(err.to_string()));
        }
        parsed
            .and_then(ApiEnvelope::into_data)
            .map_err(|e| SessionError::RefreshFailed(e.to_string()))
    }

    fn to_json<B: Serialize>(body: &B) -> Result<serde_json::Value, ApiError> {
        serde_json::to_value(body)
            .map_err(|e| ApiError::Internal(anyhow::anyhow!("Failed to serialize body: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::future::{self, FutureExt};
    use reqwest::StatusCode;
    use serde_json::json;
    use tokio::sync::{oneshot, Notify};

    use super::*;
    use crate::api::transport::fake::{envelope, unauthorized, FakeTransport};
    use crate::auth::{MemorySessionStore, SessionData, SessionEvent, SessionStore};

    const BASE_URL: &str = "http://dashboard.test/api";

    fn store_with(access: &str, refresh: Option<&str>) -> Arc<MemorySessionStore> {
        Arc::new(MemorySessionStore::with_session(SessionData {
            access_token: access.to_string(),
            refresh_token: refresh.unwrap_or_default().to_string(),
            is_logged_in: true,
        }))
    }

    fn client(transport: Arc<FakeTransport>, store: Arc<MemorySessionStore>) -> ApiClient {
        ApiClient::with_transport(BASE_URL, transport, Arc::new(SessionManager::new(store)))
    }

    fn refreshed(access: &str, refresh: &str) -> HttpResponse {
        envelope(json!({ "access_token": access, "refresh_token": refresh, "token_type": "Bearer" }))
    }

    /// Backend where `A1` is expired and `/auth/refresh` mints `A2/R2` once
    /// `release` is notified.
    fn expiring_backend(release: Arc<Notify>) -> Arc<FakeTransport> {
        FakeTransport::new(move |request| {
            let release = release.clone();
            async move {
                if request.url.ends_with(REFRESH_ENDPOINT) {
                    release.notified().await;
                    return Ok(refreshed("A2", "R2"));
                }
                match request.bearer_token() {
                    Some("A2") => Ok(envelope(json!({ "url": request.url }))),
                    _ => Ok(unauthorized()),
                }
            }
            .boxed()
        })
    }

    async fn wait_until(cond: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !cond() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition never became true");
    }

    #[tokio::test]
    async fn test_attaches_bearer_and_parses_envelope() {
        let transport = FakeTransport::new(|_| future::ready(Ok(envelope(json!([1, 2, 3])))).boxed());
        let api = client(transport.clone(), store_with("A1", Some("R1")));

        let teams: Vec<u32> = api.get("/teams").await.unwrap();

        assert_eq!(teams, vec![1, 2, 3]);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].url, "http://dashboard.test/api/teams");
        assert_eq!(requests[0].bearer_token(), Some("A1"));
    }

    #[tokio::test]
    async fn test_single_refresh_for_concurrent_401s() {
        let release = Arc::new(Notify::new());
        let transport = expiring_backend(release.clone());
        let store = store_with("A1", Some("R1"));
        let api = client(transport.clone(), store.clone());

        let calls: Vec<_> = ["/teams", "/projects", "/tasks"]
            .into_iter()
            .map(|endpoint| {
                let api = api.clone();
                tokio::spawn(async move { api.get::<serde_json::Value>(endpoint).await })
            })
            .collect();

        wait_until(|| api.session().pending_count() == 2).await;
        release.notify_one();

        for call in calls {
            call.await.unwrap().unwrap();
        }

        assert_eq!(transport.count(REFRESH_ENDPOINT), 1);
        let refresh = transport
            .requests()
            .into_iter()
            .find(|r| r.url.ends_with(REFRESH_ENDPOINT))
            .unwrap();
        assert_eq!(refresh.body, Some(json!({ "refresh_token": "R1" })));
        assert_eq!(refresh.bearer_token(), None);

        for endpoint in ["/teams", "/projects", "/tasks"] {
            let tokens: Vec<_> = transport
                .requests()
                .into_iter()
                .filter(|r| r.url.ends_with(endpoint))
                .map(|r| r.bearer_token().map(str::to_string))
                .collect();
            assert_eq!(tokens, vec![Some("A1".to_string()), Some("A2".to_string())]);
        }

        let stored = store.load().unwrap().unwrap();
        assert_eq!(stored.access_token, "A2");
        assert_eq!(stored.refresh_token, "R2");
        assert!(!api.session().is_refreshing());
    }

    #[tokio::test]
    async fn test_failed_refresh_rejects_every_queued_request() {
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));
        let transport = FakeTransport::new(move |request| {
            let release_rx = release_rx.clone();
            async move {
                if request.url.ends_with(REFRESH_ENDPOINT) {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    return Ok(HttpResponse::new(
                        StatusCode::OK,
                        r#"{"success":false,"code":40102,"message":"refresh token expired","data":null}"#,
                    ));
                }
                Ok(unauthorized())
            }
            .boxed()
        });
        let store = store_with("A1", Some("R1"));
        let api = client(transport.clone(), store.clone());
        let mut events = api.session().subscribe();

        let calls: Vec<_> = ["/teams", "/projects", "/tasks"]
            .into_iter()
            .map(|endpoint| {
                let api = api.clone();
                tokio::spawn(async move { api.get::<serde_json::Value>(endpoint).await })
            })
            .collect();

        wait_until(|| api.session().pending_count() == 2).await;
        release_tx.send(()).unwrap();

        let expected = SessionError::RefreshRejected {
            code: 40102,
            message: "refresh token expired".to_string(),
        };
        for call in calls {
            match call.await.unwrap() {
                Err(ApiError::Session(err)) => assert_eq!(err, expected),
                other => panic!("expected session error, got {:?}", other),
            }
        }

        assert_eq!(transport.count(REFRESH_ENDPOINT), 1);
        assert!(store.load().unwrap().is_none());
        assert!(!api.session().is_refreshing());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated { reason: expected }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retry_that_gets_401_is_surfaced() {
        let transport = FakeTransport::new(|request| {
            let response = if request.url.ends_with(REFRESH_ENDPOINT) {
                refreshed("A2", "R2")
            } else {
                unauthorized()
            };
            future::ready(Ok(response)).boxed()
        });
        let api = client(transport.clone(), store_with("A1", Some("R1")));

        let result = api.get::<serde_json::Value>("/documents").await;

        assert!(matches!(result, Err(ApiError::Unauthorized)));
        assert_eq!(transport.count(REFRESH_ENDPOINT), 1);
        assert_eq!(transport.count("/documents"), 2);
    }

    #[tokio::test]
    async fn test_skip_auth_never_attaches_token_or_refreshes() {
        let transport = FakeTransport::new(|_| future::ready(Ok(unauthorized())).boxed());
        let api = client(transport.clone(), store_with("A1", Some("R1")));

        let response = api
            .request_raw("/public/ping", RequestOptions::get().skip_auth())
            .await
            .unwrap();

        assert_eq!(response.status, StatusCode::UNAUTHORIZED);
        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].bearer_token(), None);
        assert_eq!(transport.count(REFRESH_ENDPOINT), 0);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_logs_out_without_calling_refresh() {
        let transport = FakeTransport::new(|_| future::ready(Ok(unauthorized())).boxed());
        let store = store_with("A1", None);
        let api = client(transport.clone(), store.clone());
        let mut events = api.session().subscribe();

        let result = api.get::<serde_json::Value>("/users").await;

        assert!(matches!(
            result,
            Err(ApiError::Session(SessionError::MissingRefreshToken))
        ));
        assert_eq!(transport.count(REFRESH_ENDPOINT), 0);
        assert!(store.load().unwrap().is_none());
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Terminated {
                reason: SessionError::MissingRefreshToken
            }
        );
    }

    #[tokio::test]
    async fn test_refresh_flag_released_after_transport_error() {
        let refresh_calls = Arc::new(AtomicUsize::new(0));
        let transport = {
            let refresh_calls = refresh_calls.clone();
            FakeTransport::new(move |request| {
                let response = if request.url.ends_with(REFRESH_ENDPOINT) {
                    refresh_calls.fetch_add(1, Ordering::SeqCst);
                    Err(ApiError::Transport("connection reset".to_string()))
                } else {
                    Ok(unauthorized())
                };
                future::ready(response).boxed()
            })
        };
        let store = store_with("A1", Some("R1"));
        let api = client(transport, store.clone());

        let first = api.get::<serde_json::Value>("/teams").await;
        assert!(matches!(
            first,
            Err(ApiError::Session(SessionError::RefreshFailed(_)))
        ));
        assert!(!api.session().is_refreshing());

        // A new session arrives; the next 401 must start a fresh refresh
        store
            .save(&SessionData {
                access_token: "A1".to_string(),
                refresh_token: "R1".to_string(),
                is_logged_in: true,
            })
            .unwrap();
        let second = api.get::<serde_json::Value>("/teams").await;
        assert!(second.is_err());
        assert_eq!(refresh_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_non_auth_errors_propagate_untouched() {
        let transport = FakeTransport::new(|request| {
            let response = if request.url.ends_with("/teams/9") {
                Ok(HttpResponse::new(StatusCode::NOT_FOUND, "no such team"))
            } else {
                Err(ApiError::Transport("dns failure".to_string()))
            };
            future::ready(response).boxed()
        });
        let api = client(transport.clone(), store_with("A1", Some("R1")));

        assert!(matches!(
            api.get::<serde_json::Value>("/teams/9").await,
            Err(ApiError::NotFound(_))
        ));
        assert!(matches!(
            api.get::<serde_json::Value>("/teams").await,
            Err(ApiError::Transport(_))
        ));
        assert_eq!(transport.count(REFRESH_ENDPOINT), 0);
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_rejected_envelope_is_an_error() {
        let transport = FakeTransport::new(|_| {
            future::ready(Ok(HttpResponse::new(
                StatusCode::OK,
                r#"{"success":false,"code":1001,"message":"name taken","data":null}"#,
            )))
            .boxed()
        });
        let api = client(transport, store_with("A1", Some("R1")));

        let result = api
            .post::<serde_json::Value, _>("/teams", &json!({ "name": "core" }))
            .await;

        match result {
            Err(ApiError::Rejected { code, message }) => {
                assert_eq!(code, 1001);
                assert_eq!(message, "name taken");
            }
            other => panic!("expected rejection, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_logout_notifies_server_and_clears_session() {
        let transport = FakeTransport::new(|_| future::ready(Ok(unauthorized())).boxed());
        let store = store_with("A1", Some("R1"));
        let api = client(transport.clone(), store.clone());
        let mut events = api.session().subscribe();

        api.logout().await;

        assert_eq!(transport.count(LOGOUT_ENDPOINT), 1);
        assert_eq!(transport.count(REFRESH_ENDPOINT), 0);
        assert!(store.load().unwrap().is_none());
        assert_eq!(events.try_recv().unwrap(), SessionEvent::LoggedOut);
    }

    #[test]
    fn test_build_request_headers() {
        let transport = FakeTransport::new(|_| future::ready(Ok(unauthorized())).boxed());
        let api = client(transport, store_with("A1", Some("R1")));
        let options = RequestOptions::post(json!({ "title": "Q3 plan" })).header(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_static("abc"),
        );

        let request = api.build_request("/tasks", &options, Some("A1")).unwrap();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.bearer_token(), Some("A1"));
        assert_eq!(request.headers["content-type"], "application/json");
        assert_eq!(request.headers["x-request-id"], "abc");

        let anonymous = api
            .build_request("/tasks", &options.clone().skip_auth(), Some("A1"))
            .unwrap();
        assert_eq!(anonymous.bearer_token(), None);
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let transport = FakeTransport::new(|_| future::ready(Ok(unauthorized())).boxed());
        let api = ApiClient::with_transport(
            "http://dashboard.test/api/",
            transport,
            Arc::new(SessionManager::new(Arc::new(MemorySessionStore::new()))),
        );
        let request = api
            .build_request("/teams", &RequestOptions::get(), None)
            .unwrap();
        assert_eq!(request.url, "http://dashboard.test/api/teams");
    }
}
