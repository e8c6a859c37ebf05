//! Authenticated HTTP client for the PortfolioOS API.
//!
//! Every outbound request is authenticated from the current credential
//! snapshot at send time, so a request issued after a renewal always carries
//! the new token. On an expired-authentication response the client retries
//! exactly once, after coordinating renewal through [`RefreshCoordinator`];
//! every other failure class passes through classified but untouched.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ApiError;
use crate::refresh::{RefreshCoordinator, UnrecoverableFn};
use crate::store::{CredentialStore, mask_token};

/// Header carrying the active organization slug. Tenant-scoped endpoints
/// treat its absence as "no org", never as "all orgs".
pub const ORG_HEADER: &str = "X-Org-Slug";

/// Default bound on the renewal operation.
pub const DEFAULT_RENEW_TIMEOUT: Duration = Duration::from_secs(15);

/// API endpoint paths, relative to the `api/v1/` base.
pub mod endpoints {
    /// Credential exchange (login).
    pub const LOGIN: &str = "auth/token/";
    /// Access-token renewal.
    pub const REFRESH: &str = "auth/token/refresh/";
    /// Account registration.
    pub const REGISTER: &str = "auth/register/";
    /// Identity + memberships for the authenticated user.
    pub const ME: &str = "auth/me/";
}

/// Paths whose 401s are returned to the caller untouched. Routing them
/// through renewal would recurse (a rejected refresh call triggering another
/// refresh call). The identity endpoint is deliberately absent: a 401 from
/// `auth/me/` goes through renewal, so hydrating with an expired access token
/// but a live refresh token still succeeds.
const EXEMPT_PATHS: [&str; 3] = [endpoints::LOGIN, endpoints::REFRESH, endpoints::REGISTER];

fn is_exempt(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    EXEMPT_PATHS.contains(&path)
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL up to and including the API version, e.g.
    /// `https://api.example.com/api/v1`.
    pub base_url: String,
    /// Bound on the token renewal operation. A renewal that exceeds it is
    /// treated as failed and cascades to logout.
    pub renew_timeout: Duration,
}

impl ClientConfig {
    /// Creates a config with the default renewal timeout.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            renew_timeout: DEFAULT_RENEW_TIMEOUT,
        }
    }
}

/// Description of an outbound API call. Kept rebuildable so the retry after
/// renewal constructs a fresh request from the updated credential snapshot.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
}

impl ApiRequest {
    /// A GET request for `path` (relative to the base URL).
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            query: Vec::new(),
            body: None,
        }
    }

    /// A POST request with a JSON body.
    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            query: Vec::new(),
            body: Some(body),
        }
    }

    /// Appends a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// The request path, relative to the base URL.
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// Token pair returned by the login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenPair {
    pub access: String,
    pub refresh: String,
}

/// Renewal response. Rotation is enabled server-side, so `refresh` is
/// normally present; tolerate its absence for backends that disable it.
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    #[serde(default)]
    refresh: Option<String>,
}

/// One org membership held by the authenticated user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub org_id: String,
    pub org_name: String,
    pub org_slug: String,
    pub role: String,
}

/// The authenticated user's identity, replaced wholesale on each successful
/// fetch and destroyed on logout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub account_status: Option<String>,
    #[serde(default)]
    pub memberships: Vec<Membership>,
}

/// Registration payload.
#[derive(Debug, Clone, Serialize)]
pub struct RegisterPayload {
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
}

/// Authenticated API client.
///
/// Owns the shared `reqwest::Client` and the renewal coordinator. The logout
/// cascade is injected at construction; there is no registration step a
/// request could race.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    store: Arc<dyn CredentialStore>,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    /// Creates a client.
    ///
    /// `on_unrecoverable` runs exactly once per failed renewal batch; the
    /// session layer wires its logout here so an unrecoverable 401 anywhere
    /// cascades to a full sign-out.
    pub fn new(
        config: ClientConfig,
        store: Arc<dyn CredentialStore>,
        on_unrecoverable: UnrecoverableFn,
    ) -> Self {
        let http = reqwest::Client::new();
        let base_url = config.base_url.trim_end_matches('/').to_string();

        let renew: crate::refresh::RenewFn = {
            let http = http.clone();
            let base_url = base_url.clone();
            let store = Arc::clone(&store);
            Box::new(move || {
                let http = http.clone();
                let base_url = base_url.clone();
                let store = Arc::clone(&store);
                Box::pin(async move { renew_tokens(&http, &base_url, store.as_ref()).await })
            })
        };

        Self {
            http,
            base_url,
            store,
            refresh: RefreshCoordinator::new(config.renew_timeout, renew, on_unrecoverable),
        }
    }

    /// The credential store backing this client.
    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    /// Executes a request, transparently renewing authentication once.
    ///
    /// A non-exempt 401 marks the request as retried, coordinates renewal
    /// (single-flight across concurrent failures), and replays the request
    /// from a fresh credential snapshot exactly once. A second 401 surfaces
    /// as `Unauthorized`; a failed renewal surfaces as `SessionExpired` — the
    /// renewal error, not the original 401.
    pub async fn execute(&self, request: &ApiRequest) -> Result<Value, ApiError> {
        let response = self.dispatch(request).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED && !is_exempt(&request.path) {
            debug!(path = %request.path, "authentication expired; coordinating renewal");
            self.refresh.renewed_access().await?;
            let replay = self.dispatch(request).await?;
            return Self::into_json(replay).await;
        }

        Self::into_json(response).await
    }

    /// Convenience GET returning parsed JSON.
    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Value, ApiError> {
        let mut request = ApiRequest::get(path);
        for (key, value) in query {
            request = request.query(*key, *value);
        }
        self.execute(&request).await
    }

    /// Convenience POST returning parsed JSON.
    pub async fn post_json(&self, path: &str, body: Value) -> Result<Value, ApiError> {
        self.execute(&ApiRequest::post(path, body)).await
    }

    /// Exchanges credentials for a token pair. Does not persist them — that
    /// decision belongs to the session layer.
    pub async fn login(&self, email: &str, password: &str) -> Result<TokenPair, ApiError> {
        let body = serde_json::json!({ "email": email, "password": password });
        let value = self.execute(&ApiRequest::post(endpoints::LOGIN, body)).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::parse(format!("malformed token response: {e}")))
    }

    /// Registers a new account. Backend validation errors pass through
    /// verbatim for form rendering.
    pub async fn register(&self, payload: &RegisterPayload) -> Result<(), ApiError> {
        let body = serde_json::to_value(payload)
            .map_err(|e| ApiError::parse(format!("unserializable payload: {e}")))?;
        self.execute(&ApiRequest::post(endpoints::REGISTER, body)).await?;
        Ok(())
    }

    /// Fetches the authenticated identity and memberships.
    pub async fn me(&self) -> Result<Identity, ApiError> {
        let value = self.execute(&ApiRequest::get(endpoints::ME)).await?;
        serde_json::from_value(value)
            .map_err(|e| ApiError::parse(format!("malformed identity response: {e}")))
    }

    /// Builds and sends one attempt, attaching `Authorization` and the org
    /// header from the store snapshot taken now — never one captured earlier.
    async fn dispatch(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        let url = format!("{}/{}", self.base_url, request.path.trim_start_matches('/'));
        let mut builder = self.http.request(request.method.clone(), &url);

        if let Some(access) = self.store.access() {
            builder = builder.bearer_auth(access);
        }
        if let Some(slug) = self.store.tenant() {
            builder = builder.header(ORG_HEADER, slug);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        builder.send().await.map_err(|e| ApiError::from_transport(&e))
    }

    async fn into_json(response: reqwest::Response) -> Result<Value, ApiError> {
        let status = response.status();
        let body = response.text().await.map_err(|e| ApiError::from_transport(&e))?;

        if !status.is_success() {
            return Err(ApiError::from_status(status.as_u16(), &body));
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| ApiError::parse(format!("invalid JSON body: {e}")))
    }
}

/// The renewal operation handed to the coordinator: posts the stored refresh
/// token and persists the rotated pair before anyone is released to retry.
async fn renew_tokens(
    http: &reqwest::Client,
    base_url: &str,
    store: &dyn CredentialStore,
) -> Result<String, ApiError> {
    let Some(refresh) = store.refresh_token() else {
        return Err(ApiError::new(
            crate::error::ApiErrorKind::Unauthorized,
            "no refresh token available",
        ));
    };

    let url = format!("{}/{}", base_url, endpoints::REFRESH);
    let response = http
        .post(&url)
        .json(&serde_json::json!({ "refresh": refresh }))
        .send()
        .await
        .map_err(|e| ApiError::from_transport(&e))?;

    let status = response.status();
    let body = response.text().await.map_err(|e| ApiError::from_transport(&e))?;
    if !status.is_success() {
        return Err(ApiError::from_status(status.as_u16(), &body));
    }

    let parsed: RefreshResponse = serde_json::from_str(&body)
        .map_err(|e| ApiError::parse(format!("malformed refresh response: {e}")))?;

    // Rotation returns a new pair; persist both so the blacklisted refresh
    // token is never reused.
    match &parsed.refresh {
        Some(rotated) => store.set_tokens(&parsed.access, rotated),
        None => store.set_access(&parsed.access),
    }
    debug!(access = %mask_token(&parsed.access), "renewed access token");

    Ok(parsed.access)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Test: exemption covers exactly the recursion-prone auth endpoints.
    #[test]
    fn test_exempt_paths() {
        assert!(is_exempt("auth/token/"));
        assert!(is_exempt("/auth/token/refresh/"));
        assert!(is_exempt("auth/register/"));
        assert!(!is_exempt("auth/me/"));
        assert!(!is_exempt("buildings/"));
    }

    /// Test: request builder accumulates query parameters.
    #[test]
    fn test_request_builder() {
        let request = ApiRequest::get("buildings/").query("page", "2").query("org", "acme");
        assert_eq!(request.path(), "buildings/");
        assert_eq!(request.query.len(), 2);
        assert!(request.body.is_none());
    }

    /// Test: identity deserializes the backend's membership shape.
    #[test]
    fn test_identity_shape() {
        let raw = serde_json::json!({
            "id": 7,
            "email": "owner@acme.test",
            "first_name": "Ada",
            "last_name": "Lovelace",
            "account_status": "active",
            "memberships": [
                {"org_id": "11", "org_name": "Acme", "org_slug": "acme", "role": "owner"}
            ]
        });
        let identity: Identity = serde_json::from_value(raw).unwrap();
        assert_eq!(identity.memberships.len(), 1);
        assert_eq!(identity.memberships[0].org_slug, "acme");
    }

    /// Test: a minimal identity (no memberships field) still parses.
    #[test]
    fn test_identity_defaults() {
        let raw = serde_json::json!({"id": 1, "email": "a@b.test"});
        let identity: Identity = serde_json::from_value(raw).unwrap();
        assert!(identity.memberships.is_empty());
        assert!(identity.account_status.is_none());
    }
}
