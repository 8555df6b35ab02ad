//! Supabase auth client and the identity seen by the sync engine.

mod oauth;

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub use oauth::{authorize_url, parse_oauth_callback, OAuthBridge, OAuthStart, PkcePair};

use crate::config::has_http_scheme;
use crate::sync::{AuthEvent, IdentityProvider};

const EXPIRY_SKEW_SECONDS: i64 = 60;
const AUTH_EVENT_CAPACITY: usize = 16;
const MAX_ERROR_EXCERPT: usize = 180;

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: i64,
    pub user: AuthUser,
}

impl AuthSession {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= now_secs() + EXPIRY_SKEW_SECONDS
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Supabase auth is not configured for this build.")]
    NotConfigured,
    #[error("Not signed in")]
    NotSignedIn,
    #[error("Invalid auth configuration: {0}")]
    InvalidConfiguration(&'static str),
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Failed to parse JSON payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Auth API error: {0}")]
    Api(String),
    /// 5xx, 408 or 429 from the auth API
    #[error("Auth API unavailable: {0}")]
    Unavailable(String),
    #[error("OAuth sign-in failed: {0}")]
    OAuth(String),
    #[error("Secure storage error: {0}")]
    SecureStorage(String),
}

impl AuthError {
    /// Failures that say nothing about whether the session is still valid.
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Http(_) | Self::Unavailable(_))
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

pub trait SessionPersistence: Clone + Send + Sync + 'static {
    fn load_session(&self) -> AuthResult<Option<AuthSession>>;
    fn save_session(&self, session: &AuthSession) -> AuthResult<()>;
    fn clear_session(&self) -> AuthResult<()>;
}

/// Process-local session storage.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    session: Arc<Mutex<Option<AuthSession>>>,
}

impl SessionPersistence for InMemorySessionStore {
    fn load_session(&self) -> AuthResult<Option<AuthSession>> {
        Ok(self
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save_session(&self, session: &AuthSession) -> AuthResult<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
        Ok(())
    }

    fn clear_session(&self) -> AuthResult<()> {
        *self.session.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Bearer token for calls made on behalf of the signed-in user.
#[async_trait]
pub trait AccessTokenSource: Send + Sync {
    async fn access_token(&self) -> AuthResult<String>;
}

#[derive(Clone)]
pub struct SupabaseAuthClient<S: SessionPersistence> {
    auth_url: String,
    anon_key: String,
    client: Client,
    store: S,
    events: broadcast::Sender<AuthEvent>,
}

impl<S: SessionPersistence> SupabaseAuthClient<S> {
    pub fn new(url: impl AsRef<str>, anon_key: impl Into<String>, store: S) -> AuthResult<Self> {
        let auth_url = normalize_auth_url(url.as_ref())?;
        let anon_key = anon_key.into().trim().to_string();
        if anon_key.is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "Supabase anon key must not be empty",
            ));
        }

        let (events, _) = broadcast::channel(AUTH_EVENT_CAPACITY);
        Ok(Self {
            auth_url,
            anon_key,
            client: Client::builder().build()?,
            store,
            events,
        })
    }

    pub fn auth_url(&self) -> &str {
        &self.auth_url
    }

    pub fn anon_key(&self) -> &str {
        &self.anon_key
    }

    /// Load the persisted session, refreshing it when expired.
    ///
    /// A refresh rejected by the server signs the user out. A refresh that
    /// fails in transit, or meets a 5xx/408/429, keeps the stale session so
    /// offline devices stay signed in.
    pub async fn restore_session(&self) -> AuthResult<Option<AuthSession>> {
        let Some(stored_session) = self.store.load_session()? else {
            return Ok(None);
        };

        if !stored_session.is_expired() {
            return Ok(Some(stored_session));
        }

        match self.refresh_session(&stored_session.refresh_token).await {
            Ok(refreshed) => Ok(Some(refreshed)),
            Err(error) if error.is_transient() => {
                tracing::warn!("Session refresh unavailable, keeping stored session: {}", error);
                Ok(Some(stored_session))
            }
            Err(error) => {
                tracing::warn!("Failed to refresh persisted session: {}", error);
                self.store.clear_session()?;
                self.emit(AuthEvent::SignedOut);
                Ok(None)
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> AuthResult<AuthSession> {
        validate_credentials(email, password)?;

        let payload = serde_json::json!({
            "email": email,
            "password": password,
        });
        let request = self.public_request(
            self.client
                .post(format!("{}/token", self.auth_url))
                .query(&[("grant_type", "password")])
                .json(&payload),
        );

        let response = self.send_auth_request(request).await?;
        let session = response.into_session()?.ok_or_else(|| {
            AuthError::Api("Sign-in response did not include an active session".to_string())
        })?;

        self.store_signed_in(session)
    }

    /// Exchange an OAuth authorization code (PKCE flow) for a session.
    pub async fn exchange_code_for_session(
        &self,
        auth_code: &str,
        code_verifier: &str,
    ) -> AuthResult<AuthSession> {
        if auth_code.trim().is_empty() {
            return Err(AuthError::OAuth(
                "authorization code must not be empty".to_string(),
            ));
        }

        let payload = serde_json::json!({
            "auth_code": auth_code,
            "code_verifier": code_verifier,
        });
        let request = self.public_request(
            self.client
                .post(format!("{}/token", self.auth_url))
                .query(&[("grant_type", "pkce")])
                .json(&payload),
        );

        let response = self.send_auth_request(request).await?;
        let session = response.into_session()?.ok_or_else(|| {
            AuthError::Api("Code exchange did not include an active session".to_string())
        })?;

        self.store_signed_in(session)
    }

    /// Browser-based sign-in through an OS redirect bridge.
    pub async fn sign_in_with_oauth(
        &self,
        bridge: &dyn OAuthBridge,
        provider: &str,
    ) -> AuthResult<AuthSession> {
        let start = bridge.begin_oauth().await?;
        let pkce = PkcePair::generate();
        let url = authorize_url(&self.auth_url, provider, &start.redirect_to, &pkce.challenge)?;

        tracing::debug!(provider, redirect_to = %start.redirect_to, "Opening OAuth authorize URL");
        bridge.open_external(&url).await?;

        let callback_url = bridge.await_oauth_callback().await?;
        let code = parse_oauth_callback(&callback_url)?;
        self.exchange_code_for_session(&code, &pkce.verifier).await
    }

    pub async fn refresh_session(&self, refresh_token: &str) -> AuthResult<AuthSession> {
        if refresh_token.trim().is_empty() {
            return Err(AuthError::InvalidConfiguration(
                "Refresh token must not be empty",
            ));
        }

        let payload = serde_json::json!({
            "refresh_token": refresh_token,
        });
        let request = self.public_request(
            self.client
                .post(format!("{}/token", self.auth_url))
                .query(&[("grant_type", "refresh_token")])
                .json(&payload),
        );
        let response = self.send_auth_request(request).await?;
        let session = response.into_session()?.ok_or_else(|| {
            AuthError::Api("Refresh response did not include an active session".to_string())
        })?;

        self.store.save_session(&session)?;
        Ok(session)
    }

    pub async fn sign_out(&self, access_token: &str) -> AuthResult<()> {
        let request = self
            .client
            .post(format!("{}/logout", self.auth_url))
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token);

        let response = request.send().await?;
        if !(response.status().is_success() || response.status() == StatusCode::UNAUTHORIZED) {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }

        self.store.clear_session()?;
        self.emit(AuthEvent::SignedOut);
        Ok(())
    }

    fn store_signed_in(&self, session: AuthSession) -> AuthResult<AuthSession> {
        self.store.save_session(&session)?;
        self.emit(AuthEvent::SignedIn(session.user.clone()));
        Ok(session)
    }

    fn emit(&self, event: AuthEvent) {
        // Nobody listening just means no engine is running.
        let _ = self.events.send(event);
    }

    fn public_request(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
    }

    async fn send_auth_request(&self, request: RequestBuilder) -> AuthResult<SupabaseAuthResponse> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(api_error(status, &body));
        }
        Ok(response.json::<SupabaseAuthResponse>().await?)
    }
}

#[async_trait]
impl<S: SessionPersistence> IdentityProvider for SupabaseAuthClient<S> {
    async fn current_user(&self) -> crate::Result<Option<AuthUser>> {
        Ok(self.restore_session().await?.map(|session| session.user))
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl<S: SessionPersistence> AccessTokenSource for SupabaseAuthClient<S> {
    async fn access_token(&self) -> AuthResult<String> {
        self.restore_session()
            .await?
            .map(|session| session.access_token)
            .ok_or(AuthError::NotSignedIn)
    }
}

pub fn normalize_auth_url(url: &str) -> AuthResult<String> {
    let trimmed = url.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(AuthError::InvalidConfiguration(
            "Supabase URL must not be empty",
        ));
    }
    if !has_http_scheme(trimmed) {
        return Err(AuthError::InvalidConfiguration(
            "Supabase URL must include http:// or https://",
        ));
    }
    if trimmed.ends_with("/auth/v1") {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{trimmed}/auth/v1"))
    }
}

fn validate_credentials(email: &str, password: &str) -> AuthResult<()> {
    if email.trim().is_empty() {
        return Err(AuthError::Api("Email is required".to_string()));
    }
    if password.trim().is_empty() {
        return Err(AuthError::Api("Password is required".to_string()));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct SupabaseAuthResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
    expires_in: Option<i64>,
    user: Option<SupabaseUser>,
}

impl SupabaseAuthResponse {
    fn into_session(self) -> AuthResult<Option<AuthSession>> {
        let expires_at = self.expires_at.or_else(|| {
            self.expires_in
                .map(|expires_in| now_secs().saturating_add(expires_in))
        });
        let user = self.user.map(AuthUser::from);

        match (self.access_token, self.refresh_token, expires_at, user) {
            (Some(access_token), Some(refresh_token), Some(expires_at), Some(user)) => {
                Ok(Some(AuthSession {
                    access_token,
                    refresh_token,
                    expires_at,
                    user,
                }))
            }
            (None, None, None, Some(_)) => Ok(None),
            _ => Err(AuthError::Api(
                "Auth response did not include enough session fields".to_string(),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SupabaseUser {
    id: String,
    email: Option<String>,
}

impl From<SupabaseUser> for AuthUser {
    fn from(value: SupabaseUser) -> Self {
        Self {
            id: value.id,
            email: value.email,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SupabaseErrorResponse {
    error: Option<String>,
    error_description: Option<String>,
    message: Option<String>,
    msg: Option<String>,
}

/// Whether a failed response may succeed on retry.
fn is_transient_status(status: StatusCode) -> bool {
    status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
}

fn api_error(status: StatusCode, body: &str) -> AuthError {
    let message = parse_api_error(status, body);
    if is_transient_status(status) {
        AuthError::Unavailable(message)
    } else {
        AuthError::Api(message)
    }
}

pub(crate) fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<SupabaseErrorResponse>(body) {
        if let Some(message) = payload
            .message
            .or(payload.msg)
            .or(payload.error_description)
            .or(payload.error)
        {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        let excerpt: String = trimmed.chars().take(MAX_ERROR_EXCERPT).collect();
        format!("{excerpt} ({})", status.as_u16())
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Answer a single request with `status_line` and a JSON `body`.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0_u8; 1024];
            while !request_complete(&request) {
                let read = stream.read(&mut chunk).await.unwrap();
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..read]);
            }
            let response = format!(
                "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
        });
        format!("http://{address}")
    }

    fn request_complete(request: &[u8]) -> bool {
        let text = String::from_utf8_lossy(request);
        let Some((head, body)) = text.split_once("\r\n\r\n") else {
            return false;
        };
        let length = head
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.trim().eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        body.len() >= length
    }

    async fn client_with_expired_session(
        url: &str,
    ) -> (SupabaseAuthClient<InMemorySessionStore>, InMemorySessionStore) {
        let store = InMemorySessionStore::default();
        store
            .save_session(&session(now_secs() - 10))
            .unwrap();
        let client = SupabaseAuthClient::new(url, "anon", store.clone()).unwrap();
        (client, store)
    }

    fn session(expires_at: i64) -> AuthSession {
        AuthSession {
            access_token: "secret-access-token".to_string(),
            refresh_token: "secret-refresh-token".to_string(),
            expires_at,
            user: AuthUser {
                id: "user".to_string(),
                email: None,
            },
        }
    }

    #[test]
    fn normalize_auth_url_appends_auth_path() {
        let normalized = normalize_auth_url("https://demo.supabase.co").unwrap();
        assert_eq!(normalized, "https://demo.supabase.co/auth/v1");
    }

    #[test]
    fn normalize_auth_url_keeps_existing_auth_path() {
        let normalized = normalize_auth_url("https://demo.supabase.co/auth/v1/").unwrap();
        assert_eq!(normalized, "https://demo.supabase.co/auth/v1");
    }

    #[test]
    fn response_without_session_fields_means_confirmation_required() {
        let response = SupabaseAuthResponse {
            access_token: None,
            refresh_token: None,
            expires_at: None,
            expires_in: None,
            user: Some(SupabaseUser {
                id: "user".to_string(),
                email: Some("user@example.com".to_string()),
            }),
        };
        assert!(response.into_session().unwrap().is_none());
    }

    #[test]
    fn response_with_expires_in_computes_expiry() {
        let response = SupabaseAuthResponse {
            access_token: Some("a".to_string()),
            refresh_token: Some("r".to_string()),
            expires_at: None,
            expires_in: Some(3600),
            user: Some(SupabaseUser {
                id: "user".to_string(),
                email: None,
            }),
        };
        let session = response.into_session().unwrap().unwrap();
        assert!(session.expires_at >= now_secs() + 3500);
        assert!(!session.is_expired());
    }

    #[test]
    fn session_debug_redacts_tokens() {
        let rendered = format!("{:?}", session(1_700_000_000));
        assert!(!rendered.contains("secret-access-token"));
        assert!(!rendered.contains("secret-refresh-token"));
        assert!(rendered.contains("[REDACTED]"));
    }

    #[test]
    fn parse_api_error_prefers_message_fields() {
        assert_eq!(
            parse_api_error(
                StatusCode::BAD_REQUEST,
                r#"{"error":"invalid_grant","error_description":"Invalid login credentials"}"#
            ),
            "Invalid login credentials (400)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
    }

    #[test]
    fn parse_api_error_truncates_plain_bodies() {
        let page = format!("  {}  ", "<html>".repeat(100));
        let message = parse_api_error(StatusCode::BAD_GATEWAY, &page);
        assert_eq!(message.len(), MAX_ERROR_EXCERPT + " (502)".len());
        assert!(message.starts_with("<html>"));
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "  upstream down  "),
            "upstream down (502)"
        );
    }

    #[test]
    fn transient_statuses_are_classified() {
        for status in [
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::BAD_GATEWAY,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::REQUEST_TIMEOUT,
        ] {
            assert!(is_transient_status(status), "{status}");
            assert!(api_error(status, "").is_transient());
        }
        for status in [
            StatusCode::BAD_REQUEST,
            StatusCode::UNAUTHORIZED,
            StatusCode::FORBIDDEN,
        ] {
            assert!(!is_transient_status(status), "{status}");
            assert!(matches!(api_error(status, ""), AuthError::Api(_)));
        }
    }

    #[tokio::test]
    async fn restore_keeps_session_when_auth_api_is_down() {
        let url = serve_once("503 Service Unavailable", r#"{"message":"upstream down"}"#).await;
        let (client, store) = client_with_expired_session(&url).await;
        let mut events = client.subscribe_auth_changes();

        let restored = client.restore_session().await.unwrap();

        assert!(restored.is_some());
        assert_eq!(restored, store.load_session().unwrap());
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn restore_signs_out_when_refresh_token_is_rejected() {
        let url = serve_once(
            "400 Bad Request",
            r#"{"error":"invalid_grant","error_description":"Invalid Refresh Token"}"#,
        )
        .await;
        let (client, store) = client_with_expired_session(&url).await;
        let mut events = client.subscribe_auth_changes();

        assert_eq!(client.restore_session().await.unwrap(), None);
        assert_eq!(store.load_session().unwrap(), None);
        assert!(matches!(events.try_recv(), Ok(AuthEvent::SignedOut)));
    }

    #[tokio::test]
    async fn identity_reads_unexpired_stored_session() {
        let store = InMemorySessionStore::default();
        store
            .save_session(&session(now_secs() + 3600))
            .unwrap();
        let client = SupabaseAuthClient::new("https://demo.supabase.co", "anon", store).unwrap();

        let user = client.current_user().await.unwrap().unwrap();
        assert_eq!(user.id, "user");
        assert_eq!(
            client.access_token().await.unwrap(),
            "secret-access-token"
        );
    }

    #[tokio::test]
    async fn identity_without_session_is_anonymous() {
        let client = SupabaseAuthClient::new(
            "https://demo.supabase.co",
            "anon",
            InMemorySessionStore::default(),
        )
        .unwrap();

        assert!(client.current_user().await.unwrap().is_none());
        assert!(matches!(
            client.access_token().await,
            Err(AuthError::NotSignedIn)
        ));
    }
}
