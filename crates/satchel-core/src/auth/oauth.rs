//! OAuth (PKCE) helpers and the platform redirect bridge.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use sha2::{Digest, Sha256};
use url::Url;
use uuid::Uuid;

use super::{AuthError, AuthResult};

/// Where the provider should send the browser back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthStart {
    pub redirect_to: String,
}

/// Platform glue for a browser round trip: a loopback listener on desktop,
/// a deep link on mobile.
#[async_trait]
pub trait OAuthBridge: Send + Sync {
    /// Prepare to receive the callback.
    async fn begin_oauth(&self) -> AuthResult<OAuthStart>;

    /// Open `url` in the system browser.
    async fn open_external(&self, url: &str) -> AuthResult<()>;

    /// Wait for the provider to redirect back; returns the full callback URL.
    async fn await_oauth_callback(&self) -> AuthResult<String>;
}

#[derive(Clone, PartialEq, Eq)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        Self::from_verifier(verifier)
    }

    pub fn from_verifier(verifier: impl Into<String>) -> Self {
        let verifier = verifier.into();
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        Self {
            verifier,
            challenge,
        }
    }
}

impl std::fmt::Debug for PkcePair {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("PkcePair")
            .field("verifier", &"[REDACTED]")
            .field("challenge", &self.challenge)
            .finish()
    }
}

/// Build the `/authorize` URL for `provider` under a normalized auth URL.
pub fn authorize_url(
    auth_url: &str,
    provider: &str,
    redirect_to: &str,
    code_challenge: &str,
) -> AuthResult<String> {
    let provider = provider.trim();
    if provider.is_empty() {
        return Err(AuthError::OAuth("provider must not be empty".to_string()));
    }

    let url = Url::parse_with_params(
        &format!("{auth_url}/authorize"),
        &[
            ("provider", provider),
            ("redirect_to", redirect_to),
            ("code_challenge", code_challenge),
            ("code_challenge_method", "s256"),
        ],
    )
    .map_err(|error| AuthError::OAuth(format!("invalid authorize URL: {error}")))?;
    Ok(url.into())
}

/// Extract the authorization code from a redirect URL.
///
/// Provider errors may arrive in the query or the fragment.
pub fn parse_oauth_callback(callback_url: &str) -> AuthResult<String> {
    let url = Url::parse(callback_url.trim())
        .map_err(|error| AuthError::OAuth(format!("invalid callback URL: {error}")))?;

    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();
    if let Some(fragment) = url.fragment() {
        params.extend(
            url::form_urlencoded::parse(fragment.as_bytes())
                .map(|(key, value)| (key.into_owned(), value.into_owned())),
        );
    }

    let param = |name: &str| {
        params
            .iter()
            .find(|(key, value)| key == name && !value.trim().is_empty())
            .map(|(_, value)| value.trim().to_string())
    };

    if let Some(error) = param("error") {
        let description = param("error_description").unwrap_or(error);
        return Err(AuthError::OAuth(description));
    }

    param("code").ok_or_else(|| {
        AuthError::OAuth("callback did not include an authorization code".to_string())
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn pkce_challenge_is_base64url_sha256() {
        let pair = PkcePair::from_verifier("satchel-test-verifier-0123456789abcdef0123456789abcdef");
        assert_eq!(pair.challenge, "O2MGEA6nN6dZJ6B80lJMaw5V-DrHb6YFTEc_JneTvgs");
    }

    #[test]
    fn generated_verifier_is_long_enough() {
        let pair = PkcePair::generate();
        assert_eq!(pair.verifier.len(), 64);
        assert_ne!(pair, PkcePair::generate());
        assert!(!format!("{pair:?}").contains(&pair.verifier));
    }

    #[test]
    fn authorize_url_encodes_parameters() {
        let url = authorize_url(
            "https://demo.supabase.co/auth/v1",
            "github",
            "http://127.0.0.1:5173/callback",
            "abc",
        )
        .unwrap();
        assert_eq!(
            url,
            "https://demo.supabase.co/auth/v1/authorize?provider=github&redirect_to=http%3A%2F%2F127.0.0.1%3A5173%2Fcallback&code_challenge=abc&code_challenge_method=s256"
        );
        assert!(authorize_url("https://demo.supabase.co/auth/v1", " ", "x", "y").is_err());
    }

    #[test]
    fn callback_yields_code() {
        let code = parse_oauth_callback("http://127.0.0.1:5173/callback?code=abc123&state=x").unwrap();
        assert_eq!(code, "abc123");
    }

    #[test]
    fn callback_error_uses_description() {
        let error = parse_oauth_callback(
            "satchel://auth/callback#error=access_denied&error_description=User+cancelled",
        )
        .unwrap_err();
        assert_eq!(error.to_string(), "OAuth sign-in failed: User cancelled");
    }

    #[test]
    fn callback_without_code_is_rejected() {
        assert!(matches!(
            parse_oauth_callback("http://127.0.0.1/callback"),
            Err(AuthError::OAuth(_))
        ));
        assert!(parse_oauth_callback("not a url").is_err());
    }
}
