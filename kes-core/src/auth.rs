//! Authentication handshake against the engine's loopback API.
//!
//! One GET to the status endpoint with the fixed insecure-mode Basic
//! credentials yields a session cookie and/or an anti-forgery token. The
//! client keeps a cookie store so the follow-up state-changing request rides
//! the same session.

use std::time::Duration;

use reqwest::header;
use tracing::debug;

use crate::config::{DEFAULT_SERVER_PASSWORD, DEFAULT_SERVER_USERNAME, base_url};
use crate::errors::SupervisorError;

/// Anti-forgery header echoed back on state-changing requests.
pub const CSRF_HEADER: &str = "X-Kopia-Csrf-Token";

/// Response headers that may carry the anti-forgery token, in preference
/// order. Some engine builds emit only one of these.
const CSRF_HEADER_CANDIDATES: [&str; 3] =
    ["X-Kopia-Csrf-Token", "Kopia-Csrf-Token", "X-Csrf-Token"];

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Credentials for one configuration attempt.
///
/// Never persisted; discarded and re-acquired on every connect/create call.
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Raw `Set-Cookie` value observed on the challenge response. The cookie
    /// itself also lives in the client's cookie store for propagation.
    pub session_cookie: Option<String>,
    /// Anti-forgery token, when the server emitted one.
    pub csrf_token: Option<String>,
}

/// Performs the challenge request and owns the cookie-store client that the
/// follow-up request must reuse.
pub struct SessionAuthenticator {
    client: reqwest::Client,
    username: String,
    password: String,
}

impl SessionAuthenticator {
    /// Authenticator using the fixed default UI credentials.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::with_credentials(DEFAULT_SERVER_USERNAME, DEFAULT_SERVER_PASSWORD)
    }

    pub fn with_credentials(username: &str, password: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
        })
    }

    /// The cookie-store client; state-changing calls after [`Self::authenticate`]
    /// must go through this same client so the session cookie propagates.
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Challenge the status endpoint and capture session credentials.
    ///
    /// Succeeds when a cookie or a token was obtained (both is preferred but
    /// not required). Fails only when neither is present, which means the
    /// server is unreachable or not in the expected insecure-default mode.
    pub async fn authenticate(&self, port: u16) -> Result<AuthSession, SupervisorError> {
        let url = format!("{}/api/v1/repo/status", base_url(port));
        let response = self
            .client
            .get(&url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await?;

        let session_cookie = response
            .headers()
            .get(header::SET_COOKIE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let csrf_token = CSRF_HEADER_CANDIDATES.iter().find_map(|name| {
            response
                .headers()
                .get(*name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned)
        });

        if session_cookie.is_none() && csrf_token.is_none() {
            return Err(SupervisorError::AuthFailed(format!(
                "challenge to {url} returned neither a session cookie nor an anti-forgery token \
                 (HTTP {})",
                response.status()
            )));
        }

        debug!(
            port,
            has_cookie = session_cookie.is_some(),
            has_token = csrf_token.is_some(),
            "authentication handshake complete"
        );

        Ok(AuthSession {
            session_cookie,
            csrf_token,
        })
    }
}
