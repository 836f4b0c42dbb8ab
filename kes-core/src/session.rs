//! Repository connect/create calls against the engine's loopback API.
//!
//! Each call is one logical exchange made as two HTTP requests: the
//! authentication challenge, then the state-changing POST on the same
//! cookie-store client. Auth sessions are never reused across calls.

use std::path::Path;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::auth::{CSRF_HEADER, SessionAuthenticator};
use crate::config::base_url;
use crate::errors;
use crate::status::{ServerStatus, StatusStore};
use crate::util::redact_secret;

/// Compression codec requested when creating a repository. Engine-level
/// parameter, not user-configurable.
const CREATE_COMPRESSION: &str = "zstd";

/// Result of a connect or create call, also mirrored into the status store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOutcome {
    pub success: bool,
    pub error_message: Option<String>,
}

impl ConnectionOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        let message = if message.trim().is_empty() {
            "repository request failed".to_string()
        } else {
            message
        };
        Self {
            success: false,
            error_message: Some(message),
        }
    }

    /// Whether the failure looks like a wrong repository password, which
    /// drives a different recovery prompt upstream.
    pub fn is_password_error(&self) -> bool {
        self.error_message
            .as_deref()
            .is_some_and(errors::is_password_error)
    }
}

#[derive(Serialize)]
struct StorageConfig<'a> {
    path: &'a str,
}

#[derive(Serialize)]
struct Storage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    config: StorageConfig<'a>,
}

impl<'a> Storage<'a> {
    fn filesystem(path: &'a str) -> Self {
        Self {
            kind: "filesystem",
            config: StorageConfig { path },
        }
    }
}

#[derive(Serialize)]
struct ConnectRequest<'a> {
    storage: Storage<'a>,
    password: &'a str,
}

#[derive(Serialize)]
struct BlockFormat {
    compression: &'static str,
}

#[derive(Serialize)]
struct CreateOptions {
    #[serde(rename = "blockFormat")]
    block_format: BlockFormat,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    storage: Storage<'a>,
    password: &'a str,
    options: CreateOptions,
}

/// Extract a human-readable message from an error response.
///
/// Tries the JSON `error` (then `message`) field, falls back to the raw body
/// verbatim, and finally to the HTTP status so the message is never empty.
fn parse_error_message(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        for key in ["error", "message"] {
            if let Some(message) = value.get(key).and_then(|v| v.as_str()) {
                if !message.trim().is_empty() {
                    return message.to_string();
                }
            }
        }
    }
    let raw = body.trim();
    if !raw.is_empty() {
        return raw.to_string();
    }
    format!("HTTP {status}")
}

/// Issues connect/create requests and classifies the response.
pub struct RepositorySessionManager {
    port: u16,
    server_username: String,
    server_password: String,
    status: StatusStore,
}

impl RepositorySessionManager {
    pub fn new(
        port: u16,
        server_username: &str,
        server_password: &str,
        status: StatusStore,
    ) -> Self {
        Self {
            port,
            server_username: server_username.to_string(),
            server_password: server_password.to_string(),
            status,
        }
    }

    /// Connect to an existing filesystem repository.
    pub async fn connect(&self, path: &Path, password: &str) -> ConnectionOutcome {
        debug!(
            path = %path.display(),
            password = %redact_secret(password),
            "connecting to existing repository"
        );
        let path = path.to_string_lossy();
        let body = ConnectRequest {
            storage: Storage::filesystem(&path),
            password,
        };
        self.call("connect", &body).await
    }

    /// Create a new filesystem repository.
    pub async fn create(&self, path: &Path, password: &str) -> ConnectionOutcome {
        debug!(
            path = %path.display(),
            password = %redact_secret(password),
            "creating new repository"
        );
        let path = path.to_string_lossy();
        let body = CreateRequest {
            storage: Storage::filesystem(&path),
            password,
            options: CreateOptions {
                block_format: BlockFormat {
                    compression: CREATE_COMPRESSION,
                },
            },
        };
        self.call("create", &body).await
    }

    async fn call<T: Serialize>(&self, endpoint: &str, body: &T) -> ConnectionOutcome {
        match self.try_call(endpoint, body).await {
            Ok(()) => {
                info!(endpoint, "repository session established");
                self.status.set(ServerStatus::Connected);
                ConnectionOutcome::ok()
            }
            Err(message) => {
                warn!(endpoint, %message, "repository request failed");
                self.status.set_error(message.clone());
                ConnectionOutcome::failed(message)
            }
        }
    }

    /// One logical exchange: fresh handshake, then the POST. An auth failure
    /// short-circuits without issuing the POST.
    async fn try_call<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<(), String> {
        let authenticator =
            SessionAuthenticator::with_credentials(&self.server_username, &self.server_password)
                .map_err(|err| format!("failed to build http client: {err}"))?;
        let session = authenticator
            .authenticate(self.port)
            .await
            .map_err(|err| err.to_string())?;

        let url = format!("{}/api/v1/repo/{endpoint}", base_url(self.port));
        let mut request = authenticator.client().post(&url).json(body);
        if let Some(token) = &session.csrf_token {
            request = request.header(CSRF_HEADER, token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| format!("request to {url} failed: {err}"))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(parse_error_message(status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn error_field_wins() {
        let message =
            parse_error_message(StatusCode::FORBIDDEN, r#"{"error":"invalid password"}"#);
        assert_eq!(message, "invalid password");
    }

    #[test]
    fn message_field_is_second_choice() {
        let message =
            parse_error_message(StatusCode::BAD_REQUEST, r#"{"message":"bad storage spec"}"#);
        assert_eq!(message, "bad storage spec");
    }

    #[test]
    fn malformed_json_falls_back_to_raw_body() {
        let message = parse_error_message(StatusCode::INTERNAL_SERVER_ERROR, "{oops not json");
        assert_eq!(message, "{oops not json");
    }

    #[test]
    fn empty_body_falls_back_to_status_line() {
        let message = parse_error_message(StatusCode::BAD_GATEWAY, "");
        assert!(!message.is_empty());
        assert!(message.contains("502"));
    }

    #[test]
    fn json_without_known_fields_falls_back_to_raw_body() {
        let body = r#"{"detail":"nope"}"#;
        assert_eq!(
            parse_error_message(StatusCode::FORBIDDEN, body),
            body
        );
    }

    #[test]
    fn outcome_failure_message_is_never_empty() {
        let outcome = ConnectionOutcome::failed("  ");
        assert!(!outcome.success);
        assert!(!outcome.error_message.unwrap().trim().is_empty());
    }

    #[test]
    fn password_failures_are_classified() {
        assert!(ConnectionOutcome::failed("invalid password").is_password_error());
        assert!(!ConnectionOutcome::failed("storage unreachable").is_password_error());
        assert!(!ConnectionOutcome::ok().is_password_error());
    }

    #[test]
    fn create_body_pins_the_compression_codec() {
        let body = CreateRequest {
            storage: Storage::filesystem("/data/repo"),
            password: "pw",
            options: CreateOptions {
                block_format: BlockFormat {
                    compression: CREATE_COMPRESSION,
                },
            },
        };
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["options"]["blockFormat"]["compression"], "zstd");
        assert_eq!(value["storage"]["type"], "filesystem");
        assert_eq!(value["storage"]["config"]["path"], "/data/repo");
    }
}
