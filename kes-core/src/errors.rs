//! Error taxonomy for engine supervision.
//!
//! Local recovery is limited to the permission-denied launch fallback and the
//! status/connect/create setup chain; everything else is surfaced to the
//! caller as a typed error or a status-store transition, never swallowed.

use std::path::PathBuf;
use thiserror::Error;

use crate::binary::ValidationError;

/// Errors produced while bringing the engine to a ready state.
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// No executable was found in any candidate location.
    #[error("engine binary not found in any candidate location")]
    BinaryMissing,

    /// An executable was found but its header failed verification.
    #[error("engine binary failed validation: {0}")]
    BinaryInvalid(#[from] ValidationError),

    /// The OS refused to launch the executable, even from the fallback copy.
    #[error("engine launch denied by the OS for {path}: {source}")]
    LaunchPermissionDenied {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The engine process exited while it was expected to keep running.
    #[error("engine process exited unexpectedly (exit code {code:?})")]
    ProcessExited { code: Option<i32> },

    /// The readiness probe exhausted its attempt budget.
    #[error("engine did not answer on its loopback API within {attempts} probe attempts")]
    ProbeTimeout { attempts: u32 },

    /// The authentication challenge yielded neither a cookie nor a token.
    #[error("authentication handshake failed: {0}")]
    AuthFailed(String),

    /// First-run repository setup exhausted the status/connect/create chain.
    #[error("repository setup failed: {0}")]
    Setup(String),

    /// Filesystem or process I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// HTTP transport failure talking to the loopback API.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Whether a launch failure is the OS refusing execute permission.
///
/// Only this kind triggers the one-shot fallback-copy retry; other I/O errors
/// are terminal for the attempt.
pub fn is_permission_denied(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::PermissionDenied
}

/// Classify a server-reported error message as a wrong-password failure.
///
/// The engine reports password problems only as free-form text, so the match
/// is deliberately a single substring check kept in one place.
pub fn is_password_error(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("password") || message.contains("invalid credentials")
}
