//! Adaptive readiness polling against the engine's loopback API.
//!
//! Each attempt carries its own short timeout so a hung socket can never
//! stall the startup sequence; the loop simply tries again until its attempt
//! budget runs out.

use std::time::Duration;

use tracing::{debug, trace};

use crate::errors::SupervisorError;

/// Default attempt budget; together with the adaptive delays this bounds the
/// total wait to roughly ten seconds while giving slow devices a longer tail.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 30;

/// Per-attempt connect/read timeout.
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(400);

const SHORT_DELAY: Duration = Duration::from_millis(100);
const MEDIUM_DELAY: Duration = Duration::from_millis(250);
const LONG_DELAY: Duration = Duration::from_millis(500);

/// Delay before the next attempt: short for the first ten, medium for the
/// next ten, long for the remainder.
pub fn delay_for_attempt(attempt: u32) -> Duration {
    match attempt {
        0..=10 => SHORT_DELAY,
        11..=20 => MEDIUM_DELAY,
        _ => LONG_DELAY,
    }
}

/// Whether an HTTP status means the server is alive.
///
/// 401/403 count as ready: the server is up even if it demands
/// authentication.
pub fn is_ready_status(status: u16) -> bool {
    matches!(status, 200..=399 | 401 | 403)
}

/// Polls a loopback URL until the server answers or the budget is exhausted.
pub struct ReadinessProber {
    client: reqwest::Client,
}

impl ReadinessProber {
    pub fn new() -> Result<Self, reqwest::Error> {
        // Redirects are not followed: a 3xx from the status endpoint already
        // proves the server is alive, and following one could turn that into
        // a spurious "not ready".
        let client = reqwest::Client::builder()
            .connect_timeout(ATTEMPT_TIMEOUT)
            .timeout(ATTEMPT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// HEAD-poll `url` until a ready status arrives.
    ///
    /// Returns `false` after `max_attempts` without throwing; the caller
    /// decides how to surface an unready server. Dropping the returned future
    /// cancels the loop promptly (no detached work is spawned).
    pub async fn await_ready(&self, url: &str, max_attempts: u32) -> bool {
        for attempt in 1..=max_attempts {
            match self.client.head(url).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    if is_ready_status(status) {
                        debug!(url, attempt, status, "engine answered readiness probe");
                        return true;
                    }
                    trace!(url, attempt, status, "engine not ready yet");
                }
                Err(err) => {
                    trace!(url, attempt, %err, "readiness probe attempt failed");
                }
            }
            if attempt < max_attempts {
                tokio::time::sleep(delay_for_attempt(attempt)).await;
            }
        }
        debug!(url, max_attempts, "readiness probe budget exhausted");
        false
    }

    /// Like [`Self::await_ready`], but budget exhaustion is a typed error for
    /// callers that propagate failures instead of branching.
    pub async fn ensure_ready(
        &self,
        url: &str,
        max_attempts: u32,
    ) -> Result<(), SupervisorError> {
        if self.await_ready(url, max_attempts).await {
            Ok(())
        } else {
            Err(SupervisorError::ProbeTimeout {
                attempts: max_attempts,
            })
        }
    }
}
