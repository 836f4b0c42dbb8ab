//! Kopia Engine Supervisor core.
//!
//! Brings a locally spawned backup-engine server to a ready state and
//! establishes an authenticated configuration session with it:
//!
//! 1. [`binary`] finds and verifies the engine executable.
//! 2. [`supervisor`] launches and owns the server process.
//! 3. [`probe`] polls the loopback API until the server answers.
//! 4. [`auth`] performs the cookie/token handshake.
//! 5. [`session`] issues the repository connect/create request.
//! 6. [`status`] is the observable record everything reports into.
//!
//! The engine's own snapshotting and storage format are opaque here; it is
//! treated as a black-box process behind a loopback HTTP API.

#![forbid(unsafe_code)]

pub mod auth;
pub mod binary;
pub mod config;
pub mod errors;
pub mod probe;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod util;

pub use auth::{AuthSession, SessionAuthenticator};
pub use binary::{CandidateOrigin, ExecutableCandidate, locate_executable, validate};
pub use config::{EngineConfig, EnginePaths};
pub use errors::SupervisorError;
pub use probe::ReadinessProber;
pub use session::{ConnectionOutcome, RepositorySessionManager};
pub use status::{ServerStatus, StatusStore};
pub use supervisor::EngineSupervisor;
