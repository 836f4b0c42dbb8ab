//! Engine process lifecycle: launch, first-run repository setup, output
//! draining, and teardown.
//!
//! Start/stop are not reentrant-safe; the caller serializes them (a restart
//! is stop, wait for termination, then start). Two engine processes bound to
//! the same loopback port would conflict.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::binary::{self, CandidateOrigin, ExecutableCandidate};
use crate::config::{DEFAULT_REPOSITORY_PASSWORD, EnginePaths};
use crate::errors::{self, SupervisorError};
use crate::status::{ServerStatus, StatusStore};
use crate::util::redact_secret;

/// How long `stop` waits for the killed process to be reaped before handing
/// cleanup to the OS.
const STOP_REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolve the repository password with fixed precedence: the password file
/// the engine itself wrote, then the application's fallback file, then the
/// built-in default.
pub fn resolve_repository_password(paths: &EnginePaths) -> String {
    for file in [paths.engine_password_file(), paths.fallback_password_file()] {
        if let Ok(contents) = std::fs::read_to_string(&file) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                debug!(
                    file = %file.display(),
                    password = %redact_secret(trimmed),
                    "resolved repository password from file"
                );
                return trimmed.to_string();
            }
        }
    }
    debug!("no password file present; using built-in default");
    DEFAULT_REPOSITORY_PASSWORD.to_string()
}

/// Whether the repository data directory already holds engine data.
pub fn local_data_exists(repo_dir: &Path) -> bool {
    std::fs::read_dir(repo_dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Argument list for the long-running server subcommand. The bind address is
/// always restricted to loopback.
fn server_args(port: u16, insecure: bool, username: &str, password: &str) -> Vec<String> {
    let mut args = vec![
        "server".to_string(),
        "start".to_string(),
        format!("--address=127.0.0.1:{port}"),
    ];
    if insecure {
        args.push("--insecure".to_string());
        args.push(format!("--server-username={username}"));
        args.push(format!("--server-password={password}"));
    }
    args
}

#[derive(Debug, PartialEq, Eq)]
enum PollState {
    Running,
    Exited(Option<i32>),
}

/// Interpret a `try_wait` result. A polling failure is not evidence that the
/// process exited, so it counts as still running.
fn classify_poll(poll: std::io::Result<Option<std::process::ExitStatus>>) -> PollState {
    match poll {
        Ok(None) => PollState::Running,
        Ok(Some(status)) => PollState::Exited(status.code()),
        Err(err) => {
            debug!(%err, "could not poll engine process state");
            PollState::Running
        }
    }
}

/// Owns the engine server process.
pub struct EngineSupervisor {
    paths: EnginePaths,
    status: StatusStore,
    server_username: String,
    server_password: String,
    child: Option<Child>,
    drain: Option<JoinHandle<()>>,
    stopping: Arc<AtomicBool>,
}

impl EngineSupervisor {
    pub fn new(
        paths: EnginePaths,
        status: StatusStore,
        server_username: &str,
        server_password: &str,
    ) -> Self {
        Self {
            paths,
            status,
            server_username: server_username.to_string(),
            server_password: server_password.to_string(),
            child: None,
            drain: None,
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Whether the engine process is currently alive. An unexpected exit is
    /// reported here (not auto-restarted) and clears the stale handle.
    pub fn is_running(&mut self) -> bool {
        let exit = match self.child.as_mut() {
            None => return false,
            Some(child) => match classify_poll(child.try_wait()) {
                PollState::Running => return true,
                PollState::Exited(code) => code,
            },
        };
        warn!(code = ?exit, "engine process exited unexpectedly");
        self.status
            .set_error(SupervisorError::ProcessExited { code: exit }.to_string());
        self.child = None;
        self.drain = None;
        false
    }

    /// Bring the engine server up on the given loopback port.
    ///
    /// Idempotent under serialized calls: when the process is already running
    /// this is a no-op and no second process is spawned.
    pub async fn start(
        &mut self,
        port: u16,
        repository_path: Option<&Path>,
        insecure_allowed: bool,
    ) -> Result<(), SupervisorError> {
        if self.is_running() {
            debug!(port, "engine already running; start ignored");
            return Ok(());
        }
        self.stopping.store(false, Ordering::SeqCst);
        self.status.set(ServerStatus::Connecting);

        let candidate = match binary::locate_executable(&self.paths) {
            Ok(candidate) => candidate,
            Err(err) => return self.report(err),
        };

        let repo_dir = repository_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.paths.repo_dir.clone());
        if let Err(err) = self.ensure_directories(&repo_dir).await {
            return self.report(err.into());
        }

        let password = resolve_repository_password(&self.paths);

        if !self.paths.config_file().exists() {
            if let Err(err) = self
                .run_setup_chain(&candidate.path, &repo_dir, &password)
                .await
            {
                return self.report(err);
            }
        }

        let child = match self.spawn_with_permission_fallback(
            &candidate,
            port,
            &password,
            insecure_allowed,
        ) {
            Ok(child) => child,
            Err(err) => return self.report(err),
        };
        info!(pid = ?child.id(), port, "engine server launched");
        self.attach(child);
        Ok(())
    }

    /// Best-effort termination: request the kill, reap briefly, release the
    /// handle. Never blocks shutdown indefinitely; the OS owns final cleanup.
    pub async fn stop(&mut self) {
        self.stopping.store(true, Ordering::SeqCst);
        if let Some(drain) = self.drain.take() {
            drain.abort();
        }
        if let Some(mut child) = self.child.take() {
            debug!(pid = ?child.id(), "stopping engine server");
            if let Err(err) = child.start_kill() {
                debug!(%err, "engine kill request failed");
            }
            let _ = tokio::time::timeout(STOP_REAP_TIMEOUT, child.wait()).await;
        }
        self.status.set(ServerStatus::Disconnected);
    }

    /// Serialized stop-then-start.
    pub async fn restart(
        &mut self,
        port: u16,
        repository_path: Option<&Path>,
        insecure_allowed: bool,
    ) -> Result<(), SupervisorError> {
        self.stop().await;
        self.start(port, repository_path, insecure_allowed).await
    }

    fn report<T>(&self, err: SupervisorError) -> Result<T, SupervisorError> {
        self.status.set_error(err.to_string());
        Err(err)
    }

    async fn ensure_directories(&self, repo_dir: &Path) -> std::io::Result<()> {
        tokio::fs::create_dir_all(repo_dir).await?;
        tokio::fs::create_dir_all(&self.paths.config_dir).await?;
        Ok(())
    }

    /// Base engine invocation: home and configuration overrides plus the
    /// repository password, all via the environment. The password never
    /// appears on the command line, which other processes may be able to see.
    fn engine_command(&self, exe: &Path, password: &str) -> Command {
        let mut cmd = Command::new(exe);
        cmd.env("HOME", &self.paths.home_dir)
            .env("KOPIA_CONFIG_PATH", self.paths.config_file())
            .env("KOPIA_PASSWORD", password);
        cmd
    }

    async fn run_one_shot(
        &self,
        exe: &Path,
        password: &str,
        args: &[String],
    ) -> std::io::Result<std::process::Output> {
        let mut cmd = self.engine_command(exe, password);
        cmd.args(args).stdin(Stdio::null());
        cmd.output().await
    }

    /// First-run setup: `repository status`, then `connect` when local data
    /// already exists, then `create`. A step succeeds when it leaves a
    /// repository configuration file behind; otherwise the chain falls
    /// through. Exhausting all steps aborts startup.
    async fn run_setup_chain(
        &self,
        exe: &Path,
        repo_dir: &Path,
        password: &str,
    ) -> Result<(), SupervisorError> {
        let path_arg = format!("--path={}", repo_dir.display());
        let mut steps: Vec<(&str, Vec<String>)> = vec![(
            "status",
            vec!["repository".to_string(), "status".to_string()],
        )];
        if local_data_exists(repo_dir) {
            steps.push((
                "connect",
                vec![
                    "repository".to_string(),
                    "connect".to_string(),
                    "filesystem".to_string(),
                    path_arg.clone(),
                ],
            ));
        }
        steps.push((
            "create",
            vec![
                "repository".to_string(),
                "create".to_string(),
                "filesystem".to_string(),
                path_arg,
            ],
        ));

        for (step, args) in steps {
            debug!(step, "running repository setup step");
            match self.run_one_shot(exe, password, &args).await {
                Ok(output) => {
                    if !output.status.success() {
                        debug!(
                            step,
                            code = ?output.status.code(),
                            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                            "setup step did not succeed"
                        );
                    }
                    if self.paths.config_file().exists() {
                        info!(step, "repository configuration established");
                        return Ok(());
                    }
                }
                Err(err) => {
                    warn!(step, %err, "setup step could not be invoked");
                }
            }
        }

        Err(SupervisorError::Setup(
            "status, connect, and create all failed to produce a repository configuration"
                .to_string(),
        ))
    }

    fn spawn_server(
        &self,
        exe: &Path,
        port: u16,
        password: &str,
        insecure: bool,
    ) -> std::io::Result<Child> {
        let mut cmd = self.engine_command(exe, password);
        cmd.args(server_args(
            port,
            insecure,
            &self.server_username,
            &self.server_password,
        ));
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.spawn()
    }

    /// Launch the server, retrying exactly once from the fallback cache copy
    /// when the OS denies execute permission on the selected candidate.
    fn spawn_with_permission_fallback(
        &self,
        candidate: &ExecutableCandidate,
        port: u16,
        password: &str,
        insecure: bool,
    ) -> Result<Child, SupervisorError> {
        match self.spawn_server(&candidate.path, port, password, insecure) {
            Ok(child) => Ok(child),
            Err(err)
                if errors::is_permission_denied(&err)
                    && candidate.origin != CandidateOrigin::FallbackCacheCopy =>
            {
                warn!(
                    path = %candidate.path.display(),
                    "engine launch denied by the OS; retrying from fallback cache copy"
                );
                let fallback = binary::fallback_candidate(&self.paths)?;
                self.spawn_server(&fallback.path, port, password, insecure)
                    .map_err(|source| {
                        if errors::is_permission_denied(&source) {
                            SupervisorError::LaunchPermissionDenied {
                                path: fallback.path,
                                source,
                            }
                        } else {
                            source.into()
                        }
                    })
            }
            Err(err) if errors::is_permission_denied(&err) => {
                Err(SupervisorError::LaunchPermissionDenied {
                    path: candidate.path.clone(),
                    source: err,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Take over a launched child: store the handle and spawn the output
    /// drain task. The drain stops with the process and never blocks
    /// shutdown.
    fn attach(&mut self, mut child: Child) {
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let status = self.status.clone();
        let stopping = Arc::clone(&self.stopping);
        self.drain = Some(tokio::spawn(drain_output(
            stdout, stderr, status, stopping,
        )));
        self.child = Some(child);
    }
}

async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Drain the engine's combined output for diagnostics until both streams
/// close. A stream that hits EOF is retired while the other keeps draining,
/// so stderr's final lines survive a dying process. A full close outside of
/// an orderly stop means the process died, which is reported through the
/// status store (report-only, no auto-restart).
async fn drain_output(
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    status: StatusStore,
    stopping: Arc<AtomicBool>,
) {
    let mut out_lines = stdout.map(|s| BufReader::new(s).lines());
    let mut err_lines = stderr.map(|s| BufReader::new(s).lines());

    while out_lines.is_some() || err_lines.is_some() {
        tokio::select! {
            line = next_line(&mut out_lines) => match line {
                Some(line) => debug!(target: "kes::engine", "{line}"),
                None => out_lines = None,
            },
            line = next_line(&mut err_lines) => match line {
                Some(line) => debug!(target: "kes::engine", "{line}"),
                None => err_lines = None,
            },
        }
    }

    if !stopping.load(Ordering::SeqCst) {
        warn!("engine output stream closed outside of stop");
        status.set_error("engine process exited unexpectedly");
    }
}
