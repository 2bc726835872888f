//! Foreground supervision of the application server.
//!
//! The server runs as a child with inherited stdio. Termination signals
//! received by the launcher are forwarded; a child that outlives the grace
//! period is killed.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};

use dockwright_shared::constants::{envs, recipe as defaults, server};
use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::util::process::{exit_code, send_signal, terminating_signal};

use super::command::StartupCommand;
use super::config::ServerConfig;
use super::probe::wait_until_listening;
use super::state::{RunState, RunStatus};

/// Time a child gets to exit after a forwarded signal.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// What to launch and how to supervise it.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Directory the entry module is resolved against; the child's cwd.
    pub workdir: PathBuf,
    pub command: StartupCommand,
    /// Application settings to warn about when absent.
    pub expected_env: Vec<String>,
    /// Probe the listen socket for this long after spawning.
    pub ready_timeout: Option<Duration>,
    pub grace_period: Duration,
}

impl Default for LaunchSpec {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(defaults::WORKDIR),
            command: StartupCommand::run_module(
                server::PROGRAM,
                defaults::ENTRY_MODULE,
                true,
                &[],
            ),
            expected_env: envs::APP_EXPECTED.iter().map(|s| s.to_string()).collect(),
            ready_timeout: None,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// How the foreground process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Process exit code, `128 + N` for death by signal N.
    pub exit_code: i32,
    pub signal: Option<i32>,
    /// Time until the listen socket accepted a connection, when probed.
    pub ready_after: Option<Duration>,
}

impl RunOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub struct Launcher {
    spec: LaunchSpec,
    state: RunState,
}

impl Launcher {
    pub fn new(spec: LaunchSpec) -> Self {
        Self {
            spec,
            state: RunState::new(),
        }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Fail fast when the entry module is not under the working directory.
    pub fn check_entry_module(&self) -> DockwrightResult<()> {
        let Some(entry) = self.spec.command.entry_module() else {
            tracing::debug!(command = %self.spec.command, "Command names no entry module");
            return Ok(());
        };

        let path = self.spec.workdir.join(entry);
        if !path.is_file() {
            return Err(DockwrightError::Startup(format!(
                "entry module {} not found in {}",
                entry,
                self.spec.workdir.display()
            )));
        }
        Ok(())
    }

    /// Expected application settings that `lookup` cannot provide.
    pub fn missing_env<F>(&self, lookup: F) -> Vec<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.spec
            .expected_env
            .iter()
            .filter(|key| lookup(key).is_none_or(|v| v.is_empty()))
            .cloned()
            .collect()
    }

    /// The child command with `config` applied as flags and environment.
    pub fn command(&self, config: &ServerConfig) -> Command {
        let mut cmd = Command::new(&self.spec.command.program);
        cmd.args(self.spec.command.args_with_server(config))
            .envs(config.env_pairs())
            .current_dir(&self.spec.workdir)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        cmd
    }

    /// Run the server in the foreground until it exits.
    pub async fn run(mut self, config: ServerConfig) -> DockwrightResult<RunOutcome> {
        self.check_entry_module()?;

        for key in self.missing_env(|k| std::env::var(k).ok()) {
            tracing::warn!(variable = %key, "Expected application setting is not set");
        }

        if !config.is_wildcard() {
            tracing::warn!(
                address = %config.address,
                "Listen address is not a wildcard; the server will not be reachable from outside"
            );
        }

        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| DockwrightError::Internal(format!("failed to install SIGTERM handler: {e}")))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| DockwrightError::Internal(format!("failed to install SIGINT handler: {e}")))?;

        let mut child = self.command(&config).spawn().map_err(|e| {
            DockwrightError::Startup(format!(
                "failed to start {}: {}",
                self.spec.command.program, e
            ))
        })?;
        let pid = child.id().ok_or_else(|| {
            DockwrightError::Startup("server exited before its pid was known".to_string())
        })?;

        self.state.mark_running(pid)?;
        tracing::info!(
            pid,
            addr = %config.socket_addr(),
            command = %self.spec.command,
            "Server started"
        );

        let probe = self.spec.ready_timeout.map(|deadline| {
            let addr = config.probe_addr();
            tokio::spawn(async move {
                let ready = wait_until_listening(addr, deadline).await;
                match ready {
                    Some(elapsed) => {
                        tracing::info!(%addr, elapsed_ms = elapsed.as_millis() as u64, "Server is accepting connections")
                    }
                    None => tracing::warn!(%addr, timeout = ?deadline, "Server not accepting connections yet"),
                }
                ready
            })
        });

        let (status, killed) = tokio::select! {
            status = child.wait() => (wait_result(status)?, false),
            _ = sigterm.recv() => self.forward(&mut child, pid, Signal::SIGTERM).await?,
            _ = sigint.recv() => self.forward(&mut child, pid, Signal::SIGINT).await?,
        };

        let ready_after = match probe {
            Some(handle) if handle.is_finished() => handle.await.ok().flatten(),
            Some(handle) => {
                handle.abort();
                None
            }
            None => None,
        };

        let code = exit_code(&status);
        self.state.mark_finished(code, killed)?;

        let outcome = RunOutcome {
            status: self.state.status,
            exit_code: code,
            signal: terminating_signal(&status),
            ready_after,
        };
        tracing::info!(pid, exit_code = code, status = %outcome.status, "Server stopped");
        Ok(outcome)
    }

    /// Forward `sig` and wait out the grace period, then SIGKILL.
    async fn forward(
        &self,
        child: &mut Child,
        pid: u32,
        sig: Signal,
    ) -> DockwrightResult<(ExitStatus, bool)> {
        tracing::info!(pid, signal = ?sig, "Forwarding signal to server");
        if let Err(e) = send_signal(pid, sig) {
            tracing::warn!("{}", e);
        }

        match tokio::time::timeout(self.spec.grace_period, child.wait()).await {
            Ok(status) => Ok((wait_result(status)?, false)),
            Err(_) => {
                tracing::warn!(
                    pid,
                    grace_period = ?self.spec.grace_period,
                    "Server did not stop in time, sending SIGKILL"
                );
                child.start_kill().map_err(|e| {
                    DockwrightError::Internal(format!("failed to kill pid {pid}: {e}"))
                })?;
                Ok((wait_result(child.wait().await)?, true))
            }
        }
    }
}

fn wait_result(status: std::io::Result<ExitStatus>) -> DockwrightResult<ExitStatus> {
    status.map_err(|e| DockwrightError::Internal(format!("failed to wait for server: {e}")))
}
