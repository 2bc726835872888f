//! Run-step execution inside a staged root filesystem.
//!
//! Production builds use bubblewrap: the staged rootfs is bound at `/`, with
//! fresh `/dev`, `/proc` and `/tmp`, the host network shared, and the image
//! environment replacing the caller's.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

use crate::pipeline::BuildStage;
use crate::util::{find_executable, process::exit_code};

/// Number of trailing stderr lines kept for error reports.
const STDERR_TAIL: usize = 20;

/// A shell command to run in a staged root filesystem.
#[derive(Debug, Clone)]
pub struct RunInvocation {
    pub stage: BuildStage,
    pub rootfs: PathBuf,
    pub workdir: String,
    pub command: String,
    pub env: Vec<(String, String)>,
}

/// Result of a finished run step.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stderr_tail: Vec<String>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Executes run steps. Returns `Err` only when the command could not be run
/// at all; a command that ran and failed yields a non-zero `exit_code`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, invocation: &RunInvocation) -> DockwrightResult<RunOutput>;
}

/// Builder for `bwrap` arguments.
#[derive(Debug, Clone, Default)]
pub struct BwrapCommand {
    args: Vec<String>,
}

impl BwrapCommand {
    pub fn new() -> Self {
        Self::default()
    }

    fn push_path(&mut self, flag: &str, path: impl AsRef<Path>) {
        self.args.push(flag.to_string());
        self.args.push(path.as_ref().to_string_lossy().to_string());
    }

    /// Map the caller to root inside a new user namespace.
    pub fn as_namespace_root(mut self) -> Self {
        self.args.extend(
            ["--unshare-user", "--uid", "0", "--gid", "0", "--unshare-ipc", "--unshare-uts"]
                .map(String::from),
        );
        self
    }

    pub fn with_die_with_parent(mut self) -> Self {
        self.args.push("--die-with-parent".to_string());
        self
    }

    pub fn bind(mut self, src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Self {
        self.push_path("--bind", src);
        self.args.push(dest.as_ref().to_string_lossy().to_string());
        self
    }

    pub fn ro_bind_if_exists(mut self, src: impl AsRef<Path>, dest: impl AsRef<Path>) -> Self {
        if src.as_ref().exists() {
            self.push_path("--ro-bind", src);
            self.args.push(dest.as_ref().to_string_lossy().to_string());
        }
        self
    }

    pub fn with_dev(mut self) -> Self {
        self.push_path("--dev", "/dev");
        self
    }

    pub fn with_proc(mut self) -> Self {
        self.push_path("--proc", "/proc");
        self
    }

    pub fn tmpfs(mut self, path: impl AsRef<Path>) -> Self {
        self.push_path("--tmpfs", path);
        self
    }

    pub fn with_clearenv(mut self) -> Self {
        self.args.push("--clearenv".to_string());
        self
    }

    pub fn setenv(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.args.push("--setenv".to_string());
        self.args.push(key.into());
        self.args.push(value.into());
        self
    }

    pub fn chdir(mut self, path: impl AsRef<Path>) -> Self {
        self.push_path("--chdir", path);
        self
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Final command: `bwrap <args> -- <executable> <args...>`.
    pub fn build(self, bwrap: &Path, executable: &str, args: &[String]) -> Command {
        let mut cmd = Command::new(bwrap);
        cmd.args(&self.args);
        cmd.arg("--");
        cmd.arg(executable);
        cmd.args(args);
        cmd
    }
}

/// Runs steps under bubblewrap.
#[derive(Debug, Clone)]
pub struct BwrapRunner {
    bwrap: PathBuf,
    shell: String,
}

impl BwrapRunner {
    /// Locate `bwrap` on `PATH`.
    pub fn new() -> DockwrightResult<Self> {
        let bwrap = find_executable("bwrap").map_err(|e| {
            DockwrightError::Execution(format!(
                "bubblewrap is required to run build steps: {e}"
            ))
        })?;
        Ok(Self::with_binary(bwrap))
    }

    pub fn with_binary(bwrap: PathBuf) -> Self {
        Self {
            bwrap,
            shell: "/bin/sh".to_string(),
        }
    }

    pub fn command_for(&self, invocation: &RunInvocation) -> BwrapCommand {
        let mut cmd = BwrapCommand::new()
            .as_namespace_root()
            .with_die_with_parent()
            .bind(&invocation.rootfs, "/")
            .with_dev()
            .with_proc()
            .tmpfs("/tmp")
            .ro_bind_if_exists("/etc/resolv.conf", "/etc/resolv.conf")
            .with_clearenv();

        for (key, value) in &invocation.env {
            cmd = cmd.setenv(key, value);
        }

        cmd.chdir(&invocation.workdir)
    }
}

#[async_trait]
impl CommandRunner for BwrapRunner {
    async fn run(&self, invocation: &RunInvocation) -> DockwrightResult<RunOutput> {
        let mut command = self.command_for(invocation).build(
            &self.bwrap,
            &self.shell,
            &["-c".to_string(), invocation.command.clone()],
        );
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(stage = %invocation.stage, command = %invocation.command, "Spawning run step");

        let mut child = command.spawn().map_err(|e| {
            DockwrightError::Execution(format!("failed to spawn {}: {}", self.bwrap.display(), e))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| DockwrightError::Internal("child stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| DockwrightError::Internal("child stderr not captured".to_string()))?;

        let (_, stderr_tail, status) = tokio::join!(
            relay_lines(stdout, false),
            relay_lines(stderr, true),
            child.wait()
        );

        let status = status.map_err(|e| {
            DockwrightError::Execution(format!("failed to wait for run step: {e}"))
        })?;

        Ok(RunOutput {
            exit_code: exit_code(&status),
            stderr_tail,
        })
    }
}

/// Re-log a child stream line by line; stderr lines are also kept as a tail.
async fn relay_lines<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) -> Vec<String> {
    let mut lines = BufReader::new(reader).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let clean = strip_ansi_codes(&line);
                if is_stderr {
                    tracing::warn!(target: "dockwright::step", "{}", clean);
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(clean);
                } else {
                    tracing::debug!(target: "dockwright::step", "{}", clean);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Stopped reading step output: {}", e);
                break;
            }
        }
    }

    tail.into_iter().collect()
}

/// Strip `ESC [ ... <letter>` sequences from child output.
pub(crate) fn strip_ansi_codes(text: &str) -> String {
    let mut result = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c == '\x1b' {
            if chars.next() == Some('[') {
                for next in chars.by_ref() {
                    if next.is_ascii_alphabetic() {
                        break;
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}
