//! Process helpers: exit status mapping and signal delivery.

use std::process::ExitStatus;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use dockwright_shared::errors::{DockwrightError, DockwrightResult};

/// Shell convention: a process killed by signal N reports 128 + N.
const SIGNAL_EXIT_BASE: i32 = 128;

/// Map an exit status to the code a container runtime would report.
pub fn exit_code(status: &ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;

    if let Some(code) = status.code() {
        return code;
    }

    status
        .signal()
        .map(|sig| SIGNAL_EXIT_BASE + sig)
        .unwrap_or(1)
}

/// Signal number that terminated the process, if any.
pub fn terminating_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

/// Deliver `signal` to `pid`.
pub fn send_signal(pid: u32, signal: Signal) -> DockwrightResult<()> {
    kill(Pid::from_raw(pid as i32), signal).map_err(|e| {
        DockwrightError::Internal(format!("failed to send {:?} to pid {}: {}", signal, pid, e))
    })
}
