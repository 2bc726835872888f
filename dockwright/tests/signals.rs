//! Signal forwarding through a running launcher.
//!
//! Kept in its own test binary: the launcher listens for SIGTERM on the
//! whole process, so any concurrently running launcher would see it too.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use dockwright::launcher::{
    LaunchSpec, Launcher, RunOutcome, RunStatus, ServerConfig, StartupCommand,
};
use dockwright_test_utils::ProjectTree;

fn long_running_server(project: &ProjectTree, body: &str) -> StartupCommand {
    let script = project.join("bin/fake-streamlit");
    project.write("bin/fake-streamlit", &format!("#!/bin/sh\n{body}\n"));
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    StartupCommand::run_module(script.to_str().unwrap(), "streamlit_app.py", true, &[])
}

/// Run the launcher, SIGTERM this process once the server is up, and
/// return how the server ended.
async fn terminate_running(body: &str, grace_period: Duration) -> RunOutcome {
    let project = ProjectTree::dashboard();
    let launcher = Launcher::new(LaunchSpec {
        workdir: project.path().to_path_buf(),
        command: long_running_server(&project, body),
        expected_env: vec![],
        ready_timeout: None,
        grace_period,
    });

    let running = tokio::spawn(launcher.run(ServerConfig::default()));

    let marker = project.join("started.txt");
    let mut waited = Duration::ZERO;
    while !marker.exists() {
        assert!(waited < Duration::from_secs(10), "server never started");
        tokio::time::sleep(Duration::from_millis(50)).await;
        waited += Duration::from_millis(50);
    }

    kill(Pid::this(), Signal::SIGTERM).unwrap();
    tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .expect("launcher returned")
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_sigterm_is_forwarded_to_server() {
    let outcome =
        terminate_running("echo up > started.txt\nexec sleep 30", Duration::from_secs(5)).await;
    assert_eq!(outcome.status, RunStatus::Exited);
    assert_eq!(outcome.exit_code, 128 + libc::SIGTERM);
    assert_eq!(outcome.signal, Some(libc::SIGTERM));

    let outcome = terminate_running(
        "trap '' TERM\necho up > started.txt\nwhile :; do sleep 0.1; done",
        Duration::from_millis(300),
    )
    .await;
    assert_eq!(outcome.status, RunStatus::Killed);
    assert_eq!(outcome.exit_code, 128 + libc::SIGKILL);
    assert_eq!(outcome.signal, Some(libc::SIGKILL));
}
