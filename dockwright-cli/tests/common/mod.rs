#![allow(dead_code)]

use assert_cmd::Command;
use dockwright_test_utils::ProjectTree;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
    pub project: ProjectTree,
}

impl TestContext {
    /// A fresh command sharing this context's home directory.
    pub fn new_cmd(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_dockwright"));
        cmd.timeout(Duration::from_secs(30));
        cmd.env_remove("RUST_LOG")
            .env_remove("DOCKWRIGHT_HOME")
            .env_remove("STREAMLIT_SERVER_PORT")
            .env_remove("STREAMLIT_SERVER_ADDRESS")
            .env_remove("STREAMLIT_SERVER_HEADLESS");
        cmd.arg("--home").arg(self.home.path());
        cmd
    }

    pub fn project_arg(&self) -> &str {
        self.project.path().to_str().unwrap()
    }
}

/// Isolated home plus a dashboard project to point commands at.
pub fn dockwright() -> TestContext {
    let home = tempfile::tempdir().unwrap();
    let project = ProjectTree::dashboard();
    let mut ctx = TestContext {
        cmd: Command::new(env!("CARGO_BIN_EXE_dockwright")),
        home,
        project,
    };
    ctx.cmd = ctx.new_cmd();
    ctx
}
