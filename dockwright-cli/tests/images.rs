use predicates::prelude::*;

mod common;

#[test]
fn test_images_empty_home_shows_header() {
    let mut ctx = common::dockwright();
    ctx.cmd
        .arg("images")
        .assert()
        .success()
        .stdout(predicate::str::contains("TAG"))
        .stdout(predicate::str::contains("DIGEST"));
}

#[test]
fn test_images_alias_ls() {
    let mut ctx = common::dockwright();
    ctx.cmd.args(["ls", "-q"]).assert().success().stdout("");
}

#[test]
fn test_inspect_unknown_tag_fails() {
    let mut ctx = common::dockwright();
    ctx.cmd
        .args(["inspect", "nothing:latest"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no such image: nothing:latest"));
}

#[test]
fn test_export_unknown_tag_fails() {
    let ctx = common::dockwright();
    let dest = tempfile::tempdir().unwrap();
    ctx.new_cmd()
        .args(["export", "nothing:latest", dest.path().to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no such image"));
}

#[tokio::test]
async fn test_listed_image_can_be_inspected() {
    use dockwright::builder::BuildRequest;
    use dockwright::recipe::BuildRecipe;
    use dockwright_test_utils::{ProjectTree, ScriptedRunner, TestBuilder};

    let t = TestBuilder::new(ScriptedRunner::succeeding());
    let project = ProjectTree::dashboard();
    t.builder
        .build(BuildRequest {
            context_dir: project.path().to_path_buf(),
            recipe: BuildRecipe::default(),
            tag: "dashboard:inspect".to_string(),
        })
        .await
        .unwrap();

    let cmd = || {
        let mut cmd = assert_cmd::Command::new(env!("CARGO_BIN_EXE_dockwright"));
        cmd.arg("--home").arg(t.home.path());
        cmd
    };

    cmd()
        .args(["images", "-q"])
        .assert()
        .success()
        .stdout("dashboard:inspect\n");

    cmd()
        .args(["inspect", "--command", "dashboard:inspect"])
        .assert()
        .success()
        .stdout("streamlit run streamlit_app.py --server.fileWatcherType=none\n");

    cmd()
        .args(["inspect", "dashboard:inspect"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"8501/tcp\""));
}
