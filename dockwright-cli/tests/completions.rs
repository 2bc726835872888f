use predicates::prelude::*;
use rstest::rstest;

mod common;

#[rstest]
#[case("bash")]
#[case("zsh")]
#[case("fish")]
#[case("elvish")]
fn test_completions_generate(#[case] shell: &str) {
    let mut ctx = common::dockwright();
    ctx.cmd
        .args(["completions", shell])
        .assert()
        .success()
        .stdout(predicate::str::contains("dockwright"));
}

#[test]
fn test_completions_unknown_shell() {
    let mut ctx = common::dockwright();
    ctx.cmd.args(["completions", "tcsh"]).assert().failure();
}
