//! Smoke tests for the `dynamo-lite-node` binary's CLI surface.
use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_required_flags() {
    let mut cmd = Command::cargo_bin("dynamo-lite-node").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--node-id"))
        .stdout(predicate::str::contains("--data-dir"));
}

#[test]
fn missing_required_args_fails_with_usage() {
    let mut cmd = Command::cargo_bin("dynamo-lite-node").unwrap();
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("node-id"));
}
