//! Integration tests for the CLI's external contract: exit codes and
//! which stream each command writes to.

use assert_cmd::Command;
use predicates::prelude::*;

fn cli_cmd() -> Command {
    Command::cargo_bin("sonyfw").expect("the sonyfw binary should build")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sonyfw"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("sonyfw"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn info_on_missing_file_fails_with_a_clear_message() {
    cli_cmd()
        .args(["info", "/tmp/sonyfw-cli-contract-test-does-not-exist.dat"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("opening"));
}

#[test]
fn info_on_garbage_input_reports_no_recognised_format() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("garbage.bin");
    std::fs::write(&path, b"not a firmware image, just noise").expect("write fixture");

    cli_cmd()
        .args(["info", path.to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognised input"));
}

#[test]
fn unpack_refuses_a_non_dat_input() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = dir.path().join("garbage.bin");
    std::fs::write(&path, b"not a dat container").expect("write fixture");

    cli_cmd()
        .args(["unpack", path.to_str().expect("utf-8 path")])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a .dat container"));
}
