//! End-to-end checks driving the `rootcheck` binary against fixture IR.

use std::process::Command;

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_rootcheck")
}

#[test]
fn prints_usage_with_no_arguments() {
    let output = Command::new(bin()).output().expect("failed to run rootcheck");
    assert!(!output.status.success());
}

#[test]
fn unknown_subcommand_fails_cleanly() {
    let output = Command::new(bin())
        .args(["not-a-real-command"])
        .output()
        .expect("failed to run rootcheck");
    assert!(!output.status.success());
}

#[test]
fn missing_base_module_reports_an_error() {
    let output = Command::new(bin())
        .args(["balance-check", "/nonexistent/path/module.bc"])
        .output()
        .expect("failed to run rootcheck");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error"));
}
