//! Smoke tests for the agent-mesh binary

use assert_cmd::Command;
use std::fs;
use tempfile::tempdir;

#[test]
fn test_version() {
    let mut cmd = Command::cargo_bin("agent-mesh").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains(concat!("agent-mesh ", env!("CARGO_PKG_VERSION"))));
}

#[test]
fn test_help() {
    let mut cmd = Command::cargo_bin("agent-mesh").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Join an agent network"))
        .stdout(predicates::str::contains("--capability"));
}

#[test]
fn test_unparseable_config_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("broken.json");
    fs::write(&path, "{ not json").unwrap();

    let mut cmd = Command::cargo_bin("agent-mesh").unwrap();
    cmd.arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicates::str::contains("Failed to load"));
}

#[test]
fn test_out_of_range_config_value() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("team.yaml");
    fs::write(&path, "network:\n  registry:\n    initialTrust: 3.5\n").unwrap();

    let mut cmd = Command::cargo_bin("agent-mesh").unwrap();
    cmd.arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicates::str::contains("initialTrust"));
}

#[test]
fn test_unsupported_url() {
    let mut cmd = Command::cargo_bin("agent-mesh").unwrap();
    cmd.args(["--url", "redis://localhost:6379", "--agent-id", "smoke"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("unsupported transport url"));
}

#[test]
fn test_bad_interval() {
    let mut cmd = Command::cargo_bin("agent-mesh").unwrap();
    cmd.args(["--presence-interval", "soon"])
        .assert()
        .failure()
        .stderr(predicates::str::contains("Invalid duration format"));
}
