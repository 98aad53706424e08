// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for Kea-Flock

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{tempdir, TempDir};

/// A `flock` invocation isolated from the caller's ssh config
fn flock(temp_dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("flock").unwrap();
    cmd.env_remove("RUST_LOG")
        .arg("--ssh-config")
        .arg(temp_dir.path().join("ssh_config"));
    cmd
}

/// The user a host resolves to with no ssh config entry and no override
fn local_user() -> String {
    kea_flock::identity::local_username().unwrap_or_else(|| "root".to_string())
}

fn write_recipe(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Test the version command
#[test]
fn test_version_command() {
    let mut cmd = Command::cargo_bin("flock").unwrap();
    cmd.arg("version");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Kea-Flock"))
        .stdout(predicate::str::contains("Fleet Runner"));
}

/// Test the help output
#[test]
fn test_help_command() {
    let mut cmd = Command::cargo_bin("flock").unwrap();
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Fleet Runner"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("hosts"));
}

/// Test validating a recipe
#[test]
fn test_validate_recipe() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "restart.toml",
        r#"
[meta]
name = "restart-nginx"

[required]
commands = ["sudo systemctl restart nginx"]
hosts = ["web-01", "web-02"]

[help]
short = "Restart nginx everywhere"
"#,
    );

    let mut cmd = flock(&temp_dir);
    cmd.arg("validate").arg(&recipe);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("restart-nginx"))
        .stdout(predicate::str::contains("is valid"))
        .stdout(predicate::str::contains("Restart nginx everywhere"))
        .stdout(predicate::str::contains("Hosts: 2"));
}

/// Test validating a recipe with no host source
#[test]
fn test_validate_invalid_recipe() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "invalid.toml",
        r#"
[required]
commands = ["uptime"]
"#,
    );

    let mut cmd = flock(&temp_dir);
    cmd.arg("validate").arg(&recipe);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("hosts or host_lookup_command"));
}

/// Test validating a recipe that does not exist
#[test]
fn test_validate_missing_recipe() {
    let temp_dir = tempdir().unwrap();

    let mut cmd = flock(&temp_dir);
    cmd.arg("validate").arg(temp_dir.path().join("nope.toml"));
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load recipe"));
}

/// Test listing hosts with users from the ssh config
#[test]
fn test_hosts_uses_ssh_config() {
    let temp_dir = tempdir().unwrap();
    std::fs::write(
        temp_dir.path().join("ssh_config"),
        "Host web-*\n    User deploy\n\nHost *\n    User ops\n",
    )
    .unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "hosts.toml",
        r#"
[required]
commands = ["uptime"]
hosts = ["web-01", "db-01:2222", "not a host"]
"#,
    );

    let mut cmd = flock(&temp_dir);
    cmd.arg("hosts").arg(&recipe);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("web-01:22 (user: deploy)"))
        .stdout(predicate::str::contains("db-01:2222 (user: ops)"))
        .stdout(predicate::str::contains("! "));
}

/// Test host discovery through a lookup command
#[test]
fn test_hosts_from_lookup_command() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "lookup.toml",
        r#"
[required]
commands = ["uptime"]
host_lookup_command = "echo app-01,app-02"
"#,
    );

    let user = local_user();
    let mut cmd = flock(&temp_dir);
    cmd.arg("hosts").arg(&recipe);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains(format!("app-01:22 (user: {})", user)))
        .stdout(predicate::str::contains(format!("app-02:22 (user: {})", user)));
}

/// Test that a failing lookup command fails the run
#[test]
fn test_failing_lookup_command() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "lookup.toml",
        r#"
[required]
commands = ["uptime"]
host_lookup_command = "false"
"#,
    );

    let mut cmd = flock(&temp_dir);
    cmd.arg("--dry-run").arg("run").arg(&recipe).arg("--yes");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("Host lookup command"));
}

/// Test running a recipe in dry-run mode
#[test]
fn test_run_dry_run() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "dry.toml",
        r#"
[meta]
name = "dry"

[required]
command = "hostname"
commands = ["uptime"]
hosts = ["web-01", "web-02:2222", "bad host"]

[overrides]
concurrency = 2
"#,
    );

    let user = local_user();
    let mut cmd = flock(&temp_dir);
    cmd.arg("--dry-run").arg("run").arg(&recipe).arg("--yes");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Starting recipe: dry"))
        .stdout(predicate::str::contains(format!(
            "web-01: [DRY RUN] Would run `hostname` as {}@web-01:22",
            user
        )))
        .stdout(predicate::str::contains(format!(
            "web-02: [DRY RUN] Would run `uptime` as {}@web-02:2222",
            user
        )))
        .stdout(predicate::str::contains(
            "Completed recipe: dry - 2 success | 0 failed | 2 total (1 invalid host entries dropped)",
        ));
}

/// Test the JSON tally
#[test]
fn test_run_json_summary() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(
        temp_dir.path(),
        "json.toml",
        r#"
[meta]
name = "json"

[required]
commands = ["uptime"]
hosts = ["a", "b", "c"]

[overrides]
user = "deploy"
"#,
    );

    let output = flock(&temp_dir)
        .arg("--dry-run")
        .arg("run")
        .arg(&recipe)
        .arg("--json")
        .output()
        .unwrap();
    assert!(output.status.success());

    let summary: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(summary["recipe"], "json");
    assert_eq!(summary["success"], 3);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["hosts"].as_array().unwrap().len(), 3);
    assert_eq!(summary["hosts"][0]["user"], "deploy");
}

/// Test init command creates a recipe file
#[test]
fn test_init_creates_recipe() {
    let temp_dir = tempdir().unwrap();
    let recipe = temp_dir.path().join("uptime.toml");

    let mut cmd = flock(&temp_dir);
    cmd.arg("init").arg(&recipe);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("Created recipe file"));

    let content = std::fs::read_to_string(&recipe).unwrap();
    assert!(content.contains("SPDX-License-Identifier"));
    assert!(content.contains("[resilience]"));

    let mut cmd = flock(&temp_dir);
    cmd.arg("validate").arg(&recipe);
    cmd.assert().success();
}

/// Test init refuses to overwrite without --force
#[test]
fn test_init_force() {
    let temp_dir = tempdir().unwrap();
    let recipe = write_recipe(temp_dir.path(), "existing.toml", "old content");

    let mut cmd = flock(&temp_dir);
    cmd.arg("init").arg(&recipe);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    let mut cmd = flock(&temp_dir);
    cmd.arg("init").arg(&recipe).arg("--force");
    cmd.assert().success();

    let content = std::fs::read_to_string(&recipe).unwrap();
    assert!(!content.contains("old content"));
    assert!(content.contains("name = \"uptime\""));
}
