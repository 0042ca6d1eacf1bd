use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;

fn jumptunnel() -> Command {
    let mut cmd = Command::cargo_bin("jumptunnel").unwrap();
    cmd.env_remove("JUMPTUNNEL_CONFIG")
        .env_remove("JUMPTUNNEL_JUMP_HOST")
        .env_remove("JUMPTUNNEL_SOCKS_PORT");
    cmd
}

#[test]
fn test_help_lists_commands() {
    jumptunnel()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("open"))
        .stdout(predicate::str::contains("gatling"))
        .stdout(predicate::str::contains("completions"));
}

#[test]
fn test_completions_bash() {
    jumptunnel()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("jumptunnel"));
}

#[test]
fn test_config_init_then_show() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("config.toml");
    let path_str = path.to_str().unwrap();

    jumptunnel()
        .args(["config", "init", "--config", path_str])
        .assert()
        .success()
        .stdout(predicate::str::contains("Wrote"));

    let written = fs::read_to_string(&path).unwrap();
    assert!(written.contains("[jump]"));
    assert!(written.contains("socks_port = 5555"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
    }

    jumptunnel()
        .args(["config", "init", "--config", path_str])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));

    jumptunnel()
        .args(["config", "show", "--config", path_str])
        .env("JUMPTUNNEL_SOCKS_PORT", "6000")
        .assert()
        .success()
        .stdout(predicate::str::contains("socks_port = 6000"));
}

#[test]
fn test_invalid_env_override_names_variable() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    jumptunnel()
        .args(["config", "show", "--config", path.to_str().unwrap()])
        .env("JUMPTUNNEL_SOCKS_PORT", "not-a-port")
        .assert()
        .failure()
        .stderr(predicate::str::contains("JUMPTUNNEL_SOCKS_PORT"));
}

#[test]
fn test_open_without_jump_host_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");

    jumptunnel()
        .args(["open", "--config", path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("missing jump host configuration"));
}
