//! `dirrepl config`.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn dirrepl(config_dir: &TempDir) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dirrepl");
    cmd.env("DIRREPL_CONFIG_DIR", config_dir.path());
    for var in [
        "DIRREPL_SERVER_ID",
        "DIRREPL_GROUP_ID",
        "DIRREPL_ASSURED_TIMEOUT_MS",
        "DIRREPL_WINDOW_SIZE",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn show_layers_user_file_explicit_file_and_env() {
    let dir = TempDir::new().expect("tempdir");
    fs::write(
        dir.path().join("config.toml"),
        "[replication]\nserver_id = 7\nwindow_size = 40\n",
    )
    .expect("write user config");
    let explicit = dir.path().join("extra.toml");
    fs::write(&explicit, "[replication]\nwindow_size = 60\n").expect("write extra config");

    dirrepl(&dir)
        .env("DIRREPL_GROUP_ID", "3")
        .arg("--config")
        .arg(&explicit)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("server_id = 7"))
        .stdout(predicate::str::contains("window_size = 60"))
        .stdout(predicate::str::contains("group_id = 3"));
}

#[test]
fn path_points_into_config_dir() {
    let dir = TempDir::new().expect("tempdir");
    let expected = dir.path().join("config.toml");
    dirrepl(&dir)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected.display().to_string()));
}

#[test]
fn invalid_explicit_config_fails() {
    let dir = TempDir::new().expect("tempdir");
    let explicit = dir.path().join("bad.toml");
    fs::write(&explicit, "[replication]\nwindow_size = 0\n").expect("write bad config");

    dirrepl(&dir)
        .arg("--config")
        .arg(&explicit)
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("window_size"));
}
