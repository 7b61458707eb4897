//! `dirrepl simulate` against in-process meshes.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn dirrepl(config_dir: &TempDir) -> Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("dirrepl");
    cmd.env("DIRREPL_CONFIG_DIR", config_dir.path());
    cmd.env_remove("DIRREPL_LOG");
    cmd
}

#[test]
fn safe_read_run_reports_every_write_acked() {
    let dir = TempDir::new().expect("tempdir");
    let output = dirrepl(&dir)
        .args([
            "--json",
            "simulate",
            "--relays",
            "2",
            "--readers",
            "2",
            "--mode",
            "safe-read",
            "--writes",
            "3",
        ])
        .output()
        .expect("run dirrepl");
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["writes"], 3);
    assert_eq!(report["acked"], 3);
    assert_eq!(report["timed_out"], 0);
    assert_eq!(report["monitor"]["safe_read"]["sent_updates"], 3);
    assert_eq!(report["monitor"]["safe_read"]["acknowledged_updates"], 3);
}

#[test]
fn failing_reader_shows_up_in_the_human_report() {
    let dir = TempDir::new().expect("tempdir");
    dirrepl(&dir)
        .args([
            "simulate",
            "--readers",
            "1",
            "--failing",
            "1",
            "--mode",
            "safe-read",
            "--writes",
            "2",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 writes, safe-read"))
        .stdout(predicate::str::contains("degraded: 2"))
        .stdout(predicate::str::contains("server 3: 2 not acked"));
}

#[test]
fn stalled_reader_times_out() {
    let dir = TempDir::new().expect("tempdir");
    let output = dirrepl(&dir)
        .args([
            "--json",
            "simulate",
            "--readers",
            "0",
            "--stalled",
            "1",
            "--mode",
            "safe-read",
            "--writes",
            "1",
            "--timeout-ms",
            "200",
        ])
        .output()
        .expect("run dirrepl");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json report");
    assert_eq!(report["timed_out"], 1);
    assert_eq!(report["monitor"]["safe_read"]["timeout_updates"], 1);
}

#[test]
fn zero_safe_data_level_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    dirrepl(&dir)
        .args(["simulate", "--mode", "safe-data", "--level", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("level"));
}
