use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::{TempDir, tempdir};

fn write_config(dir: &TempDir, body: &str) -> PathBuf {
    let path = dir.path().join("weigh.toml");
    fs::write(&path, body).unwrap();
    path
}

const VALID: &str = r#"
machine_id = "m1"
[source]
mode = "simulated"
[serial]
parse_divisor = 1000.0
[print]
secret = "s3cret"
"#;

fn weigh(cfg: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("weigh").unwrap();
    cmd.arg("--config").arg(cfg).env_remove("RUST_LOG");
    cmd
}

#[rstest]
#[case(&["--help"], 0, "Usage:")]
#[case(&["check-config"], 0, "config ok: machine m1")]
#[case(&["parse", "--frame", r"\x0215240\x03\x0215250\x03"], 0, "frame 1: 15.25")]
#[case(&["parse", "--frame", r"\x02ERR\x03"], 0, "frame 0: no match")]
fn cli_table_cases(#[case] args: &[&str], #[case] code: i32, #[case] needle: &str) {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);
    weigh(&cfg)
        .args(args)
        .assert()
        .code(code)
        .stdout(predicate::str::contains(needle));
}

#[test]
fn check_config_json_summary_lists_topics() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);
    let out = weigh(&cfg).args(["--json", "check-config"]).output().unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["ok"], true);
    assert_eq!(v["topics"][0], "weigh/m1/reading");
    assert!(v["backend"].is_null());
}

#[test]
fn parse_json_reports_values() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);
    let out = weigh(&cfg)
        .args(["--json", "parse", "--frame", r"\x0215240\x03"])
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["values"][0].as_f64(), Some(15.24));
}

#[test]
fn missing_secret_is_a_config_error() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, "machine_id = \"m1\"\n[source]\nmode = \"simulated\"\n");
    weigh(&cfg)
        .arg("check-config")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("print.secret"));
}

#[test]
fn json_errors_are_structured() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, "machine_id = \"\"\n");
    let out = weigh(&cfg).args(["--json", "check-config"]).output().unwrap();
    assert_eq!(out.status.code(), Some(2));
    let line = String::from_utf8_lossy(&out.stderr);
    let last = line.lines().last().unwrap();
    let v: serde_json::Value = serde_json::from_str(last).unwrap();
    assert_eq!(v["reason"], "Config");
}

#[test]
fn unreadable_config_points_at_flag() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    weigh(&missing)
        .arg("check-config")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--config"));
}

#[test]
fn log_file_is_created_when_configured() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("logs").join("weigh.log");
    let body = format!("{VALID}\n[logging]\nfile = {:?}\n", log.to_string_lossy());
    let cfg = write_config(&dir, &body);
    weigh(&cfg).arg("check-config").assert().success();
    assert!(log.parent().unwrap().is_dir());
}

fn health_config(dir: &TempDir) -> PathBuf {
    let snapshot = dir.path().join("health.json");
    write_config(
        dir,
        &format!("{VALID}\n[health]\nfile = {:?}\ninterval_s = 5\n", snapshot.display().to_string()),
    )
}

fn write_snapshot(dir: &TempDir, status: &str, written_ago_s: i64, sample_ago_s: i64) {
    let now = chrono::Utc::now();
    let iso = |ago: i64| (now - chrono::Duration::seconds(ago)).to_rfc3339_opts(chrono::SecondsFormat::Millis, true);
    let snap = serde_json::json!({
        "status": status,
        "machineId": "m1",
        "writtenAt": iso(written_ago_s),
        "broker": "connected",
        "transport": "connected",
        "lastWeight": 15.25,
        "lastWeightTs": iso(sample_ago_s),
        "ageSec": 0.1,
        "offlineBuffered": 0,
        "backendQueue": 0,
    });
    fs::write(dir.path().join("health.json"), snap.to_string()).unwrap();
}

#[test]
fn health_reports_a_fresh_snapshot() {
    let dir = tempdir().unwrap();
    let cfg = health_config(&dir);
    write_snapshot(&dir, "ok", 1, 2);
    let out = weigh(&cfg).args(["--json", "health"]).output().unwrap();
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["healthy"], true);
    assert_eq!(v["machineId"], "m1");
    assert!(v["ageSec"].as_f64().is_some_and(|a| (1.5..10.0).contains(&a)));
}

#[rstest]
#[case::agent_reports_stale("stale", 1, 2, "stale")]
#[case::silent_scale("ok", 1, 600, "no reading")]
#[case::writer_gone("ok", 120, 120, "not running")]
fn health_fails_when_unhealthy(
    #[case] status: &str,
    #[case] written_ago_s: i64,
    #[case] sample_ago_s: i64,
    #[case] needle: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = health_config(&dir);
    write_snapshot(&dir, status, written_ago_s, sample_ago_s);
    weigh(&cfg)
        .arg("health")
        .assert()
        .code(1)
        .stderr(predicate::str::contains(needle));
}

#[test]
fn health_without_snapshot_path_is_a_config_error() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, VALID);
    weigh(&cfg)
        .arg("health")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("health.file"));
}
