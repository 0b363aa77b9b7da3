//! CLI command contract tests
//!
//! Runs the `ruguard` binary against temp configs and audit databases.
//!
//! Contract guarantees tested:
//! - Deterministic exit codes
//! - Stable JSON shape in `--json` mode
//! - Actionable error messages for failure paths

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

use ruguard_core::fingerprint::QueryFingerprint;
use ruguard_core::governor::epoch_ms;
use ruguard_core::group::{RunawayAction, WatchType};
use ruguard_core::recorder::{MatchType, RunawayEvent};
use ruguard_core::store::{AuditStore, SqliteAuditStore};
use ruguard_core::watch::WatchEntry;

// =============================================================================
// Fixture helpers
// =============================================================================

fn ruguard() -> Command {
    let mut cmd = Command::cargo_bin("ruguard").expect("binary built");
    cmd.env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("ruguard.toml");
    std::fs::write(
        &path,
        r#"
[[groups]]
name = "rg1"
ru_per_sec = 1000
burstable = "moderated"

[groups.query_limit]
exec_elapsed = "50ms"
action = "kill"
watch = "similar"
watch_duration = "10m"

[[groups]]
name = "rg2"
ru_per_sec = 500
"#,
    )
    .expect("write config");
    path
}

fn event(group: &str, sql: &str, match_type: MatchType, start: u64) -> RunawayEvent {
    RunawayEvent::new(
        group,
        &QueryFingerprint::new(sql),
        match_type,
        &RunawayAction::Kill,
        "ElapsedTime = 60ms(>50ms)",
        start,
    )
}

fn populated_db(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("audit.db");
    let store = SqliteAuditStore::open(&path).expect("open store");
    let now = epoch_ms();
    store
        .insert_queries(&[
            event("rg1", "select * from t where id = 1", MatchType::Identify, now - 1_000),
            event("rg1", "select * from t where id = 1", MatchType::Watch, now - 500),
            event("rg2", "select count(*) from u", MatchType::Identify, 1_000),
        ])
        .expect("insert queries");
    let fp = QueryFingerprint::new("select * from t where id = 1");
    let live = WatchEntry::for_query(
        "rg1",
        WatchType::Similar,
        &fp,
        RunawayAction::Kill,
        now - 1_000,
        Some(now + 600_000),
    )
    .expect("live watch");
    let expired = WatchEntry::for_query(
        "rg1",
        WatchType::Exact,
        &fp,
        RunawayAction::Cooldown,
        1_000,
        Some(2_000),
    )
    .expect("expired watch");
    store.upsert_watches(&[live, expired]).expect("insert watches");
    path
}

fn db_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

// =============================================================================
// check
// =============================================================================

#[test]
fn check_prints_seeded_groups() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir);
    ruguard()
        .args(["check", "--config"])
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("3 group(s)"))
        .stdout(predicate::str::contains("rg1"))
        .stdout(predicate::str::contains("burst_limit=-2"))
        .stdout(predicate::str::contains("ACTION=KILL"));
}

#[test]
fn check_json_lists_groups() {
    let dir = TempDir::new().expect("temp dir");
    let config = write_config(&dir);
    let output = ruguard()
        .args(["--json", "check", "--config"])
        .arg(&config)
        .output()
        .expect("run");
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    let groups = value.as_array().expect("array");
    assert_eq!(groups.len(), 3);
    let names: Vec<&str> = groups.iter().filter_map(|g| g["name"].as_str()).collect();
    assert_eq!(names, vec!["default", "rg1", "rg2"]);
    assert_eq!(groups[1]["burst_limit"], -2);
    assert_eq!(groups[2]["burst_limit"], 500);
}

#[test]
fn check_reports_invalid_config_with_remediation() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("bad.toml");
    std::fs::write(
        &path,
        r#"
[[groups]]
name = "rg1"
ru_per_sec = 10
[groups.query_limit]
exec_elapsed = "15d"
action = "kill"
"#,
    )
    .expect("write");
    ruguard()
        .args(["check", "--config"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown unit"))
        .stderr(predicate::str::contains("ruguard check"));
}

#[test]
fn check_missing_config_fails() {
    let dir = TempDir::new().expect("temp dir");
    ruguard()
        .args(["check", "--config"])
        .arg(dir.path().join("nope.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));
}

// =============================================================================
// queries / watches
// =============================================================================

#[test]
fn queries_filters_by_group_and_match_type() {
    let dir = TempDir::new().expect("temp dir");
    let db = populated_db(&dir);

    let output = ruguard()
        .args(["--json", "queries", "--db", &db_arg(&db), "--group", "rg1"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(rows.as_array().map(Vec::len), Some(2));
    assert_eq!(rows[0]["match_type"], "watch");

    ruguard()
        .args(["queries", "--db", &db_arg(&db), "--match-type", "identify"])
        .assert()
        .success()
        .stdout(predicate::str::contains("select count(*) from u"))
        .stdout(predicate::str::contains("ElapsedTime = 60ms(>50ms)"));
}

#[test]
fn queries_missing_db_fails() {
    let dir = TempDir::new().expect("temp dir");
    ruguard()
        .args(["queries", "--db"])
        .arg(dir.path().join("missing.db"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("audit database not found"));
    assert!(!dir.path().join("missing.db").exists());
}

#[test]
fn watches_hide_expired_unless_all() {
    let dir = TempDir::new().expect("temp dir");
    let db = populated_db(&dir);

    let output = ruguard()
        .args(["--json", "watches", "--db", &db_arg(&db)])
        .output()
        .expect("run");
    let rows: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(rows.as_array().map(Vec::len), Some(1));
    assert_eq!(rows[0]["watch_type"], "similar");

    ruguard()
        .args(["watches", "--all", "--db", &db_arg(&db)])
        .assert()
        .success()
        .stdout(predicate::str::contains("COOLDOWN"))
        .stdout(predicate::str::contains("SIMILAR"));
}

// =============================================================================
// gc
// =============================================================================

#[test]
fn gc_purges_old_rows_and_expired_watches() {
    let dir = TempDir::new().expect("temp dir");
    let db = populated_db(&dir);

    let output = ruguard()
        .args(["--json", "gc", "--db", &db_arg(&db), "--retention-hours", "1"])
        .output()
        .expect("run");
    assert!(output.status.success());
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json");
    assert_eq!(report["purged_queries"], 1);
    assert_eq!(report["purged_watches"], 1);

    let store = SqliteAuditStore::open(&db).expect("reopen");
    assert_eq!(store.list_watches().expect("watches").len(), 1);
}

#[test]
fn unknown_log_format_is_usage_error() {
    ruguard()
        .args(["--log-format", "xml", "gc"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown log format"));
}
