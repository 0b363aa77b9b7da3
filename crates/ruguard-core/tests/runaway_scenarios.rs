//! End-to-end runaway scenarios through the governor facade.
//!
//! Covers:
//! - kill on elapsed time, audited once as `identify`
//! - continuation: a watched fingerprint is quarantined before it runs
//! - watch expiry: the same query must breach again to be caught
//! - identical repeats inside one flush window collapse into one row;
//!   literal variants stay separate
//! - cooldown, dryrun and switch-group outcomes
//! - watches and audit rows survive a restart on SQLite

use std::sync::Arc;
use std::time::Duration;

use ruguard_core::config::GovernorConfig;
use ruguard_core::detector::DetectorState;
use ruguard_core::group::{RuRate, RunawayAction, WatchType};
use ruguard_core::options::{AlterOption, QueryLimitOption, WatchDuration};
use ruguard_core::recorder::MatchType;
use ruguard_core::store::{AuditStore, MemoryAuditStore, QueryFilter, SqliteAuditStore};
use ruguard_core::{ResourceGovernor, RunawayError};

const T0: u64 = 1_700_000_000_000;
const WATCH_MS: u64 = 10_000;

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn governor() -> (ResourceGovernor, Arc<MemoryAuditStore>) {
    let store = Arc::new(MemoryAuditStore::new());
    let gov = ResourceGovernor::new(GovernorConfig::default(), store.clone());
    (gov, store)
}

fn query_limit(limit: Vec<QueryLimitOption>) -> Vec<AlterOption> {
    vec![
        AlterOption::RuPerSec(RuRate::Limited(1000)),
        AlterOption::QueryLimit(limit),
    ]
}

fn kill_after_50ms(watch: WatchType) -> Vec<AlterOption> {
    query_limit(vec![
        QueryLimitOption::ExecElapsed(Duration::from_millis(50)),
        QueryLimitOption::Action(RunawayAction::Kill),
        QueryLimitOption::Watch(
            watch,
            Some(WatchDuration::Finite(Duration::from_millis(WATCH_MS))),
        ),
    ])
}

fn rows(store: &dyn AuditStore, match_type: Option<MatchType>) -> Vec<ruguard_core::recorder::RunawayEvent> {
    store
        .list_queries(&QueryFilter {
            match_type,
            ..QueryFilter::default()
        })
        .unwrap()
}

// ─────────────────────────────────────────────────────────────────────────────
// Kill and continuation
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn slow_query_is_killed_and_recorded_once() {
    let (gov, store) = governor();
    gov.create_group("rg1", &kill_after_50ms(WatchType::Similar), false)
        .unwrap();

    let mut run = gov
        .begin_query("rg1", "select * from t where id = 1", T0)
        .unwrap();
    run.checkpoint(T0 + 30).unwrap();
    let err = run.checkpoint(T0 + 60).unwrap_err();
    match &err {
        RunawayError::Killed { group, cause } => {
            assert_eq!(group, "rg1");
            assert_eq!(cause, "ElapsedTime = 60ms(>50ms)");
        }
        other => panic!("expected kill, got {other:?}"),
    }
    assert!(run.cancel_token().is_cancelled());
    assert_eq!(run.finish().state, DetectorState::Identified);

    // Nothing is visible before maintenance runs.
    assert!(rows(store.as_ref(), None).is_empty());
    let report = gov.run_maintenance(T0 + 100);
    assert_eq!(report.flushed_events, 1);
    assert_eq!(report.persisted_watches, 1);

    let persisted = rows(store.as_ref(), None);
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].match_type, MatchType::Identify);
    assert_eq!(persisted[0].group, "rg1");
    assert_eq!(persisted[0].action, "KILL");
}

#[test]
fn repeated_query_is_quarantined_before_execution() {
    let (gov, store) = governor();
    gov.create_group("rg1", &kill_after_50ms(WatchType::Similar), false)
        .unwrap();

    let mut run = gov
        .begin_query("rg1", "select * from t where id = 1", T0)
        .unwrap();
    assert!(run.checkpoint(T0 + 60).is_err());

    // Same shape, different literal.
    let err = gov
        .begin_query("rg1", "select * from t where id = 2", T0 + 1_000)
        .unwrap_err();
    assert!(matches!(err, RunawayError::Quarantine { ref group, .. } if group == "rg1"));

    gov.run_maintenance(T0 + 2_000);
    assert_eq!(rows(store.as_ref(), Some(MatchType::Identify)).len(), 1);
    let watched = rows(store.as_ref(), Some(MatchType::Watch));
    assert_eq!(watched.len(), 1);
    assert_eq!(watched[0].sample_sql, "select * from t where id = 2");
    assert!(watched[0].rule.starts_with("SIMILAR = "));
}

#[test]
fn watch_is_scoped_to_its_group() {
    let (gov, _) = governor();
    gov.create_group("rg1", &kill_after_50ms(WatchType::Exact), false)
        .unwrap();
    gov.create_group("rg2", &[AlterOption::RuPerSec(RuRate::Limited(500))], false)
        .unwrap();

    let mut run = gov.begin_query("rg1", "select sleep(1)", T0).unwrap();
    assert!(run.checkpoint(T0 + 60).is_err());

    assert!(gov.begin_query("rg2", "select sleep(1)", T0 + 10).is_ok());
    assert!(gov.begin_query("rg1", "select sleep(1)", T0 + 10).is_err());
}

#[test]
fn expired_watch_lets_query_run_until_it_breaches_again() {
    let (gov, store) = governor();
    gov.create_group("rg1", &kill_after_50ms(WatchType::Exact), false)
        .unwrap();

    let mut run = gov.begin_query("rg1", "select sleep(1)", T0).unwrap();
    assert!(run.checkpoint(T0 + 60).is_err());
    gov.run_maintenance(T0 + 100);
    assert_eq!(store.list_watches().unwrap().len(), 1);

    let after = T0 + 60 + WATCH_MS;
    let report = gov.run_maintenance(after);
    assert_eq!(report.swept_watches, 1);
    assert!(gov.watch_list().is_empty());
    assert!(store.list_watches().unwrap().is_empty());

    let mut run = gov.begin_query("rg1", "select sleep(1)", after).unwrap();
    run.checkpoint(after + 40).unwrap();
    assert_eq!(run.state(), DetectorState::Running);
    let err = run.checkpoint(after + 51).unwrap_err();
    assert!(matches!(err, RunawayError::Killed { .. }));
}

// ─────────────────────────────────────────────────────────────────────────────
// Dedup
// ─────────────────────────────────────────────────────────────────────────────

fn dryrun_after_50ms() -> Vec<AlterOption> {
    query_limit(vec![
        QueryLimitOption::ExecElapsed(Duration::from_millis(50)),
        QueryLimitOption::Action(RunawayAction::DryRun),
    ])
}

fn run_breaching(gov: &ResourceGovernor, sql: &str, start: u64) {
    let mut run = gov.begin_query("rg1", sql, start).unwrap();
    run.checkpoint(start + 60).unwrap();
    let report = run.finish();
    assert_eq!(report.state, DetectorState::Identified);
}

#[test]
fn three_repeats_in_one_window_persist_as_one_row() {
    let (gov, store) = governor();
    gov.create_group("rg1", &dryrun_after_50ms(), false).unwrap();

    let sql = "select * from t where id = 1";
    for i in 0..3u64 {
        run_breaching(&gov, sql, T0 + i * 100);
    }

    assert_eq!(gov.recorder().pending(), 1);
    gov.run_maintenance(T0 + 1_000);
    let persisted = rows(store.as_ref(), None);
    assert_eq!(persisted.len(), 1);
    assert_eq!(persisted[0].repeats, 3);
    assert_eq!(persisted[0].sample_sql, sql);
    assert_eq!(persisted[0].start_time_ms, T0 + 60);

    // The counter starts over after a flush.
    run_breaching(&gov, sql, T0 + 2_000);
    gov.run_maintenance(T0 + 3_000);
    let persisted = rows(store.as_ref(), None);
    assert_eq!(persisted.len(), 2);
    assert_eq!(persisted.iter().map(|r| r.repeats).sum::<u64>(), 4);
}

#[test]
fn distinct_literals_persist_as_distinct_rows() {
    let (gov, store) = governor();
    gov.create_group("rg1", &dryrun_after_50ms(), false).unwrap();

    for i in 0..3u64 {
        run_breaching(&gov, &format!("select * from t where id = {i}"), T0 + i * 100);
    }

    assert_eq!(gov.recorder().pending(), 3);
    gov.run_maintenance(T0 + 1_000);
    let persisted = rows(store.as_ref(), None);
    assert_eq!(persisted.len(), 3);
    assert!(persisted.iter().all(|r| r.repeats == 1));
    assert!(persisted.iter().all(|r| r.sql_digest == persisted[0].sql_digest));
    let mut samples: Vec<&str> = persisted.iter().map(|r| r.sample_sql.as_str()).collect();
    samples.sort_unstable();
    assert_eq!(
        samples,
        vec![
            "select * from t where id = 0",
            "select * from t where id = 1",
            "select * from t where id = 2",
        ]
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Non-fatal actions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn cooldown_throttles_the_query() {
    let (gov, _) = governor();
    gov.create_group(
        "rg1",
        &query_limit(vec![
            QueryLimitOption::Ru(20),
            QueryLimitOption::Action(RunawayAction::Cooldown),
        ]),
        false,
    )
    .unwrap();

    let mut run = gov.begin_query("rg1", "select * from big", T0).unwrap();
    run.progress().add_ru(30);
    run.checkpoint(T0 + 5).unwrap();
    assert!(run.context().is_throttled());
    let outcome = run.outcome().unwrap();
    assert_eq!(outcome.action, RunawayAction::Cooldown);
    assert_eq!(outcome.match_type, MatchType::Identify);
}

#[test]
fn switch_group_rebinds_the_query() {
    let (gov, _) = governor();
    gov.create_group("rg2", &[AlterOption::RuPerSec(RuRate::Limited(100))], false)
        .unwrap();
    gov.create_group(
        "rg1",
        &query_limit(vec![
            QueryLimitOption::ProcessedKeys(100),
            QueryLimitOption::Action(RunawayAction::SwitchGroup("rg2".to_string())),
        ]),
        false,
    )
    .unwrap();

    let mut run = gov.begin_query("rg1", "select * from big", T0).unwrap();
    run.progress().add_processed_keys(100);
    run.checkpoint(T0 + 5).unwrap();

    // rg2 has 100 RU of capacity; the switched query drains it.
    assert!(run.admit(100, T0 + 5).is_granted());
    assert!(!run.admit(1, T0 + 5).is_granted());

    let report = run.finish();
    assert_eq!(report.bound_group, "rg1");
    assert_eq!(report.active_group, "rg2");
    assert_eq!(
        report.outcome.and_then(|o| o.switched_to),
        Some("rg2".to_string())
    );
}

#[test]
fn dryrun_watch_lets_query_through() {
    let (gov, store) = governor();
    gov.create_group(
        "rg1",
        &query_limit(vec![
            QueryLimitOption::ExecElapsed(Duration::from_millis(50)),
            QueryLimitOption::Action(RunawayAction::DryRun),
            QueryLimitOption::Watch(WatchType::Exact, None),
        ]),
        false,
    )
    .unwrap();

    let mut run = gov.begin_query("rg1", "select sleep(1)", T0).unwrap();
    run.checkpoint(T0 + 60).unwrap();

    let run = gov.begin_query("rg1", "select sleep(1)", T0 + 100).unwrap();
    assert_eq!(run.state(), DetectorState::Watched);
    assert_eq!(run.outcome().map(|o| o.match_type), Some(MatchType::Watch));

    gov.fast_gc(T0 + 200);
    let watches = store.list_watches().unwrap();
    assert_eq!(watches.len(), 1);
    assert_eq!(watches[0].expire_at_ms, None);
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

const CONFIG: &str = r#"
[[groups]]
name = "rg1"
ru_per_sec = 1000

[groups.query_limit]
exec_elapsed = "50ms"
action = "kill"
watch = "exact"
watch_duration = "10m"
"#;

#[test]
fn watches_survive_restart_on_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db");

    {
        let store = Arc::new(SqliteAuditStore::open(&path).unwrap());
        let config = GovernorConfig::from_toml_str(CONFIG).unwrap();
        let gov = ResourceGovernor::from_config(config, store, T0).unwrap();
        let mut run = gov.begin_query("rg1", "select sleep(1)", T0).unwrap();
        assert!(run.checkpoint(T0 + 60).is_err());
        let report = gov.run_maintenance(T0 + 100);
        assert_eq!(report.errors, 0);
        assert_eq!(report.persisted_watches, 1);
    }

    let store = Arc::new(SqliteAuditStore::open(&path).unwrap());
    let config = GovernorConfig::from_toml_str(CONFIG).unwrap();
    let gov = ResourceGovernor::from_config(config, store.clone(), T0 + 1_000).unwrap();
    assert_eq!(gov.watch_list().len(), 1);

    let err = gov
        .begin_query("rg1", "select sleep(1)", T0 + 1_000)
        .unwrap_err();
    assert!(matches!(err, RunawayError::Quarantine { .. }));

    gov.run_maintenance(T0 + 2_000);
    let match_types: Vec<MatchType> = rows(store.as_ref(), None)
        .into_iter()
        .map(|row| row.match_type)
        .collect();
    assert_eq!(match_types, vec![MatchType::Watch, MatchType::Identify]);
}

#[test]
fn restart_skips_watches_that_expired_while_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.db");

    {
        let store = Arc::new(SqliteAuditStore::open(&path).unwrap());
        let config = GovernorConfig::from_toml_str(CONFIG).unwrap();
        let gov = ResourceGovernor::from_config(config, store, T0).unwrap();
        let mut run = gov.begin_query("rg1", "select sleep(1)", T0).unwrap();
        assert!(run.checkpoint(T0 + 60).is_err());
        gov.run_maintenance(T0 + 100);
    }

    let later = T0 + 60 + 600_000;
    let store = Arc::new(SqliteAuditStore::open(&path).unwrap());
    let config = GovernorConfig::from_toml_str(CONFIG).unwrap();
    let gov = ResourceGovernor::from_config(config, store.clone(), later).unwrap();
    assert!(gov.watch_list().is_empty());
    assert!(gov.begin_query("rg1", "select sleep(1)", later).is_ok());

    let report = gov.run_maintenance(later);
    assert_eq!(report.purged_watches, 1);
    assert!(store.list_watches().unwrap().is_empty());
}

#[test]
fn dropping_a_group_deletes_its_persisted_watches() {
    let (gov, store) = governor();
    gov.create_group("rg1", &kill_after_50ms(WatchType::Exact), false)
        .unwrap();
    let mut run = gov.begin_query("rg1", "select sleep(1)", T0).unwrap();
    assert!(run.checkpoint(T0 + 60).is_err());
    gov.run_maintenance(T0 + 100);
    assert_eq!(store.list_watches().unwrap().len(), 1);

    gov.drop_group("rg1", false).unwrap();
    let report = gov.run_maintenance(T0 + 200);
    assert_eq!(report.deleted_watches, 1);
    assert!(store.list_watches().unwrap().is_empty());
}
