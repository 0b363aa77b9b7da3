//! The resource governor facade.
//!
//! [`ResourceGovernor`] wires the registry, admission controller, watch list,
//! event recorder and audit store together. DDL goes through it so a dropped
//! group's watch entries and limiter state are cleaned up with it, and every
//! query starts with [`ResourceGovernor::begin_query`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::config::GovernorConfig;
use crate::context::{CancelToken, QueryContext, QueryProgress};
use crate::controller::{Admission, RuController};
use crate::detector::{DetectorState, RunawayDetector};
use crate::dispatcher::{DispatchOutcome, QuarantineActionDispatcher};
use crate::error::{GroupError, RunawayError};
use crate::fingerprint::QueryFingerprint;
use crate::group::DEFAULT_GROUP_NAME;
use crate::options::AlterOption;
use crate::recorder::EventRecorder;
use crate::registry::{DdlOutcome, DependencyChecker, GroupRegistry, NoDependencies};
use crate::store::{AuditStore, SqliteAuditStore};
use crate::watch::{WatchChange, WatchKey, WatchList};

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    pub flushed_events: usize,
    pub swept_watches: usize,
    pub persisted_watches: usize,
    pub deleted_watches: usize,
    pub purged_queries: usize,
    pub purged_watches: usize,
    /// Storage calls that failed and will be retried next pass.
    pub errors: usize,
}

/// Facade over the governance components.
pub struct ResourceGovernor {
    config: GovernorConfig,
    registry: Arc<GroupRegistry>,
    controller: Arc<RuController>,
    watch_list: Arc<WatchList>,
    recorder: Arc<EventRecorder>,
    store: Arc<dyn AuditStore>,
    dispatcher: QuarantineActionDispatcher,
    next_query_id: AtomicU64,
}

impl std::fmt::Debug for ResourceGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceGovernor")
            .field("registry", &self.registry)
            .field("watches", &self.watch_list.len())
            .field("buffered_events", &self.recorder.pending())
            .finish()
    }
}

impl ResourceGovernor {
    /// Build with only the default group and no dependency tracking.
    #[must_use]
    pub fn new(config: GovernorConfig, store: Arc<dyn AuditStore>) -> Self {
        Self::with_dependency_checker(config, store, Arc::new(NoDependencies))
    }

    #[must_use]
    pub fn with_dependency_checker(
        config: GovernorConfig,
        store: Arc<dyn AuditStore>,
        dependencies: Arc<dyn DependencyChecker>,
    ) -> Self {
        let registry = Arc::new(GroupRegistry::with_dependency_checker(dependencies));
        let controller = Arc::new(RuController::new(
            Arc::clone(&registry),
            config.controller.clone(),
        ));
        let watch_list = Arc::new(WatchList::new());
        let recorder = Arc::new(EventRecorder::new(&config.recorder));
        let dispatcher = QuarantineActionDispatcher::new(
            Arc::clone(&registry),
            Arc::clone(&watch_list),
            Arc::clone(&recorder),
        );
        Self {
            config,
            registry,
            controller,
            watch_list,
            recorder,
            store,
            dispatcher,
            next_query_id: AtomicU64::new(1),
        }
    }

    /// Validate `config`, seed its groups and reload persisted watches.
    pub fn from_config(
        config: GovernorConfig,
        store: Arc<dyn AuditStore>,
        now_ms: u64,
    ) -> crate::Result<Self> {
        config.validate()?;
        let governor = Self::new(config, store);
        governor.seed_groups()?;
        let restored = governor
            .watch_list
            .restore(governor.store.list_watches()?, now_ms);
        tracing::info!(
            groups = governor.registry.list().len(),
            watches = restored,
            "resource governor ready"
        );
        Ok(governor)
    }

    /// [`from_config`](Self::from_config) over the SQLite store named in the
    /// config.
    pub fn open(config: GovernorConfig) -> crate::Result<Self> {
        let store = SqliteAuditStore::open(std::path::Path::new(&config.storage.db_path))?;
        Self::from_config(config, Arc::new(store), epoch_ms())
    }

    fn seed_groups(&self) -> Result<(), GroupError> {
        for seed in &self.config.groups {
            let options = seed.to_options()?;
            if seed.is_default() {
                self.registry.alter(DEFAULT_GROUP_NAME, &options, false)?;
            } else {
                let outcome = self.registry.create_with_options(&seed.name, &options, true)?;
                if let Some(warning) = outcome.warning() {
                    tracing::warn!(group = %seed.name, warning, "seed group skipped");
                }
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<GroupRegistry> {
        &self.registry
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<RuController> {
        &self.controller
    }

    #[must_use]
    pub fn watch_list(&self) -> &Arc<WatchList> {
        &self.watch_list
    }

    #[must_use]
    pub fn recorder(&self) -> &Arc<EventRecorder> {
        &self.recorder
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn AuditStore> {
        &self.store
    }

    // -------------------------------------------------------------------------
    // DDL
    // -------------------------------------------------------------------------

    pub fn create_group(
        &self,
        name: &str,
        options: &[AlterOption],
        if_not_exists: bool,
    ) -> Result<DdlOutcome, GroupError> {
        self.registry.create_with_options(name, options, if_not_exists)
    }

    pub fn alter_group(
        &self,
        name: &str,
        options: &[AlterOption],
        if_exists: bool,
    ) -> Result<DdlOutcome, GroupError> {
        self.registry.alter(name, options, if_exists)
    }

    /// Drop a group together with its watch entries and limiter state.
    pub fn drop_group(&self, name: &str, if_exists: bool) -> Result<DdlOutcome, GroupError> {
        let outcome = self.registry.drop_group(name, if_exists)?;
        if let DdlOutcome::Dropped { name, .. } = &outcome {
            let watches = self.watch_list.remove_group(name);
            self.controller.forget(name);
            tracing::debug!(group = %name, watches, "dropped group state cleaned up");
        }
        Ok(outcome)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Start a query bound to `binding` (a hint or the user's default group).
    /// An empty or unknown binding runs under the default group. Fails with
    /// [`RunawayError::Quarantine`] when a kill watch matches.
    pub fn begin_query(
        &self,
        binding: &str,
        sql: &str,
        now_ms: u64,
    ) -> Result<QueryRun, RunawayError> {
        self.begin_query_with(binding, QueryFingerprint::new(sql), None, now_ms)
    }

    /// [`begin_query`](Self::begin_query) with a prepared fingerprint (plan
    /// digest included) and an optional background task type.
    pub fn begin_query_with(
        &self,
        binding: &str,
        fingerprint: QueryFingerprint,
        task_type: Option<&str>,
        now_ms: u64,
    ) -> Result<QueryRun, RunawayError> {
        let snapshot = self.registry.snapshot();
        let group = match snapshot.get(binding) {
            Some(group) => group,
            None => {
                if !binding.trim().is_empty() {
                    tracing::warn!(binding, "unknown resource group, using default");
                }
                snapshot
                    .get(DEFAULT_GROUP_NAME)
                    .unwrap_or_else(|| Arc::new(crate::group::GroupConfig::default_group()))
            }
        };

        let query_id = self.next_query_id.fetch_add(1, Ordering::Relaxed);
        let mut ctx = QueryContext::new(query_id, &group.name, fingerprint, now_ms);
        if let Some(task_type) = task_type {
            ctx = ctx.with_task_type(task_type);
        }
        let mut detector = RunawayDetector::new(group.runaway.clone());

        let mut outcome = None;
        if let Some(entry) = detector.before_execution(&self.watch_list, &ctx, now_ms) {
            outcome = Some(self.dispatcher.on_watched(&mut ctx, &entry, now_ms)?);
        }

        tracing::trace!(query_id, group = %group.name, "query started");
        Ok(QueryRun {
            ctx,
            detector,
            outcome,
            controller: Arc::clone(&self.controller),
            dispatcher: self.dispatcher.clone(),
        })
    }

    // -------------------------------------------------------------------------
    // Maintenance
    // -------------------------------------------------------------------------

    /// One maintenance pass: flush events, sweep expired watches, persist
    /// watch changes, then purge one retention batch. Storage failures are
    /// logged and counted; the work is retried next pass.
    pub fn run_maintenance(&self, now_ms: u64) -> MaintenanceReport {
        self.maintain(now_ms, self.config.watch.sweep_batch_size, false)
    }

    /// Like [`run_maintenance`](Self::run_maintenance) but sweeps the whole
    /// watch list and purges until nothing is left to purge.
    pub fn fast_gc(&self, now_ms: u64) -> MaintenanceReport {
        self.maintain(now_ms, usize::MAX, true)
    }

    fn maintain(&self, now_ms: u64, sweep_budget: usize, drain: bool) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        let store = self.store.as_ref();

        match self.recorder.flush(store) {
            Ok(rows) => report.flushed_events = rows,
            Err(_) => report.errors += 1,
        }

        report.swept_watches = self.watch_list.sweep(now_ms, sweep_budget);

        match self.persist_watch_changes() {
            Ok((upserted, deleted)) => {
                report.persisted_watches = upserted;
                report.deleted_watches = deleted;
            }
            Err(_) => report.errors += 1,
        }

        loop {
            let queries = match self.recorder.gc(store, now_ms) {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error = %err, "runaway query purge failed");
                    report.errors += 1;
                    0
                }
            };
            let watches = match store.purge_expired_watches(now_ms, self.config.recorder.gc_batch_size) {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(error = %err, "runaway watch purge failed");
                    report.errors += 1;
                    0
                }
            };
            report.purged_queries += queries;
            report.purged_watches += watches;
            if !drain || queries + watches == 0 {
                break;
            }
        }

        if report != MaintenanceReport::default() {
            tracing::debug!(
                flushed = report.flushed_events,
                swept = report.swept_watches,
                persisted = report.persisted_watches,
                deleted = report.deleted_watches,
                purged = report.purged_queries,
                errors = report.errors,
                "maintenance pass complete"
            );
        }
        report
    }

    /// Write queued watch changes, keeping only the last change per key.
    /// Failed changes are re-queued.
    fn persist_watch_changes(&self) -> Result<(usize, usize), crate::error::StorageError> {
        let changes = self.watch_list.take_changes();
        if changes.is_empty() {
            return Ok((0, 0));
        }
        let coalesced = coalesce(changes);
        let mut upserts = Vec::new();
        let mut removals: Vec<WatchKey> = Vec::new();
        for change in &coalesced {
            match change {
                WatchChange::Upsert(entry) => upserts.push(entry.clone()),
                WatchChange::Remove(key) => removals.push(key.clone()),
            }
        }

        let result = self
            .store
            .upsert_watches(&upserts)
            .and_then(|upserted| Ok((upserted, self.store.delete_watches(&removals)?)));
        match result {
            Ok((upserted, _)) => Ok((upserted, removals.len())),
            Err(err) => {
                tracing::warn!(
                    changes = coalesced.len(),
                    error = %err,
                    "watch persistence failed, re-queueing"
                );
                self.watch_list.requeue_changes(coalesced);
                Err(err)
            }
        }
    }
}

/// Last change per key wins; order follows each key's last change.
fn coalesce(changes: Vec<WatchChange>) -> Vec<WatchChange> {
    let mut last: HashMap<WatchKey, usize> = HashMap::with_capacity(changes.len());
    for (idx, change) in changes.iter().enumerate() {
        last.insert(change.key(), idx);
    }
    changes
        .into_iter()
        .enumerate()
        .filter(|(idx, change)| last.get(&change.key()) == Some(idx))
        .map(|(_, change)| change)
        .collect()
}

/// Final report of one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryReport {
    pub query_id: u64,
    pub bound_group: String,
    pub active_group: String,
    pub state: DetectorState,
    pub outcome: Option<DispatchOutcome>,
}

/// A query in flight.
#[derive(Debug)]
pub struct QueryRun {
    ctx: QueryContext,
    detector: RunawayDetector,
    outcome: Option<DispatchOutcome>,
    controller: Arc<RuController>,
    dispatcher: QuarantineActionDispatcher,
}

impl QueryRun {
    #[must_use]
    pub fn context(&self) -> &QueryContext {
        &self.ctx
    }

    #[must_use]
    pub fn query_id(&self) -> u64 {
        self.ctx.query_id()
    }

    /// Counters the executor reports into.
    #[must_use]
    pub fn progress(&self) -> Arc<QueryProgress> {
        Arc::clone(self.ctx.progress())
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.ctx.cancel_token().clone()
    }

    #[must_use]
    pub fn state(&self) -> DetectorState {
        self.detector.state()
    }

    /// Action taken so far, if any fired without killing the query.
    #[must_use]
    pub fn outcome(&self) -> Option<&DispatchOutcome> {
        self.outcome.as_ref()
    }

    /// Sample progress against the runaway rule. Fails with
    /// [`RunawayError::Killed`] when a kill rule fires.
    pub fn checkpoint(&mut self, now_ms: u64) -> Result<(), RunawayError> {
        let Some(breach) = self.detector.checkpoint(&self.ctx, now_ms) else {
            return Ok(());
        };
        let Some(rule) = self.detector.rule().cloned() else {
            return Ok(());
        };
        let outcome = self
            .dispatcher
            .on_identified(&mut self.ctx, &rule, breach, now_ms)?;
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Ask the controller for `units` RU on behalf of this query.
    #[must_use]
    pub fn admit(&self, units: u64, now_ms: u64) -> Admission {
        self.controller.try_consume_query(&self.ctx, units, now_ms)
    }

    /// Complete the query.
    pub fn finish(mut self) -> QueryReport {
        let state = self.detector.finish();
        tracing::trace!(query_id = self.ctx.query_id(), state = ?state, "query finished");
        QueryReport {
            query_id: self.ctx.query_id(),
            bound_group: self.ctx.bound_group().to_string(),
            active_group: self.ctx.active_group().to_string(),
            state,
            outcome: self.outcome,
        }
    }
}
