//! Buffered, deduplicated runaway event recording.
//!
//! [`EventRecorder::record`] only touches memory: events are folded into a
//! sharded buffer keyed by `(group, sample_sql, match_type)`, so a flood of
//! identical statements becomes one row with a repeat count. The SQL digest is
//! stored alongside for grouping literal variants at read time.
//! Maintenance drains the buffer into an [`AuditStore`] via
//! [`EventRecorder::flush`]; failed batches go back into the buffer.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::config::RecorderConfig;
use crate::error::StorageError;
use crate::fingerprint::QueryFingerprint;
use crate::group::RunawayAction;
use crate::sharded_map::ShardedMap;
use crate::store::AuditStore;

/// How a runaway query was caught.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// Breached a threshold while running.
    Identify,
    /// Hit a watch entry before running.
    Watch,
}

impl MatchType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identify => "identify",
            Self::Watch => "watch",
        }
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "identify" => Ok(Self::Identify),
            "watch" => Ok(Self::Watch),
            other => Err(format!("unknown match type '{other}'")),
        }
    }
}

/// One audit row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunawayEvent {
    pub group: String,
    /// Statement text, part of the dedup key.
    pub sample_sql: String,
    pub sql_digest: String,
    pub match_type: MatchType,
    pub action: String,
    /// Rule text or breach cause.
    pub rule: String,
    pub repeats: u64,
    pub start_time_ms: u64,
}

impl RunawayEvent {
    #[must_use]
    pub fn new(
        group: &str,
        fingerprint: &QueryFingerprint,
        match_type: MatchType,
        action: &RunawayAction,
        rule: impl Into<String>,
        now_ms: u64,
    ) -> Self {
        Self {
            group: group.to_string(),
            sample_sql: fingerprint.sql_text.clone(),
            sql_digest: fingerprint.sql_digest.clone(),
            match_type,
            action: action.to_string(),
            rule: rule.into(),
            repeats: 1,
            start_time_ms: now_ms,
        }
    }

    fn dedup_key(&self) -> EventKey {
        EventKey {
            group: self.group.clone(),
            sample_sql: self.sample_sql.clone(),
            match_type: self.match_type,
        }
    }

    /// Fold `older` into `self`: repeats add up, the earliest start wins.
    fn absorb(&mut self, older: &Self) {
        self.repeats = self.repeats.saturating_add(older.repeats);
        self.start_time_ms = self.start_time_ms.min(older.start_time_ms);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EventKey {
    group: String,
    sample_sql: String,
    match_type: MatchType,
}

/// Counters for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub buffered: usize,
    pub recorded_total: u64,
    pub flushed_rows: u64,
    pub flush_failures: u64,
    pub purged_rows: u64,
}

/// Sharded event buffer with size-triggered wake-ups.
#[derive(Debug)]
pub struct EventRecorder {
    buffer: ShardedMap<EventKey, RunawayEvent>,
    buffered: AtomicUsize,
    flush_batch_size: usize,
    retention_ms: u64,
    gc_batch_size: usize,
    notify: Arc<Notify>,
    recorded_total: AtomicU64,
    flushed_rows: AtomicU64,
    flush_failures: AtomicU64,
    purged_rows: AtomicU64,
}

impl EventRecorder {
    #[must_use]
    pub fn new(config: &RecorderConfig) -> Self {
        Self {
            buffer: ShardedMap::new(),
            buffered: AtomicUsize::new(0),
            flush_batch_size: config.flush_batch_size.max(1),
            retention_ms: config.retention_ms(),
            gc_batch_size: config.gc_batch_size.max(1),
            notify: Arc::new(Notify::new()),
            recorded_total: AtomicU64::new(0),
            flushed_rows: AtomicU64::new(0),
            flush_failures: AtomicU64::new(0),
            purged_rows: AtomicU64::new(0),
        }
    }

    /// Woken when the buffer reaches the flush batch size.
    #[must_use]
    pub fn notifier(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Buffer one occurrence. Returns `true` when it opened a new row.
    pub fn record(&self, event: RunawayEvent) -> bool {
        self.recorded_total.fetch_add(1, Ordering::Relaxed);
        let key = event.dedup_key();
        let group = event.group.clone();
        let match_type = event.match_type;
        let inserted = self
            .buffer
            .upsert_with(key, || event, |existing| existing.repeats += 1);
        if inserted {
            let buffered = self.buffered.fetch_add(1, Ordering::AcqRel) + 1;
            if buffered >= self.flush_batch_size {
                tracing::debug!(buffered, "recorder buffer full, waking maintenance");
                self.notify.notify_one();
            }
        } else {
            tracing::trace!(%group, match_type = %match_type, "runaway event deduplicated");
        }
        inserted
    }

    /// Number of distinct buffered rows.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buffered.load(Ordering::Acquire)
    }

    /// Drain the buffer, oldest first.
    pub fn take_batch(&self) -> Vec<RunawayEvent> {
        let mut batch: Vec<RunawayEvent> =
            self.buffer.drain().into_iter().map(|(_, e)| e).collect();
        let drained = batch.len();
        let _ = self
            .buffered
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                Some(n.saturating_sub(drained))
            });
        batch.sort_by(|a, b| {
            a.start_time_ms
                .cmp(&b.start_time_ms)
                .then_with(|| a.group.cmp(&b.group))
        });
        batch
    }

    /// Put a batch that failed to persist back into the buffer, merging with
    /// anything recorded since.
    pub fn rebuffer(&self, events: Vec<RunawayEvent>) {
        for event in events {
            let key = event.dedup_key();
            let inserted = self.buffer.upsert_with(
                key,
                || event.clone(),
                |existing| existing.absorb(&event),
            );
            if inserted {
                self.buffered.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Persist the buffer. On failure the batch is re-buffered and the error
    /// returned after logging.
    pub fn flush(&self, store: &dyn AuditStore) -> Result<usize, StorageError> {
        let batch = self.take_batch();
        if batch.is_empty() {
            return Ok(0);
        }
        let rows = batch.len();
        match store.insert_queries(&batch) {
            Ok(written) => {
                self.flushed_rows.fetch_add(written as u64, Ordering::Relaxed);
                tracing::debug!(rows = written, "runaway events flushed");
                Ok(written)
            }
            Err(err) => {
                self.flush_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(rows, error = %err, "runaway event flush failed, re-buffering");
                self.rebuffer(batch);
                Err(err)
            }
        }
    }

    /// Purge one bounded batch of rows older than the retention window.
    pub fn gc(&self, store: &dyn AuditStore, now_ms: u64) -> Result<usize, StorageError> {
        let cutoff = now_ms.saturating_sub(self.retention_ms);
        let purged = store.purge_queries_before(cutoff, self.gc_batch_size)?;
        if purged > 0 {
            self.purged_rows.fetch_add(purged as u64, Ordering::Relaxed);
            tracing::info!(rows = purged, cutoff_ms = cutoff, "runaway query rows purged");
        }
        Ok(purged)
    }

    #[must_use]
    pub fn stats(&self) -> RecorderStats {
        RecorderStats {
            buffered: self.pending(),
            recorded_total: self.recorded_total.load(Ordering::Relaxed),
            flushed_rows: self.flushed_rows.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            purged_rows: self.purged_rows.load(Ordering::Relaxed),
        }
    }
}
