//! Per-query execution context shared between the executor and the governor.
//!
//! The executor owns the [`QueryProgress`] counters and polls the
//! [`CancelToken`]; the detector and dispatcher read the counters at
//! checkpoints and may rebind or throttle the query.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::fingerprint::QueryFingerprint;

/// Cooperative cancellation signal. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    reason: Mutex<Option<String>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. The first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        let mut slot = self.inner.reason.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(reason.into());
        }
        self.inner.cancelled.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

/// Running totals reported by the executor.
#[derive(Debug, Default)]
pub struct QueryProgress {
    processed_keys: AtomicU64,
    ru: AtomicU64,
}

impl QueryProgress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_processed_keys(&self, n: u64) {
        self.processed_keys.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_ru(&self, n: u64) {
        self.ru.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn processed_keys(&self) -> u64 {
        self.processed_keys.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn ru(&self) -> u64 {
        self.ru.load(Ordering::Relaxed)
    }
}

/// Execution context of one query.
#[derive(Debug)]
pub struct QueryContext {
    query_id: u64,
    bound_group: String,
    active_group: String,
    task_type: Option<String>,
    throttled: bool,
    fingerprint: QueryFingerprint,
    started_at_ms: u64,
    progress: Arc<QueryProgress>,
    cancel: CancelToken,
}

impl QueryContext {
    /// `group` must already be resolved to an existing group name.
    #[must_use]
    pub fn new(query_id: u64, group: &str, fingerprint: QueryFingerprint, now_ms: u64) -> Self {
        Self {
            query_id,
            bound_group: group.to_string(),
            active_group: group.to_string(),
            task_type: None,
            throttled: false,
            fingerprint,
            started_at_ms: now_ms,
            progress: Arc::new(QueryProgress::new()),
            cancel: CancelToken::new(),
        }
    }

    /// Tag the query as background work of `task_type`.
    #[must_use]
    pub fn with_task_type(mut self, task_type: &str) -> Self {
        self.task_type = Some(task_type.trim().to_lowercase());
        self
    }

    #[must_use]
    pub fn query_id(&self) -> u64 {
        self.query_id
    }

    /// Group the query was originally bound to.
    #[must_use]
    pub fn bound_group(&self) -> &str {
        &self.bound_group
    }

    /// Group currently charged for the query.
    #[must_use]
    pub fn active_group(&self) -> &str {
        &self.active_group
    }

    #[must_use]
    pub fn is_switched(&self) -> bool {
        self.active_group != self.bound_group
    }

    /// Rebind the query. Only the identifier moves; limiter state stays put.
    pub fn switch_group(&mut self, target: &str) {
        self.active_group = target.to_string();
    }

    #[must_use]
    pub fn task_type(&self) -> Option<&str> {
        self.task_type.as_deref()
    }

    #[must_use]
    pub fn is_throttled(&self) -> bool {
        self.throttled
    }

    pub fn set_throttled(&mut self) {
        self.throttled = true;
    }

    #[must_use]
    pub fn fingerprint(&self) -> &QueryFingerprint {
        &self.fingerprint
    }

    #[must_use]
    pub fn started_at_ms(&self) -> u64 {
        self.started_at_ms
    }

    #[must_use]
    pub fn elapsed_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.started_at_ms)
    }

    /// Counters the executor updates; clone the `Arc` to hand them out.
    #[must_use]
    pub fn progress(&self) -> &Arc<QueryProgress> {
        &self.progress
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}
