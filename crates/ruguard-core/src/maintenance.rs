//! Background maintenance task.
//!
//! One tokio task runs [`ResourceGovernor::run_maintenance`] on a fixed
//! interval, early when the recorder's buffer fills up, and a final time
//! on shutdown. Storage work runs on the blocking pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::governor::{MaintenanceReport, ResourceGovernor, epoch_ms};

/// Handle to a running maintenance task.
#[derive(Debug)]
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<MaintenanceReport>,
}

impl MaintenanceHandle {
    /// Stop the task after a final pass. Returns the totals of every pass.
    pub async fn shutdown(self) -> MaintenanceReport {
        let _ = self.shutdown.send(true);
        self.join.await.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "maintenance task join failed");
            MaintenanceReport::default()
        })
    }
}

/// Spawn the maintenance loop on the current runtime.
pub fn spawn_maintenance(governor: Arc<ResourceGovernor>) -> MaintenanceHandle {
    let (tx, rx) = watch::channel(false);
    let join = tokio::spawn(run(governor, rx));
    MaintenanceHandle { shutdown: tx, join }
}

async fn run(
    governor: Arc<ResourceGovernor>,
    mut shutdown: watch::Receiver<bool>,
) -> MaintenanceReport {
    let config = governor.config();
    let period_ms = config
        .recorder
        .flush_interval_ms
        .min(config.watch.sweep_interval_ms)
        .max(1);
    let mut interval = tokio::time::interval(Duration::from_millis(period_ms));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let notify = governor.recorder().notifier();
    let mut totals = MaintenanceReport::default();

    tracing::info!(period_ms, "maintenance task started");
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            () = notify.notified() => {
                tracing::debug!("maintenance woken by full recorder buffer");
            }
            _ = shutdown.changed() => {
                tracing::info!("maintenance task shutting down");
                break;
            }
        }
        accumulate(&mut totals, pass(&governor).await);
    }
    accumulate(&mut totals, pass(&governor).await);
    totals
}

async fn pass(governor: &Arc<ResourceGovernor>) -> MaintenanceReport {
    let governor = Arc::clone(governor);
    tokio::task::spawn_blocking(move || governor.run_maintenance(epoch_ms()))
        .await
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "maintenance pass panicked");
            MaintenanceReport {
                errors: 1,
                ..MaintenanceReport::default()
            }
        })
}

fn accumulate(totals: &mut MaintenanceReport, report: MaintenanceReport) {
    totals.flushed_events += report.flushed_events;
    totals.swept_watches += report.swept_watches;
    totals.persisted_watches += report.persisted_watches;
    totals.deleted_watches += report.deleted_watches;
    totals.purged_queries += report.purged_queries;
    totals.purged_watches += report.purged_watches;
    totals.errors += report.errors;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GovernorConfig, RecorderConfig};
    use crate::fingerprint::QueryFingerprint;
    use crate::group::RunawayAction;
    use crate::recorder::{MatchType, RunawayEvent};
    use crate::store::{AuditStore, MemoryAuditStore, QueryFilter};

    fn governor(flush_batch_size: usize) -> (Arc<ResourceGovernor>, Arc<MemoryAuditStore>) {
        let store = Arc::new(MemoryAuditStore::new());
        let config = GovernorConfig {
            recorder: RecorderConfig {
                flush_interval_ms: 60_000,
                flush_batch_size,
                ..RecorderConfig::default()
            },
            ..GovernorConfig::default()
        };
        let gov = Arc::new(ResourceGovernor::new(config, store.clone()));
        (gov, store)
    }

    fn event(sql: &str) -> RunawayEvent {
        RunawayEvent::new(
            "default",
            &QueryFingerprint::new(sql),
            MatchType::Identify,
            &RunawayAction::DryRun,
            "RequestUnit = 30(>=20)",
            epoch_ms(),
        )
    }

    #[tokio::test]
    async fn full_buffer_triggers_flush() {
        let (gov, store) = governor(2);
        let handle = spawn_maintenance(Arc::clone(&gov));
        // Let the immediate first tick pass.
        tokio::time::sleep(Duration::from_millis(50)).await;

        gov.recorder().record(event("select 1 from a"));
        gov.recorder().record(event("select 1 from b"));

        let mut flushed = 0;
        for _ in 0..100 {
            flushed = store.list_queries(&QueryFilter::default()).unwrap().len();
            if flushed == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(flushed, 2);
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_runs_a_final_pass() {
        let (gov, store) = governor(1_000);
        let handle = spawn_maintenance(Arc::clone(&gov));
        tokio::time::sleep(Duration::from_millis(50)).await;

        gov.recorder().record(event("select 1 from a"));
        let totals = handle.shutdown().await;

        assert_eq!(totals.flushed_events, 1);
        assert_eq!(store.list_queries(&QueryFilter::default()).unwrap().len(), 1);
        assert_eq!(gov.recorder().pending(), 0);
    }
}
