//! Executes runaway actions against a query context.
//!
//! Both firing paths record an audit event. The identify path additionally
//! leaves a watch entry behind when the rule asks for one, so later
//! executions of the same fingerprint are caught before they run.

use std::sync::Arc;

use serde::Serialize;

use crate::context::QueryContext;
use crate::detector::Breach;
use crate::error::RunawayError;
use crate::group::{RunawayAction, RunawayRule};
use crate::recorder::{EventRecorder, MatchType, RunawayEvent};
use crate::registry::GroupRegistry;
use crate::watch::{WatchEntry, WatchList};

/// What a non-fatal action did to the query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub match_type: MatchType,
    pub action: RunawayAction,
    /// Group the query was rebound to.
    pub switched_to: Option<String>,
    /// Whether the identify path created or refreshed a watch entry.
    pub watch_updated: bool,
}

/// Applies kill, cooldown, dryrun and switch-group.
#[derive(Debug, Clone)]
pub struct QuarantineActionDispatcher {
    registry: Arc<GroupRegistry>,
    watch_list: Arc<WatchList>,
    recorder: Arc<EventRecorder>,
}

impl QuarantineActionDispatcher {
    #[must_use]
    pub fn new(
        registry: Arc<GroupRegistry>,
        watch_list: Arc<WatchList>,
        recorder: Arc<EventRecorder>,
    ) -> Self {
        Self {
            registry,
            watch_list,
            recorder,
        }
    }

    /// A running query breached `rule`.
    pub fn on_identified(
        &self,
        ctx: &mut QueryContext,
        rule: &RunawayRule,
        breach: Breach,
        now_ms: u64,
    ) -> Result<DispatchOutcome, RunawayError> {
        let cause = breach.to_string();
        let watch_updated = match WatchEntry::for_query(
            ctx.bound_group(),
            rule.watch_type,
            ctx.fingerprint(),
            rule.action.clone(),
            now_ms,
            rule.watch_expiry(now_ms),
        ) {
            Some(entry) => {
                self.watch_list.insert(entry);
                true
            }
            None => false,
        };

        self.recorder.record(RunawayEvent::new(
            ctx.bound_group(),
            ctx.fingerprint(),
            MatchType::Identify,
            &rule.action,
            cause.clone(),
            now_ms,
        ));

        let outcome = DispatchOutcome {
            match_type: MatchType::Identify,
            action: rule.action.clone(),
            switched_to: None,
            watch_updated,
        };
        self.apply(ctx, outcome, Fired::Identified { cause })
    }

    /// A query matched `entry` before execution.
    pub fn on_watched(
        &self,
        ctx: &mut QueryContext,
        entry: &WatchEntry,
        now_ms: u64,
    ) -> Result<DispatchOutcome, RunawayError> {
        self.recorder.record(RunawayEvent::new(
            ctx.bound_group(),
            ctx.fingerprint(),
            MatchType::Watch,
            &entry.action,
            format!("{} = {}", entry.watch_type, entry.key),
            now_ms,
        ));

        let outcome = DispatchOutcome {
            match_type: MatchType::Watch,
            action: entry.action.clone(),
            switched_to: None,
            watch_updated: false,
        };
        self.apply(
            ctx,
            outcome,
            Fired::Watched {
                watch_text: entry.key.clone(),
            },
        )
    }

    fn apply(
        &self,
        ctx: &mut QueryContext,
        mut outcome: DispatchOutcome,
        fired: Fired,
    ) -> Result<DispatchOutcome, RunawayError> {
        tracing::info!(
            query_id = ctx.query_id(),
            group = ctx.bound_group(),
            match_type = %outcome.match_type,
            action = %outcome.action,
            "runaway action applied"
        );
        match &outcome.action {
            RunawayAction::Kill => {
                let group = ctx.bound_group().to_string();
                let err = match fired {
                    Fired::Identified { cause } => RunawayError::Killed { group, cause },
                    Fired::Watched { watch_text } => RunawayError::Quarantine { group, watch_text },
                };
                ctx.cancel_token().cancel(err.to_string());
                return Err(err);
            }
            RunawayAction::Cooldown => ctx.set_throttled(),
            RunawayAction::DryRun => {}
            RunawayAction::SwitchGroup(target) => match self.registry.get(target) {
                Some(config) => {
                    ctx.switch_group(&config.name);
                    outcome.switched_to = Some(config.name.clone());
                }
                None => {
                    tracing::warn!(
                        query_id = ctx.query_id(),
                        group = ctx.bound_group(),
                        target = %target,
                        "switch target does not exist, query stays in its group"
                    );
                }
            },
        }
        Ok(outcome)
    }
}

enum Fired {
    Identified { cause: String },
    Watched { watch_text: String },
}
