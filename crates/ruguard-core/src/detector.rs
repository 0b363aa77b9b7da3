//! Per-query runaway detection.
//!
//! A [`RunawayDetector`] lives for one query and moves through
//! `Running → {Ok, Identified, Watched}`. The rule is captured when the
//! query starts, so a concurrent `ALTER` never changes the thresholds of a
//! query already in flight. Each checkpoint reads three counters and does at
//! most three comparisons.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::context::QueryContext;
use crate::group::RunawayRule;
use crate::options::format_duration_ms;
use crate::recorder::MatchType;
use crate::watch::{WatchEntry, WatchList};

/// Detector lifecycle state. Everything but `Running` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectorState {
    Running,
    /// Finished without firing.
    Ok,
    /// A threshold was breached during execution.
    Identified,
    /// Matched a watch entry before execution.
    Watched,
}

impl DetectorState {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }

    /// Audit match type of a firing state.
    #[must_use]
    pub fn match_type(self) -> Option<MatchType> {
        match self {
            Self::Identified => Some(MatchType::Identify),
            Self::Watched => Some(MatchType::Watch),
            Self::Running | Self::Ok => None,
        }
    }
}

/// Which threshold fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreachMetric {
    ElapsedTime,
    ProcessedKeys,
    RequestUnit,
}

/// A threshold breach observed at a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Breach {
    pub metric: BreachMetric,
    pub observed: u64,
    pub limit: u64,
}

impl fmt::Display for Breach {
    /// `ElapsedTime = 60ms(>50ms)`, `ProcessedKeys = 120(>=100)`, `RequestUnit = 30(>=20)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.metric {
            BreachMetric::ElapsedTime => write!(
                f,
                "ElapsedTime = {}(>{})",
                format_duration_ms(self.observed),
                format_duration_ms(self.limit)
            ),
            BreachMetric::ProcessedKeys => {
                write!(f, "ProcessedKeys = {}(>={})", self.observed, self.limit)
            }
            BreachMetric::RequestUnit => {
                write!(f, "RequestUnit = {}(>={})", self.observed, self.limit)
            }
        }
    }
}

/// Runaway state machine for one query.
#[derive(Debug, Clone)]
pub struct RunawayDetector {
    state: DetectorState,
    rule: Option<RunawayRule>,
    breach: Option<Breach>,
}

impl RunawayDetector {
    /// `rule` is the bound group's rule at query start.
    #[must_use]
    pub fn new(rule: Option<RunawayRule>) -> Self {
        Self {
            state: DetectorState::Running,
            rule: rule.filter(RunawayRule::has_threshold),
            breach: None,
        }
    }

    #[must_use]
    pub fn state(&self) -> DetectorState {
        self.state
    }

    #[must_use]
    pub fn rule(&self) -> Option<&RunawayRule> {
        self.rule.as_ref()
    }

    /// Breach that moved the detector to `Identified`.
    #[must_use]
    pub fn breach(&self) -> Option<Breach> {
        self.breach
    }

    /// Check the watch list before execution. A live hit moves the detector to
    /// `Watched` and is returned.
    pub fn before_execution(
        &mut self,
        watch_list: &WatchList,
        ctx: &QueryContext,
        now_ms: u64,
    ) -> Option<WatchEntry> {
        if self.state != DetectorState::Running {
            return None;
        }
        let hit = watch_list.lookup_fingerprint(ctx.bound_group(), ctx.fingerprint(), now_ms)?;
        tracing::debug!(
            query_id = ctx.query_id(),
            group = %hit.group,
            watch_type = %hit.watch_type,
            "query matched watch entry"
        );
        self.state = DetectorState::Watched;
        Some(hit)
    }

    /// Sample the query's progress. Returns the breach the first time a
    /// threshold is crossed; `None` afterwards and in terminal states.
    pub fn checkpoint(&mut self, ctx: &QueryContext, now_ms: u64) -> Option<Breach> {
        if self.state != DetectorState::Running {
            return None;
        }
        let rule = self.rule.as_ref()?;
        let breach = evaluate(rule, ctx, now_ms)?;
        tracing::debug!(
            query_id = ctx.query_id(),
            group = ctx.bound_group(),
            breach = %breach,
            "runaway threshold breached"
        );
        self.state = DetectorState::Identified;
        self.breach = Some(breach);
        Some(breach)
    }

    /// Query completed. `Running → Ok`; terminal states are kept.
    pub fn finish(&mut self) -> DetectorState {
        if self.state == DetectorState::Running {
            self.state = DetectorState::Ok;
        }
        self.state
    }
}

fn evaluate(rule: &RunawayRule, ctx: &QueryContext, now_ms: u64) -> Option<Breach> {
    if rule.exec_elapsed_ms > 0 {
        let elapsed = ctx.elapsed_ms(now_ms);
        if elapsed > rule.exec_elapsed_ms {
            return Some(Breach {
                metric: BreachMetric::ElapsedTime,
                observed: elapsed,
                limit: rule.exec_elapsed_ms,
            });
        }
    }
    let progress = ctx.progress();
    if rule.processed_keys > 0 {
        let keys = progress.processed_keys();
        if keys >= rule.processed_keys {
            return Some(Breach {
                metric: BreachMetric::ProcessedKeys,
                observed: keys,
                limit: rule.processed_keys,
            });
        }
    }
    if rule.ru > 0 {
        let ru = progress.ru();
        if ru >= rule.ru {
            return Some(Breach {
                metric: BreachMetric::RequestUnit,
                observed: ru,
                limit: rule.ru,
            });
        }
    }
    None
}
