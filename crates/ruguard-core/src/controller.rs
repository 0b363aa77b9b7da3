//! Per-group RU admission control.
//!
//! Each group gets its own [`TokenBucket`] behind its own mutex, stored in a
//! [`ShardedMap`], so admission for one group never touches another group's
//! state. Refill is lazy: every call passes `now_ms` and the bucket catches up
//! from the elapsed time. Nothing here blocks; a denied request gets an
//! advisory wait that the external scheduler acts on.
//!
//! Capacity follows [`GroupConfig::burst_limit`]:
//!
//! | burst limit   | bucket                                          |
//! |---------------|-------------------------------------------------|
//! | `Fixed(n)`    | capacity `n`, refill `n`/s                      |
//! | `Moderated`   | capacity `rate × m`, recomputed on every call   |
//! | `Unlimited`   | no bucket, always granted                       |
//!
//! with `m = 1 + (max_multiplier - 1) × headroom`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::config::ControllerConfig;
use crate::context::QueryContext;
use crate::group::{BurstLimit, DEFAULT_GROUP_NAME, GroupConfig, Priority};
use crate::registry::GroupRegistry;
use crate::sharded_map::ShardedMap;
use crate::token_bucket::{BucketStats, NestedResult, TokenBucket, try_acquire_nested};

/// Admission decision for one consume call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Admission {
    Granted,
    /// Retry after `wait_ms`; `priority` lets the scheduler order waiters.
    Wait { wait_ms: u64, priority: Priority },
}

impl Admission {
    #[must_use]
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Bucket statistics for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupBucketStats {
    pub group: String,
    /// Adjusted burst limit in the historical encoding.
    pub burst_limit: i64,
    /// `None` for groups without a cap.
    pub main: Option<BucketStats>,
    pub background: Option<BucketStats>,
}

#[derive(Debug)]
struct GroupBucket {
    config: Arc<GroupConfig>,
    main: Option<TokenBucket>,
    /// Default-group snapshot the background bucket was sized from.
    background_source: Option<Arc<GroupConfig>>,
    background: Option<TokenBucket>,
}

impl GroupBucket {
    fn build(config: Arc<GroupConfig>, capacity_multiplier: f64, now_ms: u64) -> Self {
        let main = match (config.burst_limit(), config.ru_rate.per_sec()) {
            (BurstLimit::Fixed(n), _) => Some(TokenBucket::new(n as f64, n as f64, now_ms)),
            (BurstLimit::Moderated, Some(rate)) => {
                let rate = rate as f64;
                Some(TokenBucket::new(rate * capacity_multiplier, rate, now_ms))
            }
            _ => None,
        };
        Self {
            config,
            main,
            background_source: None,
            background: None,
        }
    }
}

/// Token-bucket admission controller over the registry's groups.
pub struct RuController {
    registry: Arc<GroupRegistry>,
    config: ControllerConfig,
    buckets: ShardedMap<String, Arc<Mutex<GroupBucket>>>,
    /// Scheduler headroom in [0, 1], stored as f64 bits.
    headroom: AtomicU64,
}

impl std::fmt::Debug for RuController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuController")
            .field("groups", &self.buckets.len())
            .field("headroom", &self.headroom())
            .finish()
    }
}

impl RuController {
    #[must_use]
    pub fn new(registry: Arc<GroupRegistry>, config: ControllerConfig) -> Self {
        Self {
            registry,
            config,
            buckets: ShardedMap::new(),
            headroom: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    /// Report scheduler headroom; clamped to [0, 1].
    pub fn set_headroom(&self, headroom: f64) {
        let clamped = if headroom.is_nan() {
            0.0
        } else {
            headroom.clamp(0.0, 1.0)
        };
        self.headroom.store(clamped.to_bits(), Ordering::Relaxed);
    }

    #[must_use]
    pub fn headroom(&self) -> f64 {
        f64::from_bits(self.headroom.load(Ordering::Relaxed))
    }

    /// Current moderated burst multiplier.
    #[must_use]
    pub fn moderated_multiplier(&self) -> f64 {
        1.0 + (self.config.moderated_max_multiplier - 1.0) * self.headroom()
    }

    fn resolve(&self, group: &str) -> Arc<GroupConfig> {
        self.registry
            .get(group)
            .or_else(|| self.registry.get(DEFAULT_GROUP_NAME))
            .unwrap_or_else(|| Arc::new(GroupConfig::default_group()))
    }

    fn bucket_for(&self, config: &Arc<GroupConfig>, now_ms: u64) -> Arc<Mutex<GroupBucket>> {
        let multiplier = self.moderated_multiplier();
        self.buckets.get_or_insert_with(config.name.clone(), || {
            Arc::new(Mutex::new(GroupBucket::build(
                Arc::clone(config),
                multiplier,
                now_ms,
            )))
        })
    }

    /// Lock the group's bucket, rebuilding it when the group's snapshot
    /// changed and resizing a moderated capacity.
    fn with_bucket<R>(
        &self,
        config: &Arc<GroupConfig>,
        now_ms: u64,
        f: impl FnOnce(&mut GroupBucket) -> R,
    ) -> R {
        let entry = self.bucket_for(config, now_ms);
        let mut bucket = entry.lock().unwrap_or_else(|e| e.into_inner());
        let multiplier = self.moderated_multiplier();
        if !Arc::ptr_eq(&bucket.config, config) {
            tracing::debug!(group = %config.name, "group changed, rebuilding bucket");
            *bucket = GroupBucket::build(Arc::clone(config), multiplier, now_ms);
        }
        if let (BurstLimit::Moderated, Some(rate), Some(main)) = (
            config.burst_limit(),
            config.ru_rate.per_sec(),
            bucket.main.as_mut(),
        ) {
            main.set_capacity(rate as f64 * multiplier, now_ms);
        }
        f(&mut *bucket)
    }

    /// Charge `units` RU to `group`. Unknown groups fall back to the default
    /// group.
    pub fn try_consume(&self, group: &str, units: u64, now_ms: u64) -> Admission {
        let config = self.resolve(group);
        self.with_bucket(&config, now_ms, |bucket| match bucket.main.as_mut() {
            None => Admission::Granted,
            Some(main) => {
                if main.try_acquire(units, now_ms) {
                    Admission::Granted
                } else {
                    Admission::Wait {
                        wait_ms: main.wait_time_ms(units, now_ms),
                        priority: bucket.config.priority,
                    }
                }
            }
        })
    }

    /// Charge a running query: its active group pays, throttled queries pay
    /// `cooldown_cost_factor` times more, and background task types listed on
    /// the default group also draw from the group's background budget.
    pub fn try_consume_query(&self, ctx: &QueryContext, units: u64, now_ms: u64) -> Admission {
        let cost = if ctx.is_throttled() {
            (units as f64 * self.config.cooldown_cost_factor).ceil() as u64
        } else {
            units
        };

        let default = self.resolve(DEFAULT_GROUP_NAME);
        let is_background = match (ctx.task_type(), default.background.as_ref()) {
            (Some(task), Some(bg)) => bg.covers(task),
            _ => false,
        };
        if !is_background {
            return self.try_consume(ctx.active_group(), cost, now_ms);
        }

        let config = self.resolve(ctx.active_group());
        let reference_ru = self.config.background_reference_ru;
        self.with_bucket(&config, now_ms, |bucket| {
            let stale = bucket
                .background_source
                .as_ref()
                .is_none_or(|src| !Arc::ptr_eq(src, &default));
            if stale {
                bucket.background = background_bucket(&bucket.config, &default, reference_ru, now_ms);
                bucket.background_source = Some(Arc::clone(&default));
            }
            let priority = bucket.config.priority;
            match (bucket.background.as_mut(), bucket.main.as_mut()) {
                (Some(bg), Some(main)) => match try_acquire_nested(bg, main, cost, now_ms) {
                    NestedResult::Allowed => Admission::Granted,
                    NestedResult::DeniedLocal { wait_ms } | NestedResult::DeniedGlobal { wait_ms } => {
                        Admission::Wait { wait_ms, priority }
                    }
                },
                (Some(only), None) | (None, Some(only)) => {
                    if only.try_acquire(cost, now_ms) {
                        Admission::Granted
                    } else {
                        Admission::Wait {
                            wait_ms: only.wait_time_ms(cost, now_ms),
                            priority,
                        }
                    }
                }
                (None, None) => Admission::Granted,
            }
        })
    }

    /// Drop limiter state of a removed group.
    pub fn forget(&self, group: &str) {
        if self.buckets.remove(&group.trim().to_lowercase()).is_some() {
            tracing::debug!(group, "controller state dropped");
        }
    }

    /// Statistics for a group that has been charged at least once.
    #[must_use]
    pub fn stats(&self, group: &str) -> Option<GroupBucketStats> {
        let entry = self.buckets.get(&group.trim().to_lowercase())?;
        let bucket = entry.lock().unwrap_or_else(|e| e.into_inner());
        Some(GroupBucketStats {
            group: bucket.config.name.clone(),
            burst_limit: bucket.config.burst_limit().to_wire(),
            main: bucket.main.as_ref().map(TokenBucket::stats),
            background: bucket.background.as_ref().map(TokenBucket::stats),
        })
    }

    /// Number of groups with live limiter state.
    #[must_use]
    pub fn tracked_groups(&self) -> usize {
        self.buckets.len()
    }
}

/// Background budget of `group`: `utilization_limit`% of its rate, or of
/// `reference_ru` when the group is unlimited. `None` when uncapped.
fn background_bucket(
    group: &GroupConfig,
    default: &GroupConfig,
    reference_ru: u64,
    now_ms: u64,
) -> Option<TokenBucket> {
    let limit = default.background.as_ref()?.utilization_limit?;
    if limit == 0 || limit >= 100 {
        return None;
    }
    let base = group.ru_rate.per_sec().unwrap_or(reference_ru) as f64;
    let rate = (base * f64::from(limit) / 100.0).max(1.0);
    Some(TokenBucket::new(rate, rate, now_ms))
}
