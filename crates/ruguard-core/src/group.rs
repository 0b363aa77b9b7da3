//! Resource group configuration model.
//!
//! A [`GroupConfig`] is an immutable snapshot of one group's settings. The
//! registry owns them and hands out `Arc<GroupConfig>`; every other component
//! resolves groups by name at use time.
//!
//! Burst semantics are modelled as [`BurstMode`] (what the operator asked for)
//! and [`BurstLimit`] (what the limiter enforces). The historical integer
//! sentinels (`2147483647`, `-1`, `-2`) only exist in [`WireGroupSettings`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::options::format_duration_ms;

// =============================================================================
// Constants
// =============================================================================

/// Name of the reserved group every unbound query falls back to.
pub const DEFAULT_GROUP_NAME: &str = "default";

/// Registry id of the reserved default group.
pub const DEFAULT_GROUP_ID: u64 = 1;

/// Maximum group name length in bytes.
pub const MAX_GROUP_NAME_LEN: usize = 32;

/// Wire value of `RU_PER_SEC=UNLIMITED`.
pub const UNLIMITED_RU_WIRE: i64 = i32::MAX as i64;

/// Background task types accepted by `BACKGROUND=(TASK_TYPES=...)`.
pub const BACKGROUND_TASK_TYPES: [&str; 5] = ["lightning", "br", "ddl", "stats", "background"];

/// Lower-case and validate a group name.
pub fn normalize_group_name(name: &str) -> Result<String, GroupError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GroupError::InvalidGroupSettings(
            "resource group name is empty".to_string(),
        ));
    }
    if trimmed.len() > MAX_GROUP_NAME_LEN {
        return Err(GroupError::InvalidGroupSettings(format!(
            "resource group name '{trimmed}' is too long (max {MAX_GROUP_NAME_LEN} bytes)"
        )));
    }
    Ok(trimmed.to_lowercase())
}

// =============================================================================
// RU rate
// =============================================================================

/// Steady-state refill rate in request units per second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuRate {
    /// A finite rate, `1 <= n < i32::MAX`.
    Limited(u64),
    /// No rate cap.
    Unlimited,
}

impl RuRate {
    /// Build a limited rate, rejecting zero and values that collide with the
    /// unlimited sentinel.
    pub fn limited(n: u64) -> Result<Self, GroupError> {
        if n == 0 {
            return Err(GroupError::InvalidGroupSettings(
                "RU_PER_SEC must be positive".to_string(),
            ));
        }
        if n >= UNLIMITED_RU_WIRE as u64 {
            return Ok(Self::Unlimited);
        }
        Ok(Self::Limited(n))
    }

    /// Refill rate, or `None` when unlimited.
    #[must_use]
    pub fn per_sec(self) -> Option<u64> {
        match self {
            Self::Limited(n) => Some(n),
            Self::Unlimited => None,
        }
    }

    #[must_use]
    pub fn is_unlimited(self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Wire encoding: `n`, or `2147483647` for unlimited.
    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Limited(n) => n as i64,
            Self::Unlimited => UNLIMITED_RU_WIRE,
        }
    }

    pub fn from_wire(raw: i64) -> Result<Self, GroupError> {
        if raw <= 0 {
            return Err(GroupError::InvalidGroupSettings(format!(
                "invalid ru_per_sec {raw}"
            )));
        }
        Self::limited(raw as u64)
    }
}

impl fmt::Display for RuRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Limited(n) => write!(f, "{n}"),
            Self::Unlimited => f.write_str("UNLIMITED"),
        }
    }
}

// =============================================================================
// Burst
// =============================================================================

/// Operator-facing burst policy. Stored independently of [`RuRate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BurstMode {
    /// Steady state only.
    #[default]
    Off,
    /// Capacity is a dynamically recomputed multiple of the rate.
    Moderated,
    /// No burst cap.
    Unlimited,
}

impl BurstMode {
    /// Raw mode stored on the wire: 0 off, -1 unlimited, -2 moderated.
    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Off => 0,
            Self::Unlimited => -1,
            Self::Moderated => -2,
        }
    }

    pub fn from_wire(raw: i64) -> Result<Self, GroupError> {
        match raw {
            -1 => Ok(Self::Unlimited),
            -2 => Ok(Self::Moderated),
            n if n >= 0 => Ok(Self::Off),
            other => Err(GroupError::InvalidGroupSettings(format!(
                "invalid burst_limit {other}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "OFF",
            Self::Moderated => "MODERATED",
            Self::Unlimited => "UNLIMITED",
        }
    }
}

impl fmt::Display for BurstMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Adjusted capacity the limiter enforces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BurstLimit {
    /// Capacity equals the steady rate.
    Fixed(u64),
    /// No capacity cap.
    Unlimited,
    /// Capacity is recomputed from the rate and scheduler headroom.
    Moderated,
}

impl BurstLimit {
    /// Historical adjusted encoding: `n`, `-1` unlimited, `-2` moderated.
    #[must_use]
    pub fn to_wire(self) -> i64 {
        match self {
            Self::Fixed(n) => n as i64,
            Self::Unlimited => -1,
            Self::Moderated => -2,
        }
    }
}

// =============================================================================
// Priority
// =============================================================================

/// Scheduling priority of a group, ordered low to high.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Wire value: 1 / 8 / 16.
    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::Low => 1,
            Self::Medium => 8,
            Self::High => 16,
        }
    }

    pub fn from_wire(raw: u32) -> Result<Self, GroupError> {
        match raw {
            1 => Ok(Self::Low),
            8 => Ok(Self::Medium),
            16 => Ok(Self::High),
            other => Err(GroupError::InvalidGroupSettings(format!(
                "invalid priority {other}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Medium => "MEDIUM",
            Self::High => "HIGH",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Runaway rule
// =============================================================================

/// What happens to a query that breaches a runaway threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunawayAction {
    Kill,
    Cooldown,
    DryRun,
    SwitchGroup(String),
}

impl RunawayAction {
    /// Wire value: dryrun 1, cooldown 2, kill 3, switch_group 4.
    #[must_use]
    pub fn to_wire(&self) -> i32 {
        match self {
            Self::DryRun => 1,
            Self::Cooldown => 2,
            Self::Kill => 3,
            Self::SwitchGroup(_) => 4,
        }
    }

    pub fn from_wire(raw: i32, switch_group: &str) -> Result<Self, GroupError> {
        match raw {
            1 => Ok(Self::DryRun),
            2 => Ok(Self::Cooldown),
            3 => Ok(Self::Kill),
            4 => Ok(Self::SwitchGroup(switch_group.to_string())),
            _ => Err(GroupError::InvalidGroupSettings(
                "unknown resource group runaway action".to_string(),
            )),
        }
    }

    /// Short label used in audit rows and log fields.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Kill => "kill",
            Self::Cooldown => "cooldown",
            Self::DryRun => "dryrun",
            Self::SwitchGroup(_) => "switch_group",
        }
    }
}

impl fmt::Display for RunawayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kill => f.write_str("KILL"),
            Self::Cooldown => f.write_str("COOLDOWN"),
            Self::DryRun => f.write_str("DRYRUN"),
            Self::SwitchGroup(target) => write!(f, "SWITCH_GROUP({target})"),
        }
    }
}

/// Fingerprint granularity of a watch entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchType {
    #[default]
    None,
    Exact,
    Similar,
    Plan,
}

impl WatchType {
    /// Wire value: none 0, exact 1, similar 2, plan 3.
    #[must_use]
    pub fn to_wire(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Exact => 1,
            Self::Similar => 2,
            Self::Plan => 3,
        }
    }

    pub fn from_wire(raw: i32) -> Result<Self, GroupError> {
        match raw {
            0 => Ok(Self::None),
            1 => Ok(Self::Exact),
            2 => Ok(Self::Similar),
            3 => Ok(Self::Plan),
            other => Err(GroupError::InvalidGroupSettings(format!(
                "invalid watch type {other}"
            ))),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Exact => "EXACT",
            Self::Similar => "SIMILAR",
            Self::Plan => "PLAN",
        }
    }
}

impl fmt::Display for WatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runaway thresholds and the action taken on breach. Zero disables a threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunawayRule {
    pub exec_elapsed_ms: u64,
    pub processed_keys: u64,
    pub ru: u64,
    pub action: RunawayAction,
    pub watch_type: WatchType,
    /// 0 = unlimited.
    pub watch_duration_ms: u64,
}

impl RunawayRule {
    /// A kill rule on elapsed time with no watch.
    #[must_use]
    pub fn kill_after_ms(exec_elapsed_ms: u64) -> Self {
        Self {
            exec_elapsed_ms,
            processed_keys: 0,
            ru: 0,
            action: RunawayAction::Kill,
            watch_type: WatchType::None,
            watch_duration_ms: 0,
        }
    }

    /// Whether at least one threshold is set.
    #[must_use]
    pub fn has_threshold(&self) -> bool {
        self.exec_elapsed_ms > 0 || self.processed_keys > 0 || self.ru > 0
    }

    pub fn validate(&self) -> Result<(), GroupError> {
        if !self.has_threshold() {
            return Err(GroupError::InvalidGroupSettings(
                "please set at least one field(exec_elapsed_time_ms, processed_keys, ru)"
                    .to_string(),
            ));
        }
        if let RunawayAction::SwitchGroup(target) = &self.action {
            if target.trim().is_empty() {
                return Err(GroupError::InvalidGroupSettings(
                    "unknown resource group runaway switch group name".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Watch expiry for an entry created at `now_ms`, `None` when unlimited.
    #[must_use]
    pub fn watch_expiry(&self, now_ms: u64) -> Option<u64> {
        if self.watch_duration_ms == 0 {
            None
        } else {
            Some(now_ms.saturating_add(self.watch_duration_ms))
        }
    }
}

impl fmt::Display for RunawayRule {
    /// Renders e.g. `EXEC_ELAPSED='15s', PROCESSED_KEYS=100, ACTION=KILL, WATCH=EXACT DURATION='1h0m0s'`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(5);
        if self.exec_elapsed_ms > 0 {
            parts.push(format!(
                "EXEC_ELAPSED='{}'",
                format_duration_ms(self.exec_elapsed_ms)
            ));
        }
        if self.processed_keys > 0 {
            parts.push(format!("PROCESSED_KEYS={}", self.processed_keys));
        }
        if self.ru > 0 {
            parts.push(format!("RU={}", self.ru));
        }
        parts.push(format!("ACTION={}", self.action));
        if self.watch_type != WatchType::None {
            let duration = if self.watch_duration_ms == 0 {
                "UNLIMITED".to_string()
            } else {
                format!("'{}'", format_duration_ms(self.watch_duration_ms))
            };
            parts.push(format!("WATCH={} DURATION={duration}", self.watch_type));
        }
        f.write_str(&parts.join(", "))
    }
}

// =============================================================================
// Background
// =============================================================================

/// Background task settings, valid only on the default group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BackgroundSettings {
    /// Lower-cased task types in the order first given.
    pub task_types: Vec<String>,
    /// Percentage of the group rate background work may use.
    pub utilization_limit: Option<u8>,
}

impl BackgroundSettings {
    /// Parse a comma separated task type list, lower-casing and trimming each
    /// entry and dropping duplicates.
    pub fn parse_task_types(csv: &str) -> Result<Vec<String>, GroupError> {
        let mut types: Vec<String> = Vec::new();
        for raw in csv.split(',') {
            let ty = raw.trim().to_lowercase();
            if ty.is_empty() {
                continue;
            }
            if !BACKGROUND_TASK_TYPES.contains(&ty.as_str()) {
                return Err(GroupError::InvalidGroupSettings(format!(
                    "unknown background task type '{ty}'"
                )));
            }
            if !types.contains(&ty) {
                types.push(ty);
            }
        }
        Ok(types)
    }

    pub fn validate(&self) -> Result<(), GroupError> {
        for ty in &self.task_types {
            if !BACKGROUND_TASK_TYPES.contains(&ty.as_str()) {
                return Err(GroupError::InvalidGroupSettings(format!(
                    "unknown background task type '{ty}'"
                )));
            }
        }
        if let Some(limit) = self.utilization_limit {
            if limit > 100 {
                return Err(GroupError::InvalidGroupSettings(format!(
                    "utilization_limit {limit} out of range 0..=100"
                )));
            }
        }
        Ok(())
    }

    /// Whether `task_type` (case-insensitive) is treated as background work.
    #[must_use]
    pub fn covers(&self, task_type: &str) -> bool {
        let ty = task_type.trim().to_lowercase();
        self.task_types.iter().any(|t| *t == ty)
    }
}

impl fmt::Display for BackgroundSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(2);
        if !self.task_types.is_empty() {
            parts.push(format!("TASK_TYPES='{}'", self.task_types.join(",")));
        }
        if let Some(limit) = self.utilization_limit {
            parts.push(format!("UTILIZATION_LIMIT={limit}"));
        }
        f.write_str(&parts.join(", "))
    }
}

// =============================================================================
// GroupConfig
// =============================================================================

/// Immutable snapshot of one resource group's settings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Assigned by the registry on create; 0 before that.
    pub id: u64,
    /// Lower-cased unique name.
    pub name: String,
    pub ru_rate: RuRate,
    pub burst_mode: BurstMode,
    pub priority: Priority,
    pub background: Option<BackgroundSettings>,
    pub runaway: Option<RunawayRule>,
}

impl GroupConfig {
    /// A new group with creation defaults: MEDIUM priority, burst OFF, no
    /// runaway rule and no background settings.
    pub fn new(name: &str, ru_rate: RuRate) -> Result<Self, GroupError> {
        Ok(Self {
            id: 0,
            name: normalize_group_name(name)?,
            ru_rate,
            burst_mode: BurstMode::Off,
            priority: Priority::Medium,
            background: None,
            runaway: None,
        })
    }

    /// The reserved default group.
    #[must_use]
    pub fn default_group() -> Self {
        Self {
            id: DEFAULT_GROUP_ID,
            name: DEFAULT_GROUP_NAME.to_string(),
            ru_rate: RuRate::Unlimited,
            burst_mode: BurstMode::Unlimited,
            priority: Priority::Medium,
            background: None,
            runaway: None,
        }
    }

    #[must_use]
    pub fn with_burst_mode(mut self, mode: BurstMode) -> Self {
        self.burst_mode = mode;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn with_runaway(mut self, rule: RunawayRule) -> Self {
        self.runaway = Some(rule);
        self
    }

    #[must_use]
    pub fn is_default(&self) -> bool {
        self.name == DEFAULT_GROUP_NAME
    }

    /// Resolve the adjusted capacity for the limiter.
    #[must_use]
    pub fn burst_limit(&self) -> BurstLimit {
        match (self.ru_rate, self.burst_mode) {
            (RuRate::Unlimited, _) => BurstLimit::Unlimited,
            (RuRate::Limited(n), BurstMode::Off) => BurstLimit::Fixed(n),
            (RuRate::Limited(_), BurstMode::Unlimited) => BurstLimit::Unlimited,
            (RuRate::Limited(_), BurstMode::Moderated) => BurstLimit::Moderated,
        }
    }

    /// Check every invariant a committed config must hold.
    pub fn validate(&self) -> Result<(), GroupError> {
        let normalized = normalize_group_name(&self.name)?;
        if normalized != self.name {
            return Err(GroupError::InvalidGroupSettings(format!(
                "resource group name '{}' is not normalized",
                self.name
            )));
        }
        if let RuRate::Limited(n) = self.ru_rate {
            if n == 0 || n >= UNLIMITED_RU_WIRE as u64 {
                return Err(GroupError::InvalidGroupSettings(format!(
                    "RU_PER_SEC {n} out of range"
                )));
            }
        }
        if let Some(rule) = &self.runaway {
            rule.validate()?;
        }
        if let Some(background) = &self.background {
            if !self.is_default() {
                return Err(GroupError::UnsupportedOperation(
                    "background settings are only allowed on the default resource group"
                        .to_string(),
                ));
            }
            background.validate()?;
        }
        Ok(())
    }

    /// Render the group as a `CREATE RESOURCE GROUP` statement.
    #[must_use]
    pub fn show_create(&self) -> String {
        let mut parts = vec![
            format!("RU_PER_SEC={}", self.ru_rate),
            format!("PRIORITY={}", self.priority),
        ];
        if self.burst_mode != BurstMode::Off {
            parts.push(format!("BURSTABLE({})", self.burst_mode));
        }
        if let Some(rule) = &self.runaway {
            let mut limit = Vec::new();
            if rule.exec_elapsed_ms > 0 {
                limit.push(format!(
                    "EXEC_ELAPSED=\"{}\"",
                    format_duration_ms(rule.exec_elapsed_ms)
                ));
            }
            if rule.processed_keys > 0 {
                limit.push(format!("PROCESSED_KEYS={}", rule.processed_keys));
            }
            if rule.ru > 0 {
                limit.push(format!("RU={}", rule.ru));
            }
            limit.push(format!("ACTION={}", rule.action));
            if rule.watch_type != WatchType::None {
                let duration = if rule.watch_duration_ms == 0 {
                    "UNLIMITED".to_string()
                } else {
                    format!("\"{}\"", format_duration_ms(rule.watch_duration_ms))
                };
                limit.push(format!("WATCH={} DURATION={duration}", rule.watch_type));
            }
            parts.push(format!("QUERY_LIMIT=({})", limit.join(" ")));
        }
        if let Some(background) = &self.background {
            parts.push(format!("BACKGROUND=({background})"));
        }
        format!("CREATE RESOURCE GROUP `{}` {}", self.name, parts.join(", "))
    }

    /// Encode with the historical sentinels.
    #[must_use]
    pub fn to_wire(&self) -> WireGroupSettings {
        WireGroupSettings {
            id: self.id,
            name: self.name.clone(),
            ru_per_sec: self.ru_rate.to_wire(),
            burst_limit: self.burst_mode.to_wire(),
            priority: self.priority.to_wire(),
            runaway: self.runaway.as_ref().map(|rule| WireRunawaySettings {
                exec_elapsed_ms: rule.exec_elapsed_ms,
                processed_keys: rule.processed_keys,
                ru: rule.ru,
                action: rule.action.to_wire(),
                switch_group_name: match &rule.action {
                    RunawayAction::SwitchGroup(target) => target.clone(),
                    _ => String::new(),
                },
                watch_type: rule.watch_type.to_wire(),
                watch_duration_ms: rule.watch_duration_ms as i64,
            }),
            background: self.background.as_ref().map(|bg| WireBackgroundSettings {
                job_types: bg.task_types.clone(),
                utilization_limit: bg.utilization_limit.map(u64::from),
            }),
        }
    }

    /// Decode from the wire form and validate.
    pub fn from_wire(wire: &WireGroupSettings) -> Result<Self, GroupError> {
        let runaway = match &wire.runaway {
            Some(raw) => {
                if raw.watch_duration_ms < 0 {
                    return Err(GroupError::InvalidGroupSettings(format!(
                        "invalid watch duration {}",
                        raw.watch_duration_ms
                    )));
                }
                Some(RunawayRule {
                    exec_elapsed_ms: raw.exec_elapsed_ms,
                    processed_keys: raw.processed_keys,
                    ru: raw.ru,
                    action: RunawayAction::from_wire(raw.action, &raw.switch_group_name)?,
                    watch_type: WatchType::from_wire(raw.watch_type)?,
                    watch_duration_ms: raw.watch_duration_ms as u64,
                })
            }
            None => None,
        };
        let background = match &wire.background {
            Some(raw) => {
                let utilization_limit = raw
                    .utilization_limit
                    .map(|limit| {
                        u8::try_from(limit).map_err(|_| {
                            GroupError::InvalidGroupSettings(format!(
                                "utilization_limit {limit} out of range 0..=100"
                            ))
                        })
                    })
                    .transpose()?;
                Some(BackgroundSettings {
                    task_types: raw.job_types.clone(),
                    utilization_limit,
                })
            }
            None => None,
        };
        let config = Self {
            id: wire.id,
            name: normalize_group_name(&wire.name)?,
            ru_rate: RuRate::from_wire(wire.ru_per_sec)?,
            burst_mode: BurstMode::from_wire(wire.burst_limit)?,
            priority: Priority::from_wire(wire.priority)?,
            background,
            runaway,
        };
        config.validate()?;
        Ok(config)
    }
}

// =============================================================================
// Wire form
// =============================================================================

/// Serialized group settings using the historical integer encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireGroupSettings {
    pub id: u64,
    pub name: String,
    /// `2147483647` for UNLIMITED.
    pub ru_per_sec: i64,
    /// Raw burst mode: 0 off, -1 unlimited, -2 moderated.
    pub burst_limit: i64,
    /// 1 / 8 / 16.
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runaway: Option<WireRunawaySettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background: Option<WireBackgroundSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRunawaySettings {
    pub exec_elapsed_ms: u64,
    pub processed_keys: u64,
    pub ru: u64,
    pub action: i32,
    #[serde(default)]
    pub switch_group_name: String,
    pub watch_type: i32,
    pub watch_duration_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireBackgroundSettings {
    pub job_types: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub utilization_limit: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limited(n: u64) -> RuRate {
        RuRate::limited(n).unwrap()
    }

    #[test]
    fn default_group_shape() {
        let g = GroupConfig::default_group();
        assert_eq!(g.id, DEFAULT_GROUP_ID);
        assert!(g.is_default());
        assert_eq!(g.ru_rate, RuRate::Unlimited);
        assert_eq!(g.priority, Priority::Medium);
        assert_eq!(g.burst_mode, BurstMode::Unlimited);
        assert_eq!(g.burst_limit(), BurstLimit::Unlimited);
        assert_eq!(g.burst_limit().to_wire(), -1);
        assert_eq!(g.ru_rate.to_wire(), 2_147_483_647);
    }

    #[test]
    fn new_group_defaults() {
        let g = GroupConfig::new("RG1", limited(1000)).unwrap();
        assert_eq!(g.name, "rg1");
        assert_eq!(g.priority, Priority::Medium);
        assert_eq!(g.burst_mode, BurstMode::Off);
        assert_eq!(g.burst_limit(), BurstLimit::Fixed(1000));
        assert!(g.runaway.is_none());
        assert!(g.background.is_none());
    }

    #[test]
    fn name_too_long_rejected() {
        let err =
            GroupConfig::new("test_group_too_looooooooooooooooooooooong", limited(1)).unwrap_err();
        assert!(matches!(err, GroupError::InvalidGroupSettings(_)));
        assert!(GroupConfig::new(&"a".repeat(32), limited(1)).is_ok());
        assert!(GroupConfig::new("  ", limited(1)).is_err());
    }

    #[test]
    fn burst_limit_follows_rate_and_mode() {
        let base = GroupConfig::new("x", limited(1000)).unwrap();
        assert_eq!(base.burst_limit(), BurstLimit::Fixed(1000));
        assert_eq!(
            base.clone().with_burst_mode(BurstMode::Unlimited).burst_limit(),
            BurstLimit::Unlimited
        );
        assert_eq!(
            base.clone().with_burst_mode(BurstMode::Moderated).burst_limit(),
            BurstLimit::Moderated
        );
        assert_eq!(BurstLimit::Moderated.to_wire(), -2);

        let mut unlimited = base.with_burst_mode(BurstMode::Moderated);
        unlimited.ru_rate = RuRate::Unlimited;
        assert_eq!(unlimited.burst_limit(), BurstLimit::Unlimited);

        // Burst mode survives a round trip through UNLIMITED.
        unlimited.ru_rate = limited(1000);
        assert_eq!(unlimited.burst_limit(), BurstLimit::Moderated);
    }

    #[test]
    fn ru_rate_bounds() {
        assert!(RuRate::limited(0).is_err());
        assert_eq!(RuRate::limited(2_147_483_647).unwrap(), RuRate::Unlimited);
        assert_eq!(RuRate::from_wire(2_147_483_647).unwrap(), RuRate::Unlimited);
        assert!(RuRate::from_wire(-5).is_err());
        assert_eq!(RuRate::Unlimited.to_string(), "UNLIMITED");
        assert_eq!(limited(2000).to_string(), "2000");
    }

    #[test]
    fn priority_wire_values_and_order() {
        assert_eq!(Priority::Low.to_wire(), 1);
        assert_eq!(Priority::Medium.to_wire(), 8);
        assert_eq!(Priority::High.to_wire(), 16);
        assert!(Priority::Low < Priority::Medium);
        assert!(Priority::Medium < Priority::High);
        assert!(Priority::from_wire(3).is_err());
    }

    #[test]
    fn runaway_rule_requires_threshold() {
        let mut rule = RunawayRule::kill_after_ms(0);
        let err = rule.validate().unwrap_err();
        assert!(err.to_string().contains(
            "please set at least one field(exec_elapsed_time_ms, processed_keys, ru)"
        ));
        rule.processed_keys = 10;
        assert!(rule.validate().is_ok());
    }

    #[test]
    fn switch_group_requires_target() {
        let mut rule = RunawayRule::kill_after_ms(1000);
        rule.action = RunawayAction::SwitchGroup(String::new());
        assert!(matches!(
            rule.validate(),
            Err(GroupError::InvalidGroupSettings(_))
        ));
    }

    #[test]
    fn rule_text_matches_catalog_rendering() {
        let rule = RunawayRule {
            exec_elapsed_ms: 15_000,
            processed_keys: 100,
            ru: 0,
            action: RunawayAction::Kill,
            watch_type: WatchType::None,
            watch_duration_ms: 0,
        };
        assert_eq!(
            rule.to_string(),
            "EXEC_ELAPSED='15s', PROCESSED_KEYS=100, ACTION=KILL"
        );

        let watched = RunawayRule {
            exec_elapsed_ms: 1_000,
            processed_keys: 0,
            ru: 0,
            action: RunawayAction::Cooldown,
            watch_type: WatchType::Exact,
            watch_duration_ms: 3_600_000,
        };
        assert_eq!(
            watched.to_string(),
            "EXEC_ELAPSED='1s', ACTION=COOLDOWN, WATCH=EXACT DURATION='1h0m0s'"
        );

        let forever = RunawayRule {
            action: RunawayAction::SwitchGroup("y".to_string()),
            watch_type: WatchType::Similar,
            watch_duration_ms: 0,
            ..watched
        };
        assert_eq!(
            forever.to_string(),
            "EXEC_ELAPSED='1s', ACTION=SWITCH_GROUP(y), WATCH=SIMILAR DURATION=UNLIMITED"
        );
    }

    #[test]
    fn show_create_omits_burst_off() {
        let rule = RunawayRule {
            exec_elapsed_ms: 0,
            processed_keys: 200,
            ru: 300,
            action: RunawayAction::Kill,
            watch_type: WatchType::None,
            watch_duration_ms: 0,
        };
        let g = GroupConfig::new("x", limited(2000))
            .unwrap()
            .with_priority(Priority::Low)
            .with_burst_mode(BurstMode::Moderated)
            .with_runaway(rule);
        assert_eq!(
            g.show_create(),
            "CREATE RESOURCE GROUP `x` RU_PER_SEC=2000, PRIORITY=LOW, BURSTABLE(MODERATED), QUERY_LIMIT=(PROCESSED_KEYS=200 RU=300 ACTION=KILL)"
        );

        let off = GroupConfig::new("x", limited(3000))
            .unwrap()
            .with_priority(Priority::Low)
            .with_runaway(RunawayRule::kill_after_ms(15_000));
        assert_eq!(
            off.show_create(),
            "CREATE RESOURCE GROUP `x` RU_PER_SEC=3000, PRIORITY=LOW, QUERY_LIMIT=(EXEC_ELAPSED=\"15s\" ACTION=KILL)"
        );
    }

    #[test]
    fn background_task_types_are_normalized() {
        let types = BackgroundSettings::parse_task_types("lightning, BR").unwrap();
        assert_eq!(types, vec!["lightning".to_string(), "br".to_string()]);
        assert!(BackgroundSettings::parse_task_types("a,b,c").is_err());

        let bg = BackgroundSettings {
            task_types: types,
            utilization_limit: Some(30),
        };
        assert_eq!(bg.to_string(), "TASK_TYPES='lightning,br', UTILIZATION_LIMIT=30");
        assert!(bg.covers("BR"));
        assert!(!bg.covers("ddl"));
    }

    #[test]
    fn background_only_on_default_group() {
        let mut g = GroupConfig::new("bg", limited(1000)).unwrap();
        g.background = Some(BackgroundSettings {
            task_types: vec!["lightning".to_string()],
            utilization_limit: None,
        });
        assert!(matches!(
            g.validate(),
            Err(GroupError::UnsupportedOperation(_))
        ));

        let mut d = GroupConfig::default_group();
        d.background = g.background.clone();
        assert!(d.validate().is_ok());
    }

    #[test]
    fn wire_round_trip_keeps_sentinels() {
        let mut g = GroupConfig::new("x", RuRate::Unlimited)
            .unwrap()
            .with_burst_mode(BurstMode::Moderated);
        g.id = 7;
        let wire = g.to_wire();
        assert_eq!(wire.ru_per_sec, 2_147_483_647);
        assert_eq!(wire.burst_limit, -2);
        assert_eq!(GroupConfig::from_wire(&wire).unwrap(), g);

        let json = serde_json::to_string(&wire).unwrap();
        let back: WireGroupSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, wire);
    }

    #[test]
    fn from_wire_rejects_unknown_action() {
        let mut wire = GroupConfig::new("x", limited(10))
            .unwrap()
            .with_runaway(RunawayRule::kill_after_ms(50))
            .to_wire();
        if let Some(runaway) = wire.runaway.as_mut() {
            runaway.action = 0;
        }
        let err = GroupConfig::from_wire(&wire).unwrap_err();
        assert!(err.to_string().contains("unknown resource group runaway action"));
    }
}
