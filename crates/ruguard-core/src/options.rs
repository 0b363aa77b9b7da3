//! DDL option grammar for `CREATE/ALTER RESOURCE GROUP`.
//!
//! An external parser turns statement text into a sequence of
//! [`AlterOption`]s. Application is two-phase:
//!
//! 1. [`validate_options`] rejects duplicates and malformed blocks without
//!    touching any config.
//! 2. [`apply_options`] applies every option to a clone of the current
//!    config and re-validates the result.
//!
//! A rejected statement therefore never leaves a partially applied group.
//! `QUERY_LIMIT` and `BACKGROUND` replace their whole block; every other
//! option merges into the existing settings.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GroupError;
use crate::group::{
    BackgroundSettings, BurstMode, DEFAULT_GROUP_NAME, GroupConfig, Priority, RuRate,
    RunawayAction, RunawayRule, WatchType, normalize_group_name,
};

// =============================================================================
// Option model
// =============================================================================

/// One top-level option of a resource group statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlterOption {
    RuPerSec(RuRate),
    Priority(Priority),
    /// Bare `BURSTABLE` is `Burstable(BurstMode::Moderated)`.
    Burstable(BurstMode),
    QueryLimit(Vec<QueryLimitOption>),
    /// `QUERY_LIMIT=NULL`
    ClearQueryLimit,
    /// An empty list clears the background block.
    Background(Vec<BackgroundOption>),
}

/// One entry inside `QUERY_LIMIT=(...)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryLimitOption {
    ExecElapsed(Duration),
    ProcessedKeys(u64),
    Ru(u64),
    Action(RunawayAction),
    /// `WATCH=<type> [DURATION=...]`; no duration means unlimited.
    Watch(WatchType, Option<WatchDuration>),
}

/// `DURATION=` value of a watch clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchDuration {
    Unlimited,
    Finite(Duration),
}

impl WatchDuration {
    /// Milliseconds, 0 meaning unlimited.
    #[must_use]
    pub fn as_millis(self) -> u64 {
        match self {
            Self::Unlimited => 0,
            Self::Finite(d) => duration_to_ms(d),
        }
    }
}

impl FromStr for WatchDuration {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_matches(|c| c == '\'' || c == '"');
        if trimmed.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        let d = parse_duration(trimmed)?;
        if d.is_zero() {
            Ok(Self::Unlimited)
        } else {
            Ok(Self::Finite(d))
        }
    }
}

/// One entry inside `BACKGROUND=(...)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundOption {
    /// Comma separated list as written by the operator.
    TaskTypes(String),
    UtilizationLimit(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum OptionKind {
    RuPerSec,
    Priority,
    Burstable,
    QueryLimit,
    Background,
}

impl OptionKind {
    fn of(option: &AlterOption) -> Self {
        match option {
            AlterOption::RuPerSec(_) => Self::RuPerSec,
            AlterOption::Priority(_) => Self::Priority,
            AlterOption::Burstable(_) => Self::Burstable,
            AlterOption::QueryLimit(_) | AlterOption::ClearQueryLimit => Self::QueryLimit,
            AlterOption::Background(_) => Self::Background,
        }
    }

    fn keyword(self) -> &'static str {
        match self {
            Self::RuPerSec => "RU_PER_SEC",
            Self::Priority => "PRIORITY",
            Self::Burstable => "BURSTABLE",
            Self::QueryLimit => "QUERY_LIMIT",
            Self::Background => "BACKGROUND",
        }
    }
}

fn query_limit_keyword(option: &QueryLimitOption) -> &'static str {
    match option {
        QueryLimitOption::ExecElapsed(_) => "EXEC_ELAPSED",
        QueryLimitOption::ProcessedKeys(_) => "PROCESSED_KEYS",
        QueryLimitOption::Ru(_) => "RU",
        QueryLimitOption::Action(_) => "ACTION",
        QueryLimitOption::Watch(..) => "WATCH",
    }
}

fn background_keyword(option: &BackgroundOption) -> &'static str {
    match option {
        BackgroundOption::TaskTypes(_) => "TASK_TYPES",
        BackgroundOption::UtilizationLimit(_) => "UTILIZATION_LIMIT",
    }
}

// =============================================================================
// Phase 1: validate
// =============================================================================

/// Validate a whole option list for a group. Nothing is mutated.
pub fn validate_options(options: &[AlterOption], target_is_default: bool) -> Result<(), GroupError> {
    let mut seen = HashSet::new();
    for option in options {
        let kind = OptionKind::of(option);
        if !seen.insert(kind) {
            return Err(GroupError::DuplicatedOption(format!(
                "Duplicated options specified: {}",
                kind.keyword()
            )));
        }
        match option {
            AlterOption::QueryLimit(entries) => validate_query_limit(entries)?,
            AlterOption::Background(entries) => {
                if !target_is_default {
                    return Err(GroupError::UnsupportedOperation(
                        "background settings are only allowed on the default resource group"
                            .to_string(),
                    ));
                }
                validate_background(entries)?;
            }
            AlterOption::RuPerSec(RuRate::Limited(0)) => {
                return Err(GroupError::InvalidGroupSettings(
                    "RU_PER_SEC must be positive".to_string(),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn validate_query_limit(entries: &[QueryLimitOption]) -> Result<(), GroupError> {
    let mut seen = HashSet::new();
    let mut has_threshold = false;
    let mut has_action = false;
    for entry in entries {
        let keyword = query_limit_keyword(entry);
        if !seen.insert(keyword) {
            return Err(GroupError::DuplicatedOption(format!(
                "Duplicated runaway options specified: {keyword}"
            )));
        }
        match entry {
            QueryLimitOption::ExecElapsed(d) => has_threshold |= duration_to_ms(*d) > 0,
            QueryLimitOption::ProcessedKeys(n) | QueryLimitOption::Ru(n) => {
                has_threshold |= *n > 0;
            }
            QueryLimitOption::Action(action) => {
                has_action = true;
                if let RunawayAction::SwitchGroup(target) = action {
                    if target.trim().is_empty() {
                        return Err(GroupError::InvalidGroupSettings(
                            "unknown resource group runaway switch group name".to_string(),
                        ));
                    }
                }
            }
            QueryLimitOption::Watch(..) => {}
        }
    }
    if !has_threshold {
        return Err(GroupError::InvalidGroupSettings(
            "please set at least one field(exec_elapsed_time_ms, processed_keys, ru)".to_string(),
        ));
    }
    if !has_action {
        return Err(GroupError::InvalidGroupSettings(
            "unknown resource group runaway action".to_string(),
        ));
    }
    Ok(())
}

fn validate_background(entries: &[BackgroundOption]) -> Result<(), GroupError> {
    let mut seen = HashSet::new();
    for entry in entries {
        let keyword = background_keyword(entry);
        if !seen.insert(keyword) {
            return Err(GroupError::DuplicatedOption(format!(
                "Duplicated background options specified: {keyword}"
            )));
        }
        match entry {
            BackgroundOption::TaskTypes(csv) => {
                BackgroundSettings::parse_task_types(csv)?;
            }
            BackgroundOption::UtilizationLimit(limit) => {
                if *limit > 100 {
                    return Err(GroupError::InvalidGroupSettings(format!(
                        "utilization_limit {limit} out of range 0..=100"
                    )));
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Phase 2: apply
// =============================================================================

/// Apply `options` to a clone of `base`. Runs phase 1 first and re-validates
/// the result, so the returned config is always committable.
pub fn apply_options(base: &GroupConfig, options: &[AlterOption]) -> Result<GroupConfig, GroupError> {
    validate_options(options, base.is_default())?;

    let mut next = base.clone();
    for option in options {
        match option {
            AlterOption::RuPerSec(rate) => next.ru_rate = *rate,
            AlterOption::Priority(priority) => next.priority = *priority,
            AlterOption::Burstable(mode) => next.burst_mode = *mode,
            AlterOption::QueryLimit(entries) => next.runaway = Some(build_rule(entries)?),
            AlterOption::ClearQueryLimit => next.runaway = None,
            AlterOption::Background(entries) => next.background = build_background(entries)?,
        }
    }
    next.validate()?;
    Ok(next)
}

fn build_rule(entries: &[QueryLimitOption]) -> Result<RunawayRule, GroupError> {
    let mut rule = RunawayRule {
        exec_elapsed_ms: 0,
        processed_keys: 0,
        ru: 0,
        action: RunawayAction::DryRun,
        watch_type: WatchType::None,
        watch_duration_ms: 0,
    };
    for entry in entries {
        match entry {
            QueryLimitOption::ExecElapsed(d) => rule.exec_elapsed_ms = duration_to_ms(*d),
            QueryLimitOption::ProcessedKeys(n) => rule.processed_keys = *n,
            QueryLimitOption::Ru(n) => rule.ru = *n,
            QueryLimitOption::Action(RunawayAction::SwitchGroup(target)) => {
                rule.action = RunawayAction::SwitchGroup(normalize_group_name(target)?);
            }
            QueryLimitOption::Action(action) => rule.action = action.clone(),
            QueryLimitOption::Watch(watch_type, duration) => {
                rule.watch_type = *watch_type;
                rule.watch_duration_ms = duration.map_or(0, WatchDuration::as_millis);
            }
        }
    }
    Ok(rule)
}

fn build_background(entries: &[BackgroundOption]) -> Result<Option<BackgroundSettings>, GroupError> {
    if entries.is_empty() {
        return Ok(None);
    }
    let mut settings = BackgroundSettings::default();
    for entry in entries {
        match entry {
            BackgroundOption::TaskTypes(csv) => {
                settings.task_types = BackgroundSettings::parse_task_types(csv)?;
            }
            BackgroundOption::UtilizationLimit(limit) => {
                let limit = u8::try_from(*limit).map_err(|_| {
                    GroupError::InvalidGroupSettings(format!(
                        "utilization_limit {limit} out of range 0..=100"
                    ))
                })?;
                settings.utilization_limit = Some(limit);
            }
        }
    }
    Ok(Some(settings))
}

impl GroupConfig {
    /// Build a new group from `CREATE RESOURCE GROUP` options.
    ///
    /// `RU_PER_SEC` is required; every other field takes its creation default.
    pub fn from_options(name: &str, options: &[AlterOption]) -> Result<Self, GroupError> {
        let name = normalize_group_name(name)?;
        validate_options(options, name == DEFAULT_GROUP_NAME)?;
        let rate = options
            .iter()
            .find_map(|option| match option {
                AlterOption::RuPerSec(rate) => Some(*rate),
                _ => None,
            })
            .ok_or_else(|| {
                GroupError::InvalidGroupSettings(
                    "unknown resource group mode: RU_PER_SEC is required".to_string(),
                )
            })?;
        let base = Self::new(&name, rate)?;
        apply_options(&base, options)
    }
}

// =============================================================================
// Textual parsers
// =============================================================================

impl FromStr for Priority {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(GroupError::InvalidGroupSettings(format!(
                "unknown priority '{other}'"
            ))),
        }
    }
}

impl FromStr for BurstMode {
    type Err = GroupError;

    /// An empty string is the bare `BURSTABLE` keyword.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "moderated" => Ok(Self::Moderated),
            "off" => Ok(Self::Off),
            "unlimited" => Ok(Self::Unlimited),
            other => Err(GroupError::InvalidGroupSettings(format!(
                "unknown burstable mode '{other}'"
            ))),
        }
    }
}

impl FromStr for WatchType {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "exact" => Ok(Self::Exact),
            "similar" => Ok(Self::Similar),
            "plan" => Ok(Self::Plan),
            other => Err(GroupError::InvalidGroupSettings(format!(
                "unknown watch type '{other}'"
            ))),
        }
    }
}

impl FromStr for RunawayAction {
    type Err = GroupError;

    /// Accepts `kill`, `cooldown`, `dryrun` and `switch_group(name)`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_lowercase();
        if let Some(rest) = lower.strip_prefix("switch_group") {
            let inner = rest
                .trim()
                .strip_prefix('(')
                .and_then(|r| r.strip_suffix(')'))
                .map(str::trim)
                .ok_or_else(|| {
                    GroupError::InvalidGroupSettings(format!("malformed action '{trimmed}'"))
                })?;
            return Ok(Self::SwitchGroup(inner.to_string()));
        }
        match lower.as_str() {
            "kill" => Ok(Self::Kill),
            "cooldown" => Ok(Self::Cooldown),
            "dryrun" => Ok(Self::DryRun),
            _ => Err(GroupError::InvalidGroupSettings(
                "unknown resource group runaway action".to_string(),
            )),
        }
    }
}

impl FromStr for RuRate {
    type Err = GroupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("unlimited") {
            return Ok(Self::Unlimited);
        }
        let n: u64 = trimmed.parse().map_err(|_| {
            GroupError::InvalidGroupSettings(format!("invalid RU_PER_SEC '{trimmed}'"))
        })?;
        Self::limited(n)
    }
}

// =============================================================================
// Durations
// =============================================================================

fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

fn unit_nanos(unit: &str) -> Option<u128> {
    match unit {
        "ns" => Some(1),
        "us" | "µs" | "μs" => Some(1_000),
        "ms" => Some(1_000_000),
        "s" => Some(1_000_000_000),
        "m" => Some(60_000_000_000),
        "h" => Some(3_600_000_000_000),
        _ => None,
    }
}

/// Parse a duration string such as `50ms`, `15s`, `10m0s`, `1.5h`.
///
/// Each component is a decimal number followed by a unit (`ns`, `us`, `ms`,
/// `s`, `m`, `h`). A bare `0` is accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration, GroupError> {
    let original = input.trim();
    let invalid =
        || GroupError::InvalidGroupSettings(format!("time: invalid duration \"{original}\""));

    let mut s = original.strip_prefix('+').unwrap_or(original);
    if s.starts_with('-') {
        return Err(GroupError::InvalidGroupSettings(format!(
            "time: negative duration \"{original}\""
        )));
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total: u128 = 0;
    while !s.is_empty() {
        let int_len = s.bytes().take_while(u8::is_ascii_digit).count();
        let int_part = &s[..int_len];
        s = &s[int_len..];

        let mut frac_part = "";
        if let Some(rest) = s.strip_prefix('.') {
            let frac_len = rest.bytes().take_while(u8::is_ascii_digit).count();
            frac_part = &rest[..frac_len];
            s = &rest[frac_len..];
        }
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(invalid());
        }

        let unit_len = s
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() || *c == '.')
            .map_or(s.len(), |(idx, _)| idx);
        let unit = &s[..unit_len];
        s = &s[unit_len..];
        if unit.is_empty() {
            return Err(GroupError::InvalidGroupSettings(format!(
                "time: missing unit in duration \"{original}\""
            )));
        }
        let scale = unit_nanos(unit).ok_or_else(|| {
            GroupError::InvalidGroupSettings(format!(
                "time: unknown unit \"{unit}\" in duration \"{original}\""
            ))
        })?;

        let whole: u128 = if int_part.is_empty() {
            0
        } else {
            int_part.parse().map_err(|_| invalid())?
        };
        let mut nanos = whole.checked_mul(scale).ok_or_else(invalid)?;
        if !frac_part.is_empty() {
            // Keep at most 18 fractional digits; finer than a nanosecond anyway.
            let digits = &frac_part[..frac_part.len().min(18)];
            let frac: u128 = digits.parse().map_err(|_| invalid())?;
            let denom = 10u128.pow(digits.len() as u32);
            nanos = nanos
                .checked_add(frac.checked_mul(scale).ok_or_else(invalid)? / denom)
                .ok_or_else(invalid)?;
        }
        total = total.checked_add(nanos).ok_or_else(invalid)?;
    }

    let secs = u64::try_from(total / 1_000_000_000).map_err(|_| invalid())?;
    Ok(Duration::new(secs, (total % 1_000_000_000) as u32))
}

/// Render milliseconds the way the catalog shows durations: `50ms`, `15s`,
/// `10m0s`, `1h0m0s`, `1.5s`.
#[must_use]
pub fn format_duration_ms(ms: u64) -> String {
    if ms == 0 {
        return "0s".to_string();
    }
    if ms < 1_000 {
        return format!("{ms}ms");
    }
    let hours = ms / 3_600_000;
    let minutes = (ms % 3_600_000) / 60_000;
    let rem_ms = ms % 60_000;
    let secs = rem_ms / 1_000;
    let frac = rem_ms % 1_000;
    let secs_text = if frac == 0 {
        secs.to_string()
    } else {
        let frac_text = format!("{frac:03}");
        format!("{secs}.{}", frac_text.trim_end_matches('0'))
    };
    if hours > 0 {
        format!("{hours}h{minutes}m{secs_text}s")
    } else if minutes > 0 {
        format!("{minutes}m{secs_text}s")
    } else {
        format!("{secs_text}s")
    }
}
