//! Property-based tests for group settings encoding.
//!
//! Properties tested:
//! - Any valid config survives `to_wire` → `from_wire` unchanged
//! - The wire form survives a JSON round trip
//! - RU_PER_SEC uses `i32::MAX` only for UNLIMITED
//! - The adjusted burst limit follows the (rate, mode) table
//! - `show_create` names the group and mirrors the optional blocks
//! - Non-default groups never accept background settings

use proptest::prelude::*;

use ruguard_core::group::{
    BACKGROUND_TASK_TYPES, BackgroundSettings, BurstLimit, BurstMode, GroupConfig, Priority,
    RuRate, RunawayAction, RunawayRule, UNLIMITED_RU_WIRE, WatchType, WireGroupSettings,
};

// ────────────────────────────────────────────────────────────────────
// Strategies
// ────────────────────────────────────────────────────────────────────

fn arb_name() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9_]{0,31}".prop_filter("reserved", |n| n != "default")
}

fn arb_rate() -> impl Strategy<Value = RuRate> {
    prop_oneof![
        3 => (1u64..UNLIMITED_RU_WIRE as u64).prop_map(RuRate::Limited),
        1 => Just(RuRate::Unlimited),
    ]
}

fn arb_burst() -> impl Strategy<Value = BurstMode> {
    prop_oneof![
        Just(BurstMode::Off),
        Just(BurstMode::Moderated),
        Just(BurstMode::Unlimited),
    ]
}

fn arb_priority() -> impl Strategy<Value = Priority> {
    prop_oneof![Just(Priority::Low), Just(Priority::Medium), Just(Priority::High)]
}

fn arb_action() -> impl Strategy<Value = RunawayAction> {
    prop_oneof![
        Just(RunawayAction::Kill),
        Just(RunawayAction::Cooldown),
        Just(RunawayAction::DryRun),
        "[a-z][a-z0-9_]{0,15}".prop_map(RunawayAction::SwitchGroup),
    ]
}

fn arb_watch_type() -> impl Strategy<Value = WatchType> {
    prop_oneof![
        Just(WatchType::None),
        Just(WatchType::Exact),
        Just(WatchType::Similar),
        Just(WatchType::Plan),
    ]
}

fn arb_rule() -> impl Strategy<Value = RunawayRule> {
    (
        0u64..100_000,
        0u64..1_000_000,
        0u64..1_000_000,
        arb_action(),
        arb_watch_type(),
        0u64..86_400_000,
    )
        .prop_map(
            |(exec_elapsed_ms, processed_keys, ru, action, watch_type, watch_duration_ms)| {
                RunawayRule {
                    exec_elapsed_ms,
                    processed_keys,
                    ru,
                    action,
                    watch_type,
                    watch_duration_ms,
                }
            },
        )
        .prop_filter("at least one threshold", RunawayRule::has_threshold)
}

fn arb_background() -> impl Strategy<Value = BackgroundSettings> {
    (
        proptest::sample::subsequence(BACKGROUND_TASK_TYPES.to_vec(), 0..=BACKGROUND_TASK_TYPES.len()),
        proptest::option::of(0u8..=100),
    )
        .prop_map(|(types, utilization_limit)| BackgroundSettings {
            task_types: types.into_iter().map(str::to_string).collect(),
            utilization_limit,
        })
}

fn arb_group() -> impl Strategy<Value = GroupConfig> {
    (
        2u64..10_000,
        arb_name(),
        arb_rate(),
        arb_burst(),
        arb_priority(),
        proptest::option::of(arb_rule()),
    )
        .prop_map(|(id, name, ru_rate, burst_mode, priority, runaway)| GroupConfig {
            id,
            name,
            ru_rate,
            burst_mode,
            priority,
            background: None,
            runaway,
        })
}

fn arb_default_group() -> impl Strategy<Value = GroupConfig> {
    (
        arb_rate(),
        arb_burst(),
        arb_priority(),
        proptest::option::of(arb_rule()),
        proptest::option::of(arb_background()),
    )
        .prop_map(|(ru_rate, burst_mode, priority, runaway, background)| GroupConfig {
            ru_rate,
            burst_mode,
            priority,
            runaway,
            background,
            ..GroupConfig::default_group()
        })
}

fn arb_any_group() -> impl Strategy<Value = GroupConfig> {
    prop_oneof![4 => arb_group(), 1 => arb_default_group()]
}

// ────────────────────────────────────────────────────────────────────
// Round trips
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_wire_round_trip(group in arb_any_group()) {
        prop_assert!(group.validate().is_ok());
        let decoded = GroupConfig::from_wire(&group.to_wire()).unwrap();
        prop_assert_eq!(decoded, group);
    }

    #[test]
    fn prop_wire_json_round_trip(group in arb_any_group()) {
        let wire = group.to_wire();
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireGroupSettings = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, wire);
    }

    #[test]
    fn prop_config_json_round_trip(group in arb_any_group()) {
        let json = serde_json::to_string(&group).unwrap();
        let back: GroupConfig = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(back, group);
    }
}

// ────────────────────────────────────────────────────────────────────
// Encodings
// ────────────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn prop_ru_sentinel_only_for_unlimited(group in arb_group()) {
        let wire = group.to_wire();
        match group.ru_rate {
            RuRate::Unlimited => prop_assert_eq!(wire.ru_per_sec, UNLIMITED_RU_WIRE),
            RuRate::Limited(n) => {
                prop_assert_eq!(wire.ru_per_sec, n as i64);
                prop_assert!(wire.ru_per_sec < UNLIMITED_RU_WIRE);
            }
        }
    }

    #[test]
    fn prop_burst_limit_table(group in arb_group()) {
        let limit = group.burst_limit();
        match (group.ru_rate, group.burst_mode) {
            (RuRate::Unlimited, _) | (_, BurstMode::Unlimited) => {
                prop_assert_eq!(limit, BurstLimit::Unlimited);
                prop_assert_eq!(limit.to_wire(), -1);
            }
            (RuRate::Limited(n), BurstMode::Off) => {
                prop_assert_eq!(limit, BurstLimit::Fixed(n));
                prop_assert_eq!(limit.to_wire(), n as i64);
            }
            (RuRate::Limited(_), BurstMode::Moderated) => {
                prop_assert_eq!(limit, BurstLimit::Moderated);
                prop_assert_eq!(limit.to_wire(), -2);
            }
        }
    }

    #[test]
    fn prop_raw_burst_mode_is_independent_of_rate(group in arb_group()) {
        let wire = group.to_wire();
        prop_assert_eq!(wire.burst_limit, group.burst_mode.to_wire());
        prop_assert_eq!(BurstMode::from_wire(wire.burst_limit).unwrap(), group.burst_mode);
    }

    #[test]
    fn prop_show_create_mirrors_blocks(group in arb_any_group()) {
        let ddl = group.show_create();
        let prefix = format!("CREATE RESOURCE GROUP `{}` ", group.name);
        prop_assert!(ddl.starts_with(&prefix));
        prop_assert_eq!(ddl.contains("QUERY_LIMIT=("), group.runaway.is_some());
        prop_assert_eq!(ddl.contains("BACKGROUND=("), group.background.is_some());
        prop_assert_eq!(ddl.contains("BURSTABLE("), group.burst_mode != BurstMode::Off);
    }

    #[test]
    fn prop_background_rejected_off_default(
        group in arb_group(),
        background in arb_background(),
    ) {
        let with_bg = GroupConfig { background: Some(background), ..group };
        prop_assert!(with_bg.validate().is_err());
        prop_assert!(GroupConfig::from_wire(&with_bg.to_wire()).is_err());
    }
}
