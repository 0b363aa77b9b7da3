//! ruguard-core: resource-group governance
//!
//! Per-group request-unit admission control plus runaway query detection and
//! quarantine.
//!
//! # Architecture
//!
//! ```text
//! query → binding → RuController (token bucket per group)
//!                 → RunawayDetector ← WatchList (pre-execution)
//!                        ↓ breach / hit
//!                 QuarantineActionDispatcher → WatchList, EventRecorder
//!                                                   ↓ maintenance
//!                                               AuditStore (SQLite)
//! ```
//!
//! # Modules
//!
//! - `group`: group configuration, burst limits and runaway rules
//! - `options`: `CREATE`/`ALTER` option lists, validate-then-apply
//! - `registry`: versioned copy-on-write group registry
//! - `token_bucket`: lazy-refill token bucket
//! - `controller`: per-group RU admission
//! - `fingerprint`: SQL normalization and digests
//! - `context`: per-query progress, cancellation and binding
//! - `watch`: TTL watch list of quarantined fingerprints
//! - `detector`: per-query runaway state machine
//! - `dispatcher`: kill, cooldown, dryrun and switch-group
//! - `recorder`: deduplicating runaway event buffer
//! - `store`: audit persistence (SQLite and in-memory)
//! - `governor`: facade tying everything together
//! - `maintenance`: background flush, sweep and GC task
//! - `config`, `logging`, `error`: ambient plumbing
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod config;
pub mod context;
pub mod controller;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod fingerprint;
pub mod governor;
pub mod group;
pub mod logging;
pub mod maintenance;
pub mod options;
pub mod recorder;
pub mod registry;
pub mod sharded_map;
pub mod store;
pub mod token_bucket;
pub mod watch;

pub use config::GovernorConfig;
pub use error::{Error, GroupError, Result, RunawayError, StorageError};
pub use governor::{QueryRun, ResourceGovernor};
pub use group::GroupConfig;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
