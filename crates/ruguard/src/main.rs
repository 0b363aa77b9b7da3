//! ruguard CLI: inspect resource-group configuration and runaway audit logs.
//!
//! # Commands
//!
//! - `check`: load a config file, seed its groups and print the result.
//! - `queries`: list recorded runaway queries.
//! - `watches`: list persisted watch entries.
//! - `gc`: purge audit rows past retention and expired watches.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use ruguard_core::config::LogFormat;
use ruguard_core::error::format_error_with_remediation;
use ruguard_core::governor::epoch_ms;
use ruguard_core::logging::{LogConfig, init_logging};
use ruguard_core::recorder::MatchType;
use ruguard_core::store::{AuditStore, MemoryAuditStore, QueryFilter, SqliteAuditStore};
use ruguard_core::{GovernorConfig, GroupConfig, ResourceGovernor};

#[derive(Parser)]
#[command(name = "ruguard", version)]
#[command(about = "Inspect resource groups and runaway query audit logs", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RUGUARD_LOG_LEVEL", default_value = "warn")]
    log_level: String,

    /// Log format (pretty, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: String,

    /// Emit JSON on stdout
    #[arg(long, global = true, default_value_t = false)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a config file and print the groups it defines
    Check {
        /// Path to the TOML config
        #[arg(long, default_value = "ruguard.toml")]
        config: PathBuf,
    },
    /// List recorded runaway queries, newest first
    Queries {
        /// Audit database
        #[arg(long, default_value = "ruguard.db")]
        db: PathBuf,
        /// Only this resource group
        #[arg(long)]
        group: Option<String>,
        /// Only this match type
        #[arg(long, value_enum)]
        match_type: Option<MatchTypeArg>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// List persisted watch entries
    Watches {
        /// Audit database
        #[arg(long, default_value = "ruguard.db")]
        db: PathBuf,
        /// Include entries whose end time has passed
        #[arg(long, default_value_t = false)]
        all: bool,
    },
    /// Purge runaway queries past retention and expired watches
    Gc {
        /// Audit database
        #[arg(long, default_value = "ruguard.db")]
        db: PathBuf,
        #[arg(long, default_value_t = 168)]
        retention_hours: u64,
        /// Rows deleted per statement
        #[arg(long, default_value_t = 1000)]
        batch_size: usize,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum MatchTypeArg {
    Identify,
    Watch,
}

impl From<MatchTypeArg> for MatchType {
    fn from(arg: MatchTypeArg) -> Self {
        match arg {
            MatchTypeArg::Identify => Self::Identify,
            MatchTypeArg::Watch => Self::Watch,
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = match cli.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(2);
        }
    };
    let log_config = LogConfig {
        level: cli.log_level.clone(),
        format,
    };
    if let Err(err) = init_logging(&log_config) {
        eprintln!("error: {err}");
        return ExitCode::from(2);
    }

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<ruguard_core::Error>() {
                Some(core) => eprintln!("{}", format_error_with_remediation(core)),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Check { config } => check(config, cli.json),
        Commands::Queries {
            db,
            group,
            match_type,
            limit,
        } => queries(db, group.clone(), match_type.map(MatchType::from), *limit, cli.json),
        Commands::Watches { db, all } => watches(db, *all, cli.json),
        Commands::Gc {
            db,
            retention_hours,
            batch_size,
        } => gc(db, *retention_hours, *batch_size, cli.json),
    }
}

fn open_existing(db: &Path) -> anyhow::Result<SqliteAuditStore> {
    if !db.exists() {
        bail!("audit database not found: {}", db.display());
    }
    SqliteAuditStore::open(db)
        .map_err(ruguard_core::Error::from)
        .with_context(|| format!("opening {}", db.display()))
}

fn format_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// check
// =============================================================================

#[derive(Serialize)]
struct GroupView<'a> {
    #[serde(flatten)]
    config: &'a GroupConfig,
    burst_limit: i64,
    statement: String,
}

fn check(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = GovernorConfig::load_from(path)?;
    let store: Arc<dyn AuditStore> = Arc::new(MemoryAuditStore::new());
    let governor = ResourceGovernor::from_config(config, store, epoch_ms())?;
    let groups = governor.registry().list();

    if json {
        let views: Vec<GroupView<'_>> = groups
            .iter()
            .map(|g| GroupView {
                config: g,
                burst_limit: g.burst_limit().to_wire(),
                statement: g.show_create(),
            })
            .collect();
        return print_json(&views);
    }

    println!("{}: {} group(s)", path.display(), groups.len());
    for group in &groups {
        println!(
            "  {:<16} ru={:<10} priority={:<6} burst_limit={}",
            group.name,
            group.ru_rate.to_string(),
            group.priority.to_string(),
            group.burst_limit().to_wire()
        );
        if let Some(rule) = &group.runaway {
            println!("    query_limit: {rule}");
        }
        if let Some(background) = &group.background {
            println!("    background: {background}");
        }
    }
    Ok(())
}

// =============================================================================
// queries / watches
// =============================================================================

fn queries(
    db: &Path,
    group: Option<String>,
    match_type: Option<MatchType>,
    limit: usize,
    json: bool,
) -> anyhow::Result<()> {
    let store = open_existing(db)?;
    let rows = store
        .list_queries(&QueryFilter {
            group,
            match_type,
            limit,
        })
        .map_err(ruguard_core::Error::from)?;

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("no runaway queries recorded");
        return Ok(());
    }
    for row in &rows {
        println!(
            "{}  {:<12} {:<8} {:<20} x{:<4} {}",
            format_ms(row.start_time_ms),
            row.group,
            row.match_type.as_str(),
            row.action,
            row.repeats,
            row.rule
        );
        println!("    {}", row.sample_sql);
    }
    Ok(())
}

fn watches(db: &Path, all: bool, json: bool) -> anyhow::Result<()> {
    let store = open_existing(db)?;
    let now = epoch_ms();
    let rows: Vec<_> = store
        .list_watches()
        .map_err(ruguard_core::Error::from)?
        .into_iter()
        .filter(|w| all || !w.is_expired(now))
        .collect();

    if json {
        return print_json(&rows);
    }
    if rows.is_empty() {
        println!("no active watches");
        return Ok(());
    }
    for row in &rows {
        let until = row
            .expire_at_ms
            .map_or_else(|| "unlimited".to_string(), format_ms);
        println!(
            "{:<12} {:<8} {:<20} until {}  {}",
            row.group,
            row.watch_type.as_str(),
            row.action.to_string(),
            until,
            row.key
        );
    }
    Ok(())
}

// =============================================================================
// gc
// =============================================================================

#[derive(Serialize)]
struct GcReport {
    purged_queries: usize,
    purged_watches: usize,
}

fn gc(db: &Path, retention_hours: u64, batch_size: usize, json: bool) -> anyhow::Result<()> {
    let store = open_existing(db)?;
    let now = epoch_ms();
    let cutoff = now.saturating_sub(retention_hours.saturating_mul(3_600_000));
    let batch_size = batch_size.max(1);

    let mut report = GcReport {
        purged_queries: 0,
        purged_watches: 0,
    };
    loop {
        let n = store
            .purge_queries_before(cutoff, batch_size)
            .map_err(ruguard_core::Error::from)?;
        report.purged_queries += n;
        if n < batch_size {
            break;
        }
    }
    loop {
        let n = store
            .purge_expired_watches(now, batch_size)
            .map_err(ruguard_core::Error::from)?;
        report.purged_watches += n;
        if n < batch_size {
            break;
        }
    }
    tracing::info!(
        queries = report.purged_queries,
        watches = report.purged_watches,
        "audit gc complete"
    );

    if json {
        return print_json(&report);
    }
    println!(
        "purged {} runaway queries and {} expired watches",
        report.purged_queries, report.purged_watches
    );
    Ok(())
}
