//! Error types for ruguard-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for ruguard-core
#[derive(Error, Debug)]
pub enum Error {
    /// Resource group DDL errors
    #[error("Resource group error: {0}")]
    Group(#[from] GroupError),

    /// Runaway query interruptions surfaced to the caller
    #[error("{0}")]
    Runaway(#[from] RunawayError),

    /// Audit storage errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Return remediation guidance when available.
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self {
            Self::Group(err) => Some(err.remediation()),
            Self::Runaway(err) => Some(err.remediation()),
            Self::Storage(err) => Some(err.remediation()),
            Self::Config(err) => Some(err.remediation()),
            Self::Io(_) => Some(
                Remediation::new("Check filesystem permissions and paths, then retry.")
                    .alternative("Verify the data directory exists and is writable."),
            ),
            Self::Json(_) => Some(
                Remediation::new("Validate the JSON input and retry.")
                    .alternative("Check for trailing commas or invalid UTF-8."),
            ),
        }
    }

    /// Whether this error is a runaway interruption (kill or quarantine).
    #[must_use]
    pub fn is_runaway(&self) -> bool {
        matches!(self, Self::Runaway(_))
    }
}

/// Resource group DDL errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GroupError {
    #[error("Resource group '{0}' already exists")]
    AlreadyExists(String),

    #[error("Unknown resource group '{0}'")]
    NotExists(String),

    /// Carries the full message; runaway and background duplicates use their own wording.
    #[error("{0}")]
    DuplicatedOption(String),

    #[error("Invalid resource group settings: {0}")]
    InvalidGroupSettings(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("user [{}] depends on the resource group to drop", .dependents.join(","))]
    DependentObjectExists {
        group: String,
        dependents: Vec<String>,
    },
}

impl GroupError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::AlreadyExists(name) => {
                Remediation::new(format!("Pick another name or alter '{name}' instead."))
                    .command("Show groups", "ruguard check --config ruguard.toml")
                    .alternative("Use IF NOT EXISTS to make the statement idempotent.")
            }
            Self::NotExists(name) => {
                Remediation::new(format!("Create resource group '{name}' first."))
                    .command("Show groups", "ruguard check --config ruguard.toml")
                    .alternative("Use IF EXISTS to tolerate a missing group.")
            }
            Self::DuplicatedOption(_) => {
                Remediation::new("Specify each option at most once per statement.")
                    .command("Validate config", "ruguard check --config ruguard.toml")
            }
            Self::InvalidGroupSettings(_) => Remediation::new(
                "Fix the group settings: QUERY_LIMIT needs a threshold and an ACTION.",
            )
            .command("Validate config", "ruguard check --config ruguard.toml")
            .alternative("SWITCH_GROUP requires a non-empty target group name."),
            Self::UnsupportedOperation(_) => Remediation::new(
                "The reserved default group cannot be dropped and only it accepts BACKGROUND.",
            )
            .command("Validate config", "ruguard check --config ruguard.toml"),
            Self::DependentObjectExists { group, .. } => Remediation::new(format!(
                "Rebind dependent users away from '{group}' before dropping it."
            ))
            .command("Rebind user", "ALTER USER <name> RESOURCE GROUP `default`"),
        }
    }
}

/// Runaway interruptions returned to the query caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunawayError {
    /// Rejected before execution because the fingerprint is on the watch list
    #[error("Quarantined query in resource group '{group}', marked as runaway by watch '{watch_text}'")]
    Quarantine { group: String, watch_text: String },

    /// Aborted mid-execution after breaching a threshold
    #[error("Query execution was interrupted, identified as runaway query [{cause}]")]
    Killed { group: String, cause: String },
}

impl RunawayError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Quarantine { group, .. } => Remediation::new(format!(
                "Wait for the watch on group '{group}' to expire or remove the watch."
            ))
            .command("List watches", "ruguard watches --db ruguard.db"),
            Self::Killed { group, .. } => Remediation::new(format!(
                "Optimize the query or relax QUERY_LIMIT on group '{group}'."
            ))
            .command("Recent runaway queries", "ruguard queries --db ruguard.db")
            .alternative("Switch the rule to ACTION=DRYRUN to observe without killing."),
        }
    }
}

/// Audit storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Database schema version ({current}) is newer than supported ({supported})")]
    SchemaTooNew { current: i32, supported: i32 },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) | Self::Unavailable(_) => Remediation::new(
                "Audit database operation failed. Check permissions; the next cycle retries.",
            )
            .command("Inspect audit rows", "ruguard queries --db ruguard.db"),
            Self::MigrationFailed(_) => {
                Remediation::new("Audit schema migration failed. Back up and recreate the file.")
                    .command("Purge old rows", "ruguard gc --db ruguard.db")
            }
            Self::SchemaTooNew { current, supported } => Remediation::new(format!(
                "Audit schema version {current} is newer than supported ({supported}). Upgrade ruguard."
            ))
            .command("Version", "ruguard --version"),
        }
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(String, String),

    #[error("Failed to parse config: {0}")]
    ParseFailed(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => Remediation::new(format!(
                "Config file not found: {path}. Verify the path and retry."
            ))
            .command("Check path", format!("ls -l \"{path}\"")),
            Self::ReadFailed(path, _) => Remediation::new(format!(
                "Failed to read config file: {path}. Check permissions."
            ))
            .command("Check permissions", format!("ls -l \"{path}\"")),
            Self::ParseFailed(_) => Remediation::new("Config parse failed. Fix the TOML syntax.")
                .command("Validate config", "ruguard check --config ruguard.toml"),
            Self::ValidationError(_) => {
                Remediation::new("Config validation failed. Fix the invalid fields and retry.")
                    .command("Validate config", "ruguard check --config ruguard.toml")
            }
        }
    }
}

/// Format an error with remediation guidance for display.
#[must_use]
pub fn format_error_with_remediation(error: &Error) -> String {
    let mut output = format!("Error: {error}");
    if let Some(remediation) = error.remediation() {
        output.push('\n');
        output.push('\n');
        output.push_str(&remediation.render_plain());
    }
    output
}
