use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Database-specific errors with user-friendly messages
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds the database lock
    #[error("Another FeedEx process appears to be using the database. Please close it and try again.")]
    InstanceLocked,

    /// The compiled-in schema is malformed; nothing was executed
    #[error("Invalid schema definition: {0}")]
    InvalidSchema(#[from] SchemaError),

    /// The file was written by a newer FeedEx than this one
    #[error("Database schema version {found} is newer than the supported version {supported}")]
    NewerSchema { found: i64, supported: i64 },

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        if is_lock_message(&err.to_string()) {
            return DatabaseError::InstanceLocked;
        }
        DatabaseError::Other(err)
    }
}

/// SQLITE_BUSY (5), SQLITE_LOCKED (6) and SQLITE_CANTOPEN (14) messages.
pub(crate) fn is_lock_message(message: &str) -> bool {
    let message = message.to_lowercase();
    message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("sqlite_busy")
        || message.contains("sqlite_locked")
        || message.contains("unable to open database file")
}

/// Malformed table or upgrade definitions. These are programming errors and
/// abort initialization before any statement runs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("table name is empty")]
    MissingTableName,

    #[error("table {0} has no columns")]
    NoColumns(String),

    #[error("table {table} has {columns} columns but {types} types")]
    ColumnTypeMismatch {
        table: String,
        columns: usize,
        types: usize,
    },

    #[error("table {table} has a blank column name or type at position {position}")]
    BlankColumn { table: String, position: usize },

    #[error("target schema version must be at least 1, got {0}")]
    InvalidVersion(i64),

    #[error("upgrade step for version {bound} is out of order (previous bound {previous})")]
    LadderOutOfOrder { bound: i64, previous: i64 },

    #[error("upgrade step for version {bound} exceeds target version {target}")]
    StepBeyondTarget { bound: i64, target: i64 },
}

// ============================================================================
// Migration Results
// ============================================================================

/// What `Database::open` found and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaState {
    /// The file had no schema; tables were created and stamped.
    Created { version: i64 },
    /// The file was behind; the upgrade ladder ran.
    Upgraded {
        from: i64,
        to: i64,
        report: UpgradeReport,
    },
    /// Nothing to do.
    Current { version: i64 },
}

impl SchemaState {
    pub fn version(&self) -> i64 {
        match self {
            SchemaState::Created { version } | SchemaState::Current { version } => *version,
            SchemaState::Upgraded { to, .. } => *to,
        }
    }

    pub fn is_fresh(&self) -> bool {
        matches!(self, SchemaState::Created { .. })
    }
}

/// Per-step outcome of an upgrade run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpgradeReport {
    pub steps: Vec<StepOutcome>,
}

impl UpgradeReport {
    pub fn applied(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_none())
    }

    pub fn skipped(&self) -> impl Iterator<Item = &StepOutcome> {
        self.steps.iter().filter(|s| s.error.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub bound: i64,
    pub statement: String,
    /// `None` when the statement succeeded.
    pub error: Option<String>,
}

// ============================================================================
// Bootstrap / Backup
// ============================================================================

/// Where the one-time bootstrap import read its feeds from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportSource {
    Backup(PathBuf),
    Defaults,
}

impl fmt::Display for ImportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportSource::Backup(path) => write!(f, "backup file {}", path.display()),
            ImportSource::Defaults => f.write_str("bundled default feeds"),
        }
    }
}

/// Rows inserted by an OPML import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub groups: usize,
    pub feeds: usize,
    pub filters: usize,
    /// Feeds whose URL was already present.
    pub duplicates: usize,
}
