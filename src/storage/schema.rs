use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqliteConnection, SqlitePool,
};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::tables::{self, feeds, TableSpec};
use super::types::{
    is_lock_message, DatabaseError, ImportSource, SchemaError, SchemaState, StepOutcome,
    UpgradeReport,
};

pub const DATABASE_NAME: &str = "FeedEx.db";
pub const DATABASE_VERSION: i64 = 3;
pub const BACKUP_FILE_NAME: &str = "FeedEx_auto_backup.opml";

// ============================================================================
// Upgrade Ladder
// ============================================================================

/// One additive column, applied to databases recorded below `bound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeStep {
    pub bound: i64,
    pub table: &'static str,
    pub column: &'static str,
    pub sql_type: &'static str,
}

impl UpgradeStep {
    pub fn sql(&self) -> String {
        format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            self.table, self.column, self.sql_type
        )
    }

    fn applies(&self, old_version: i64, new_version: i64) -> bool {
        old_version < self.bound && self.bound <= new_version
    }
}

/// Append only. Devices can upgrade across any historical gap.
pub const UPGRADE_LADDER: &[UpgradeStep] = &[
    UpgradeStep {
        bound: 2,
        table: feeds::TABLE_NAME,
        column: feeds::REAL_LAST_UPDATE,
        sql_type: tables::TYPE_DATE_TIME,
    },
    UpgradeStep {
        bound: 3,
        table: feeds::TABLE_NAME,
        column: feeds::RETRIEVE_FULLTEXT,
        sql_type: tables::TYPE_BOOLEAN,
    },
];

// ============================================================================
// Schema
// ============================================================================

/// Target version, tables created on a fresh file, and the upgrade ladder.
#[derive(Debug, Clone)]
pub struct Schema {
    pub version: i64,
    pub tables: Vec<TableSpec<'static>>,
    pub upgrades: Vec<UpgradeStep>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::current()
    }
}

impl Schema {
    /// The FeedEx layout at [`DATABASE_VERSION`].
    pub fn current() -> Self {
        Self {
            version: DATABASE_VERSION,
            tables: vec![tables::FEEDS, tables::FILTERS, tables::ENTRIES],
            upgrades: UPGRADE_LADDER.to_vec(),
        }
    }

    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.version < 1 {
            return Err(SchemaError::InvalidVersion(self.version));
        }
        for table in &self.tables {
            table.validate()?;
        }
        let mut previous = 1;
        for step in &self.upgrades {
            if step.bound <= previous {
                return Err(SchemaError::LadderOutOfOrder {
                    bound: step.bound,
                    previous,
                });
            }
            if step.bound > self.version {
                return Err(SchemaError::StepBeyondTarget {
                    bound: step.bound,
                    target: self.version,
                });
            }
            previous = step.bound;
        }
        Ok(())
    }

    /// Run every ladder step with `old_version < bound <= new_version`.
    ///
    /// Steps are independent: a failing `ALTER` (typically a column left
    /// behind by an interrupted earlier upgrade) is logged and the ladder
    /// moves on. The caller stamps the new version afterwards.
    pub async fn upgrade(
        &self,
        conn: &mut SqliteConnection,
        old_version: i64,
        new_version: i64,
    ) -> UpgradeReport {
        let mut report = UpgradeReport::default();

        for step in self
            .upgrades
            .iter()
            .filter(|s| s.applies(old_version, new_version))
        {
            let statement = step.sql();
            let error = match sqlx::query(&statement).execute(&mut *conn).await {
                Ok(_) => {
                    tracing::debug!(bound = step.bound, sql = %statement, "Applied upgrade step");
                    None
                }
                Err(e) => {
                    tracing::warn!(
                        bound = step.bound,
                        sql = %statement,
                        error = %e,
                        "Upgrade step failed, continuing"
                    );
                    Some(e.to_string())
                }
            };
            report.steps.push(StepOutcome {
                bound: step.bound,
                statement,
                error,
            });
        }

        report
    }
}

// ============================================================================
// Options
// ============================================================================

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Checked once after a fresh database is created; imported when present.
    pub backup_path: PathBuf,
    pub busy_timeout: Duration,
    pub max_connections: u32,
}

impl StoreOptions {
    pub fn new(backup_path: impl Into<PathBuf>) -> Self {
        Self {
            backup_path: backup_path.into(),
            busy_timeout: Duration::from_millis(5000),
            max_connections: 5,
        }
    }
}

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
    state: SchemaState,
    bootstrap: Arc<Mutex<Option<JoinHandle<ImportSource>>>>,
}

impl Database {
    /// Open (creating or upgrading) a database with the current FeedEx schema.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError::InstanceLocked` if another process has the
    /// database locked, `DatabaseError::NewerSchema` if the file was stamped
    /// by a newer release, and `DatabaseError::Migration` for other failures
    /// while creating or upgrading.
    pub async fn open(path: &str, options: &StoreOptions) -> Result<Self, DatabaseError> {
        Self::open_with_schema(path, options, &Schema::current()).await
    }

    /// Open against an explicit schema.
    ///
    /// The schema is validated before anything touches the file, so a
    /// malformed table definition leaves no trace on disk.
    pub async fn open_with_schema(
        path: &str,
        options: &StoreOptions,
        schema: &Schema,
    ) -> Result<Self, DatabaseError> {
        schema.validate()?;

        let url = format!("sqlite:{}?mode=rwc", path);

        // Set database file permissions before pool creation
        #[cfg(unix)]
        if path != ":memory:" {
            use std::os::unix::fs::PermissionsExt;
            let db_path = std::path::Path::new(path);
            if db_path.exists() {
                let perms = std::fs::Permissions::from_mode(0o600);
                if let Err(e) = std::fs::set_permissions(path, perms) {
                    tracing::warn!(path = %path, error = %e, "Failed to set database file permissions");
                }
            } else if let Some(parent) = db_path.parent() {
                if parent.exists() {
                    use std::os::unix::fs::OpenOptionsExt;
                    let _file = std::fs::OpenOptions::new()
                        .write(true)
                        .create_new(true)
                        .mode(0o600)
                        .open(db_path)
                        .ok(); // If creation fails, SQLite will report the error at connect_with.
                }
            }
        }

        let busy_ms = options.busy_timeout.as_millis().to_string();
        let connect = SqliteConnectOptions::from_str(&url)
            .map_err(DatabaseError::from_sqlx)?
            .pragma("busy_timeout", busy_ms);
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(connect)
            .await
            .map_err(DatabaseError::from_sqlx)?;

        let state = Self::migrate(&pool, schema).await.map_err(|e| {
            match e.downcast::<DatabaseError>() {
                Ok(db_err) => db_err,
                Err(e) if is_lock_message(&e.to_string()) => DatabaseError::InstanceLocked,
                Err(e) => DatabaseError::Migration(format!("{:#}", e)),
            }
        })?;

        let db = Self {
            pool,
            state,
            bootstrap: Arc::new(Mutex::new(None)),
        };

        // Only after the creating transaction has committed
        if db.state.is_fresh() {
            db.spawn_bootstrap(options.backup_path.clone());
        }

        Ok(db)
    }

    /// Create, upgrade, or leave alone, depending on the stamped version.
    ///
    /// Runs inside a single transaction. A version of 0 means the file has
    /// never been initialized.
    ///
    /// The write lock is taken before the version is read, so concurrent
    /// opens of one file wait on `busy_timeout` and see the committed result.
    async fn migrate(pool: &SqlitePool, schema: &Schema) -> Result<SchemaState> {
        let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

        let (recorded,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&mut *tx)
            .await?;

        let state = if recorded == 0 {
            for table in &schema.tables {
                let sql = table.create_sql()?;
                sqlx::query(&sql).execute(&mut *tx).await?;
                tracing::debug!(table = table.name, "Created table");
            }
            SchemaState::Created {
                version: schema.version,
            }
        } else if recorded < schema.version {
            tracing::info!(from = recorded, to = schema.version, "Upgrading database schema");
            let report = schema.upgrade(&mut *tx, recorded, schema.version).await;
            SchemaState::Upgraded {
                from: recorded,
                to: schema.version,
                report,
            }
        } else if recorded > schema.version {
            return Err(DatabaseError::NewerSchema {
                found: recorded,
                supported: schema.version,
            }
            .into());
        } else {
            SchemaState::Current { version: recorded }
        };

        if recorded != schema.version {
            // PRAGMA does not accept bound parameters
            sqlx::query(&format!("PRAGMA user_version = {}", schema.version))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        if let SchemaState::Created { version } = state {
            tracing::info!(version, tables = schema.tables.len(), "Created database schema");
        }
        Ok(state)
    }

    /// How the schema looked when this handle was opened.
    pub fn state(&self) -> &SchemaState {
        &self.state
    }

    /// Version currently stamped in the file.
    pub async fn schema_version(&self) -> Result<i64> {
        let (version,): (i64,) = sqlx::query_as("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        Ok(version)
    }

    /// User tables, sorted by name.
    pub async fn table_names(&self) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    /// `(name, declared type)` for each column of `table`, in column order.
    pub async fn table_columns(&self, table: &str) -> Result<Vec<(String, String)>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, type FROM pragma_table_info(?) ORDER BY cid")
                .bind(table)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows)
    }

    // ========================================================================
    // Bootstrap Import
    // ========================================================================

    fn spawn_bootstrap(&self, backup_path: PathBuf) {
        let db = self.clone();
        let handle = tokio::spawn(async move { db.run_bootstrap(backup_path).await });
        *self
            .bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
    }

    /// Import the backup if one exists, otherwise the bundled defaults.
    /// Failures are logged; the database is usable either way.
    async fn run_bootstrap(&self, backup_path: PathBuf) -> ImportSource {
        let has_backup = match tokio::fs::try_exists(&backup_path).await {
            Ok(exists) => exists,
            Err(e) => {
                tracing::debug!(path = %backup_path.display(), error = %e, "Cannot stat backup file");
                false
            }
        };
        let source = if has_backup {
            ImportSource::Backup(backup_path)
        } else {
            ImportSource::Defaults
        };

        match self.import_from(&source).await {
            Ok(summary) => tracing::info!(
                source = %source,
                groups = summary.groups,
                feeds = summary.feeds,
                filters = summary.filters,
                "Bootstrap import finished"
            ),
            Err(e) => tracing::warn!(source = %source, error = %e, "Bootstrap import failed"),
        }

        source
    }

    /// Wait for the bootstrap import scheduled by `open`, if any.
    ///
    /// Returns the source that was attempted. `None` when the database already
    /// existed, or when another clone has already waited.
    pub async fn wait_for_bootstrap(&self) -> Option<ImportSource> {
        let handle = self
            .bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        match handle.await {
            Ok(source) => Some(source),
            Err(e) => {
                tracing::warn!(error = %e, "Bootstrap import task did not complete");
                None
            }
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_upgrade_step_sql() {
        assert_eq!(
            UPGRADE_LADDER[0].sql(),
            "ALTER TABLE feeds ADD COLUMN reallastupdate DATETIME"
        );
        assert_eq!(
            UPGRADE_LADDER[1].sql(),
            "ALTER TABLE feeds ADD COLUMN retrievefulltext INTEGER(1)"
        );
    }

    #[test]
    fn test_step_applies_only_inside_window() {
        let step = UPGRADE_LADDER[1];
        assert!(step.applies(1, 3));
        assert!(step.applies(2, 3));
        assert!(!step.applies(3, 3));
        assert!(!step.applies(1, 2));
    }

    #[test]
    fn test_current_schema_is_valid() {
        let schema = Schema::current();
        schema.validate().unwrap();
        assert_eq!(schema.version, 3);
        assert_eq!(schema.tables.len(), 3);
    }

    #[test]
    fn test_ladder_must_ascend() {
        let mut schema = Schema::current();
        schema.upgrades.reverse();
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::LadderOutOfOrder {
                bound: 2,
                previous: 3
            })
        ));
    }

    #[test]
    fn test_ladder_cannot_exceed_target() {
        let mut schema = Schema::current();
        schema.version = 2;
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::StepBeyondTarget { bound: 3, target: 2 })
        ));
    }

    #[test]
    fn test_malformed_table_fails_validation() {
        let mut schema = Schema::current();
        schema
            .tables
            .push(TableSpec::new("broken", &["_id", "name"], &["INTEGER"]));
        assert!(matches!(
            schema.validate(),
            Err(SchemaError::ColumnTypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_returns_before_bootstrap_import_runs() {
        let options = StoreOptions {
            max_connections: 1,
            ..StoreOptions::new("/nonexistent/feedex/backup.opml")
        };
        let db = Database::open(":memory:", &options).await.unwrap();
        assert!(db.state().is_fresh());

        // The import task has not been polled yet. Holding the only
        // connection keeps it from starting.
        let mut conn = db.pool.acquire().await.unwrap();
        let (pending,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&mut *conn)
            .await
            .unwrap();
        assert_eq!(pending, 0);
        drop(conn);

        assert_eq!(db.wait_for_bootstrap().await, Some(ImportSource::Defaults));
        let (imported,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM feeds")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert!(imported > 0);
    }

    #[tokio::test]
    async fn test_memory_database_is_created_at_current_version() {
        let options = StoreOptions::new("/nonexistent/feedex/backup.opml");
        let db = Database::open(":memory:", &options).await.unwrap();

        assert_eq!(db.state(), &SchemaState::Created { version: 3 });
        assert_eq!(db.wait_for_bootstrap().await, Some(ImportSource::Defaults));
        // Handle is consumed by the first waiter
        assert_eq!(db.wait_for_bootstrap().await, None);

        assert_eq!(db.schema_version().await.unwrap(), 3);
        assert_eq!(
            db.table_names().await.unwrap(),
            vec!["entries", "feeds", "filters"]
        );
    }
}
