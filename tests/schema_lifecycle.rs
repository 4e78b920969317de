//! Integration tests for schema creation and the upgrade ladder.
//!
//! Each test works on its own database file under the system temp directory.
//! Legacy files are built by hand with raw DDL and a stamped `user_version`,
//! then opened through `Database::open`.

use feedex::storage::{
    tables, Database, DatabaseError, Schema, SchemaError, SchemaState, StoreOptions, TableSpec,
};
use pretty_assertions::assert_eq;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Connection, SqliteConnection};
use std::path::{Path, PathBuf};

/// Feeds table as shipped with schema version 1.
const FEEDS_V1: &str = "CREATE TABLE feeds (_id INTEGER PRIMARY KEY AUTOINCREMENT, url TEXT UNIQUE, \
    name TEXT, isgroup INTEGER(1), groupid INTEGER(7), lastupdate DATETIME, icon BLOB, \
    error TEXT, priority INT, fetchmode INT);";

struct TestDir(PathBuf);

impl TestDir {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!(
            "feedex_schema_{}_{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        Self(dir)
    }

    fn db_path(&self) -> String {
        self.0.join("FeedEx.db").to_str().unwrap().to_string()
    }

    fn options(&self) -> StoreOptions {
        StoreOptions::new(self.0.join("FeedEx_auto_backup.opml"))
    }
}

impl Drop for TestDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

/// Build a version-1 database file, run `extra` on it, and stamp `version`.
async fn seed_legacy(path: &str, extra: &[&str], version: i64) {
    let options = SqliteConnectOptions::new()
        .filename(Path::new(path))
        .create_if_missing(true);
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    let filters = tables::FILTERS.create_sql().unwrap();
    let entries = tables::ENTRIES.create_sql().unwrap();
    for sql in [FEEDS_V1, filters.as_str(), entries.as_str()]
        .into_iter()
        .chain(extra.iter().copied())
    {
        sqlx::query(sql).execute(&mut conn).await.unwrap();
    }
    sqlx::query(&format!("PRAGMA user_version = {}", version))
        .execute(&mut conn)
        .await
        .unwrap();
    conn.close().await.unwrap();
}

async fn feed_column_names(db: &Database) -> Vec<String> {
    db.table_columns("feeds")
        .await
        .unwrap()
        .into_iter()
        .map(|(name, _)| name)
        .collect()
}

// ============================================================================
// Fresh Database
// ============================================================================

#[tokio::test]
async fn test_fresh_database_has_all_tables_at_target_version() {
    let dir = TestDir::new("fresh");
    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    db.wait_for_bootstrap().await;

    assert_eq!(db.state(), &SchemaState::Created { version: 3 });
    assert_eq!(db.schema_version().await.unwrap(), 3);
    assert_eq!(
        db.table_names().await.unwrap(),
        vec!["entries", "feeds", "filters"]
    );

    for spec in [tables::FEEDS, tables::FILTERS, tables::ENTRIES] {
        let names: Vec<String> = db
            .table_columns(spec.name)
            .await
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, spec.columns, "columns of {}", spec.name);
    }

    // Declared types are kept minus constraint keywords
    let types: Vec<(String, String)> = db.table_columns("feeds").await.unwrap();
    assert_eq!(types[0], ("_id".to_string(), "INTEGER".to_string()));
    assert_eq!(types[3], ("isgroup".to_string(), "INTEGER(1)".to_string()));
    db.close().await;
}

#[tokio::test]
async fn test_stored_ddl_matches_rendered_text() {
    let dir = TestDir::new("ddl_text");
    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    db.wait_for_bootstrap().await;
    db.close().await;

    let options = SqliteConnectOptions::new().filename(dir.db_path());
    let mut conn = SqliteConnection::connect_with(&options).await.unwrap();
    let (sql,): (String,) =
        sqlx::query_as("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = 'filters'")
            .fetch_one(&mut conn)
            .await
            .unwrap();
    conn.close().await.unwrap();

    // sqlite_master keeps the statement without its trailing semicolon
    let rendered = tables::FILTERS.create_sql().unwrap();
    assert_eq!(format!("{};", sql), rendered);
}

#[tokio::test]
async fn test_reopen_existing_database_is_current_and_not_reseeded() {
    let dir = TestDir::new("reopen");
    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    assert!(db.wait_for_bootstrap().await.is_some());
    db.close().await;

    // A backup appearing later must not trigger an import on an existing database
    std::fs::write(
        &dir.options().backup_path,
        r#"<opml><body><outline title="Late" xmlUrl="https://late.example.com/rss"/></body></opml>"#,
    )
    .unwrap();

    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    assert_eq!(db.state(), &SchemaState::Current { version: 3 });
    assert_eq!(db.wait_for_bootstrap().await, None);

    let doc = db.export_opml().await.unwrap();
    assert!(doc.feeds().all(|f| f.xml_url != "https://late.example.com/rss"));
    db.close().await;
}

// ============================================================================
// Upgrades
// ============================================================================

#[tokio::test]
async fn test_upgrade_from_v1_applies_both_steps_in_order() {
    let dir = TestDir::new("v1");
    seed_legacy(&dir.db_path(), &[], 1).await;

    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    let SchemaState::Upgraded { from, to, report } = db.state().clone() else {
        panic!("expected an upgrade, got {:?}", db.state());
    };
    assert_eq!((from, to), (1, 3));

    let statements: Vec<_> = report.steps.iter().map(|s| s.statement.as_str()).collect();
    assert_eq!(
        statements,
        vec![
            "ALTER TABLE feeds ADD COLUMN reallastupdate DATETIME",
            "ALTER TABLE feeds ADD COLUMN retrievefulltext INTEGER(1)",
        ]
    );
    assert_eq!(report.skipped().count(), 0);

    let columns = feed_column_names(&db).await;
    assert_eq!(
        &columns[columns.len() - 2..],
        &["reallastupdate".to_string(), "retrievefulltext".to_string()]
    );
    assert_eq!(db.schema_version().await.unwrap(), 3);
    assert_eq!(db.wait_for_bootstrap().await, None);
    db.close().await;
}

#[tokio::test]
async fn test_upgrade_from_v2_applies_only_fulltext_step() {
    let dir = TestDir::new("v2");
    seed_legacy(
        &dir.db_path(),
        &["ALTER TABLE feeds ADD COLUMN reallastupdate DATETIME"],
        2,
    )
    .await;

    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    let SchemaState::Upgraded { report, .. } = db.state() else {
        panic!("expected an upgrade, got {:?}", db.state());
    };
    assert_eq!(report.steps.len(), 1);
    assert_eq!(report.steps[0].bound, 3);
    assert!(report.steps[0].error.is_none());

    let columns = feed_column_names(&db).await;
    assert_eq!(columns.iter().filter(|c| *c == "reallastupdate").count(), 1);
    assert!(columns.contains(&"retrievefulltext".to_string()));
    assert_eq!(db.schema_version().await.unwrap(), 3);
    db.close().await;
}

#[tokio::test]
async fn test_duplicate_column_is_skipped_and_version_still_advances() {
    let dir = TestDir::new("partial");
    // A previous upgrade added the column but never stamped version 2
    seed_legacy(
        &dir.db_path(),
        &["ALTER TABLE feeds ADD COLUMN reallastupdate DATETIME"],
        1,
    )
    .await;

    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    let SchemaState::Upgraded { report, .. } = db.state() else {
        panic!("expected an upgrade, got {:?}", db.state());
    };

    assert_eq!(report.steps.len(), 2);
    let skipped: Vec<_> = report.skipped().collect();
    assert_eq!(skipped.len(), 1);
    assert_eq!(skipped[0].bound, 2);
    assert!(skipped[0]
        .error
        .as_deref()
        .unwrap()
        .contains("duplicate column"));
    assert_eq!(report.applied().next().unwrap().bound, 3);

    assert!(feed_column_names(&db)
        .await
        .contains(&"retrievefulltext".to_string()));
    assert_eq!(db.schema_version().await.unwrap(), 3);
    db.close().await;
}

#[tokio::test]
async fn test_upgraded_rows_keep_their_data() {
    let dir = TestDir::new("rows");
    seed_legacy(
        &dir.db_path(),
        &[
            "INSERT INTO feeds (url, name, isgroup, priority) VALUES ('https://old.example.com/rss', 'Old', 0, 1)",
        ],
        1,
    )
    .await;

    let db = Database::open(&dir.db_path(), &dir.options()).await.unwrap();
    let doc = db.export_opml().await.unwrap();
    let feeds: Vec<_> = doc.feeds().collect();
    assert_eq!(feeds.len(), 1);
    assert_eq!(feeds[0].title, "Old");
    // Column added by the upgrade is NULL for existing rows
    assert!(!feeds[0].retrieve_fulltext);
    db.close().await;
}

#[tokio::test]
async fn test_newer_schema_is_refused() {
    let dir = TestDir::new("newer");
    seed_legacy(&dir.db_path(), &[], 7).await;

    let err = Database::open(&dir.db_path(), &dir.options())
        .await
        .err()
        .expect("opening a newer schema should fail");
    assert!(matches!(
        err,
        DatabaseError::NewerSchema {
            found: 7,
            supported: 3
        }
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_opens_of_fresh_file_create_once() {
    let dir = TestDir::new("concurrent");
    let path = dir.db_path();
    let options = dir.options();

    let (a, b) = tokio::join!(
        Database::open(&path, &options),
        Database::open(&path, &options)
    );
    let a = a.expect("first open should wait for the lock, not fail");
    let b = b.expect("second open should wait for the lock, not fail");

    let mut states = vec![a.state().clone(), b.state().clone()];
    states.sort_by_key(|s| matches!(s, SchemaState::Current { .. }));
    assert_eq!(
        states,
        vec![
            SchemaState::Created { version: 3 },
            SchemaState::Current { version: 3 },
        ]
    );

    // Only the creator schedules the first-run import
    let waits = [a.wait_for_bootstrap().await, b.wait_for_bootstrap().await];
    assert_eq!(waits.iter().filter(|w| w.is_some()).count(), 1);

    a.close().await;
    b.close().await;
}

// ============================================================================
// Malformed Schema
// ============================================================================

#[tokio::test]
async fn test_malformed_table_spec_aborts_before_any_ddl() {
    let dir = TestDir::new("malformed");
    let mut schema = Schema::current();
    schema
        .tables
        .push(TableSpec::new("broken", &["_id", "name"], &["INTEGER"]));

    let err = Database::open_with_schema(&dir.db_path(), &dir.options(), &schema)
        .await
        .err()
        .expect("malformed schema should be rejected");
    assert!(matches!(
        err,
        DatabaseError::InvalidSchema(SchemaError::ColumnTypeMismatch { .. })
    ));
    // Nothing was created, not even the file
    assert!(!Path::new(&dir.db_path()).exists());
}

#[tokio::test]
async fn test_custom_schema_creates_tables_in_order() {
    let dir = TestDir::new("custom");
    let schema = Schema {
        version: 1,
        tables: vec![TableSpec::new("notes", &["_id", "body"], &["INTEGER", "TEXT"])],
        upgrades: Vec::new(),
    };

    let db = Database::open_with_schema(&dir.db_path(), &dir.options(), &schema)
        .await
        .unwrap();
    assert_eq!(db.state(), &SchemaState::Created { version: 1 });
    // Bootstrap still runs; it fails without a feeds table and is swallowed
    assert!(db.wait_for_bootstrap().await.is_some());
    assert_eq!(db.table_names().await.unwrap(), vec!["notes"]);
    db.close().await;
}
