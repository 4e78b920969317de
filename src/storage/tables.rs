//! Static table definitions and `CREATE TABLE` rendering.
//!
//! Column names and types are kept as parallel slices so the rendered DDL
//! matches the layout older FeedEx databases were created with. The text
//! produced by [`TableSpec::create_sql`] is stable: tooling that inspects
//! `sqlite_master` sees exactly `CREATE TABLE name (col type, col type)`.

use super::types::SchemaError;

// ============================================================================
// SQL Types
// ============================================================================

pub const TYPE_PRIMARY_KEY: &str = "INTEGER PRIMARY KEY AUTOINCREMENT";
pub const TYPE_EXTERNAL_ID: &str = "INTEGER(7)";
pub const TYPE_TEXT: &str = "TEXT";
pub const TYPE_TEXT_UNIQUE: &str = "TEXT UNIQUE";
pub const TYPE_DATE_TIME: &str = "DATETIME";
pub const TYPE_INT: &str = "INT";
pub const TYPE_BOOLEAN: &str = "INTEGER(1)";
pub const TYPE_BLOB: &str = "BLOB";

/// Row id column shared by every table.
pub const ID: &str = "_id";

// ============================================================================
// TableSpec
// ============================================================================

/// Name plus ordered column names and types of one table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSpec<'a> {
    pub name: &'a str,
    pub columns: &'a [&'a str],
    pub types: &'a [&'a str],
}

impl<'a> TableSpec<'a> {
    pub const fn new(name: &'a str, columns: &'a [&'a str], types: &'a [&'a str]) -> Self {
        Self {
            name,
            columns,
            types,
        }
    }

    /// Check the shape invariants without rendering anything.
    pub fn validate(&self) -> Result<(), SchemaError> {
        if self.name.trim().is_empty() {
            return Err(SchemaError::MissingTableName);
        }
        if self.columns.is_empty() || self.types.is_empty() {
            return Err(SchemaError::NoColumns(self.name.to_string()));
        }
        if self.columns.len() != self.types.len() {
            return Err(SchemaError::ColumnTypeMismatch {
                table: self.name.to_string(),
                columns: self.columns.len(),
                types: self.types.len(),
            });
        }
        if let Some(pos) = self
            .columns
            .iter()
            .zip(self.types.iter())
            .position(|(c, t)| c.trim().is_empty() || t.trim().is_empty())
        {
            return Err(SchemaError::BlankColumn {
                table: self.name.to_string(),
                position: pos,
            });
        }
        Ok(())
    }

    /// Render `CREATE TABLE <name> (<col> <type>, ...);`.
    pub fn create_sql(&self) -> Result<String, SchemaError> {
        self.validate()?;

        let mut sql = String::from("CREATE TABLE ");
        sql.push_str(self.name);
        sql.push_str(" (");
        for (n, (column, sql_type)) in self.columns.iter().zip(self.types.iter()).enumerate() {
            if n > 0 {
                sql.push_str(", ");
            }
            sql.push_str(column);
            sql.push(' ');
            sql.push_str(sql_type);
        }
        sql.push_str(");");
        Ok(sql)
    }
}

// ============================================================================
// FeedEx Tables
// ============================================================================

pub mod feeds {
    use super::*;

    pub const TABLE_NAME: &str = "feeds";

    pub const URL: &str = "url";
    pub const NAME: &str = "name";
    pub const IS_GROUP: &str = "isgroup";
    pub const GROUP_ID: &str = "groupid";
    pub const LAST_UPDATE: &str = "lastupdate";
    /// Added in schema version 2.
    pub const REAL_LAST_UPDATE: &str = "reallastupdate";
    /// Added in schema version 3.
    pub const RETRIEVE_FULLTEXT: &str = "retrievefulltext";
    pub const ICON: &str = "icon";
    pub const ERROR: &str = "error";
    pub const PRIORITY: &str = "priority";
    pub const FETCH_MODE: &str = "fetchmode";

    pub const COLUMNS: &[&str] = &[
        ID,
        URL,
        NAME,
        IS_GROUP,
        GROUP_ID,
        LAST_UPDATE,
        REAL_LAST_UPDATE,
        RETRIEVE_FULLTEXT,
        ICON,
        ERROR,
        PRIORITY,
        FETCH_MODE,
    ];

    pub const TYPES: &[&str] = &[
        TYPE_PRIMARY_KEY,
        TYPE_TEXT_UNIQUE,
        TYPE_TEXT,
        TYPE_BOOLEAN,
        TYPE_EXTERNAL_ID,
        TYPE_DATE_TIME,
        TYPE_DATE_TIME,
        TYPE_BOOLEAN,
        TYPE_BLOB,
        TYPE_TEXT,
        TYPE_INT,
        TYPE_INT,
    ];
}

pub mod filters {
    use super::*;

    pub const TABLE_NAME: &str = "filters";

    pub const FEED_ID: &str = "feedid";
    pub const FILTER_TEXT: &str = "filtertext";
    pub const IS_REGEX: &str = "isregex";
    pub const IS_APPLIED_TO_TITLE: &str = "isappliedtotitle";

    pub const COLUMNS: &[&str] = &[ID, FEED_ID, FILTER_TEXT, IS_REGEX, IS_APPLIED_TO_TITLE];

    pub const TYPES: &[&str] = &[
        TYPE_PRIMARY_KEY,
        TYPE_EXTERNAL_ID,
        TYPE_TEXT,
        TYPE_BOOLEAN,
        TYPE_BOOLEAN,
    ];
}

pub mod entries {
    use super::*;

    pub const TABLE_NAME: &str = "entries";

    pub const FEED_ID: &str = "feedid";
    pub const TITLE: &str = "title";
    pub const ABSTRACT: &str = "abstract";
    pub const MOBILIZED_HTML: &str = "mobilized";
    pub const DATE: &str = "date";
    pub const FETCH_DATE: &str = "fetch_date";
    pub const IS_READ: &str = "isread";
    pub const LINK: &str = "link";
    pub const IS_FAVORITE: &str = "favorite";
    pub const ENCLOSURE: &str = "enclosure";
    pub const GUID: &str = "guid";
    pub const AUTHOR: &str = "author";
    pub const IMAGE_URL: &str = "image_url";

    pub const COLUMNS: &[&str] = &[
        ID,
        FEED_ID,
        TITLE,
        ABSTRACT,
        MOBILIZED_HTML,
        DATE,
        FETCH_DATE,
        IS_READ,
        LINK,
        IS_FAVORITE,
        ENCLOSURE,
        GUID,
        AUTHOR,
        IMAGE_URL,
    ];

    pub const TYPES: &[&str] = &[
        TYPE_PRIMARY_KEY,
        TYPE_EXTERNAL_ID,
        TYPE_TEXT,
        TYPE_TEXT,
        TYPE_TEXT,
        TYPE_DATE_TIME,
        TYPE_DATE_TIME,
        TYPE_BOOLEAN,
        TYPE_TEXT,
        TYPE_BOOLEAN,
        TYPE_TEXT,
        TYPE_TEXT,
        TYPE_TEXT,
        TYPE_TEXT,
    ];
}

pub const FEEDS: TableSpec<'static> = TableSpec::new(feeds::TABLE_NAME, feeds::COLUMNS, feeds::TYPES);
pub const FILTERS: TableSpec<'static> =
    TableSpec::new(filters::TABLE_NAME, filters::COLUMNS, filters::TYPES);
pub const ENTRIES: TableSpec<'static> =
    TableSpec::new(entries::TABLE_NAME, entries::COLUMNS, entries::TYPES);
