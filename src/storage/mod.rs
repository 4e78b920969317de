mod backup;
mod schema;
pub mod tables;
mod types;

pub use backup::DEFAULT_FEEDS_OPML;
pub use schema::{
    Database, Schema, StoreOptions, UpgradeStep, BACKUP_FILE_NAME, DATABASE_NAME,
    DATABASE_VERSION, UPGRADE_LADDER,
};
pub use tables::TableSpec;
pub use types::{
    DatabaseError, ImportSource, ImportSummary, SchemaError, SchemaState, StepOutcome,
    UpgradeReport,
};
