//! Local store for the FeedEx feed reader.
//!
//! - [`storage`]: the SQLite schema manager. Creates the feeds, filters and
//!   entries tables, upgrades older files, and seeds a fresh database from
//!   the OPML backup (or the bundled defaults) in the background.
//! - [`feed`]: OPML reading and writing.
//! - [`config`]: optional TOML configuration.

pub mod config;
pub mod feed;
pub mod storage;
