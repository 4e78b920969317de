//! OPML subscription lists.
//!
//! FeedEx backups and the bundled default feed list are OPML documents.
//! [`opml`] reads them into an [`OpmlDocument`] (groups, feeds, per-feed
//! filters and the full-text flag) and writes them back out.

mod opml;

pub use opml::{
    export_opml, export_to_file, parse, parse_str, OpmlDocument, OpmlError, OpmlFeed,
    OpmlFilter, Outline,
};
