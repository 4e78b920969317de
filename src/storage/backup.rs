use anyhow::{Context, Result};
use sqlx::SqliteConnection;
use std::collections::HashMap;
use std::path::Path;

use super::schema::Database;
use super::types::{ImportSource, ImportSummary};
use crate::feed::{self, OpmlDocument, OpmlFeed, OpmlFilter, Outline};

/// Feed list imported into a fresh database when no backup file exists.
pub const DEFAULT_FEEDS_OPML: &str = include_str!("../../assets/default_feeds.opml");

/// Row type for the feed export query
type FeedExportRow = (
    i64,
    Option<String>, // url
    Option<String>, // name
    Option<bool>,   // isgroup
    Option<i64>,    // groupid
    Option<bool>,   // retrievefulltext
);

impl Database {
    // ========================================================================
    // Import
    // ========================================================================

    /// Parse `source` and import it.
    pub async fn import_from(&self, source: &ImportSource) -> Result<ImportSummary> {
        let doc = match source {
            ImportSource::Backup(path) => feed::parse(path).await?,
            ImportSource::Defaults => {
                feed::parse_str(DEFAULT_FEEDS_OPML).context("Bundled default feeds are invalid")?
            }
        };
        self.import_opml(&doc).await
    }

    /// Insert the groups, feeds and filters of `doc` in one transaction.
    ///
    /// Groups are matched by name. Feeds whose URL already exists are left
    /// untouched, and so are their filters. New rows get priorities after the
    /// current maximum so imported feeds sort below existing ones.
    pub async fn import_opml(&self, doc: &OpmlDocument) -> Result<ImportSummary> {
        let mut summary = ImportSummary::default();
        let mut tx = self.pool.begin().await?;

        let (mut priority,): (i64,) =
            sqlx::query_as("SELECT COALESCE(MAX(priority), 0) FROM feeds")
                .fetch_one(&mut *tx)
                .await?;

        for outline in &doc.outlines {
            match outline {
                Outline::Group { title, feeds } => {
                    priority += 1;
                    let group_id = match find_group(&mut *tx, title).await? {
                        Some(id) => id,
                        None => {
                            summary.groups += 1;
                            insert_group(&mut *tx, title, priority).await?
                        }
                    };
                    for feed in feeds {
                        priority += 1;
                        insert_feed(&mut *tx, feed, Some(group_id), priority, &mut summary).await?;
                    }
                }
                Outline::Feed(feed) => {
                    priority += 1;
                    insert_feed(&mut *tx, feed, None, priority, &mut summary).await?;
                }
            }
        }

        tx.commit().await?;
        Ok(summary)
    }

    // ========================================================================
    // Export
    // ========================================================================

    /// Read the subscription list back out as an OPML document.
    pub async fn export_opml(&self) -> Result<OpmlDocument> {
        let rows: Vec<FeedExportRow> = sqlx::query_as(
            r#"
            SELECT _id, url, name, isgroup, groupid, retrievefulltext
            FROM feeds
            ORDER BY priority, _id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let filter_rows: Vec<(i64, String, Option<bool>, Option<bool>)> = sqlx::query_as(
            r#"
            SELECT feedid, filtertext, isregex, isappliedtotitle
            FROM filters
            WHERE filtertext IS NOT NULL
            ORDER BY _id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut filters: HashMap<i64, Vec<OpmlFilter>> = HashMap::new();
        for (feed_id, text, is_regex, applies_to_title) in filter_rows {
            filters.entry(feed_id).or_default().push(OpmlFilter {
                text,
                is_regex: is_regex.unwrap_or(false),
                applies_to_title: applies_to_title.unwrap_or(false),
            });
        }

        let mut doc = OpmlDocument::default();
        let mut group_index: HashMap<i64, usize> = HashMap::new();
        let mut deferred: Vec<(i64, OpmlFeed)> = Vec::new();

        for (id, url, name, is_group, group_id, fulltext) in rows {
            if is_group.unwrap_or(false) {
                group_index.insert(id, doc.outlines.len());
                doc.outlines.push(Outline::Group {
                    title: name.unwrap_or_default(),
                    feeds: Vec::new(),
                });
                continue;
            }
            let Some(url) = url else {
                continue;
            };
            let feed = OpmlFeed {
                title: name.unwrap_or_else(|| url.clone()),
                xml_url: url,
                retrieve_fulltext: fulltext.unwrap_or(false),
                filters: filters.remove(&id).unwrap_or_default(),
            };
            match group_id {
                Some(group_id) => deferred.push((group_id, feed)),
                None => doc.outlines.push(Outline::Feed(feed)),
            }
        }

        // Grouped feeds keep their priority order within the group
        for (group_id, feed) in deferred {
            match group_index
                .get(&group_id)
                .and_then(|&i| doc.outlines.get_mut(i))
            {
                Some(Outline::Group { feeds, .. }) => feeds.push(feed),
                _ => doc.outlines.push(Outline::Feed(feed)),
            }
        }

        Ok(doc)
    }

    /// Write the subscription list to `path`. Returns the number of feeds written.
    pub async fn export_to(&self, path: &Path) -> Result<usize> {
        let doc = self.export_opml().await?;
        let count = doc.feed_count();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || feed::export_to_file(&doc, &path))
            .await
            .context("Export task panicked")??;
        Ok(count)
    }

    /// Best-effort backup to `path`. Failures are logged, never returned.
    pub async fn export_backup(&self, path: &Path) {
        match self.export_to(path).await {
            Ok(feeds) => tracing::info!(path = %path.display(), feeds, "Exported backup"),
            Err(e) => tracing::warn!(path = %path.display(), error = ?e, "Backup export failed"),
        }
    }
}

async fn find_group(conn: &mut SqliteConnection, name: &str) -> Result<Option<i64>> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT _id FROM feeds WHERE isgroup = 1 AND name = ? ORDER BY _id LIMIT 1")
            .bind(name)
            .fetch_optional(&mut *conn)
            .await?;
    Ok(row.map(|(id,)| id))
}

async fn insert_group(conn: &mut SqliteConnection, name: &str, priority: i64) -> Result<i64> {
    let (id,): (i64,) = sqlx::query_as(
        "INSERT INTO feeds (name, isgroup, priority) VALUES (?, 1, ?) RETURNING _id",
    )
    .bind(name)
    .bind(priority)
    .fetch_one(&mut *conn)
    .await?;
    Ok(id)
}

async fn insert_feed(
    conn: &mut SqliteConnection,
    feed: &OpmlFeed,
    group_id: Option<i64>,
    priority: i64,
    summary: &mut ImportSummary,
) -> Result<()> {
    let row: Option<(i64,)> = sqlx::query_as(
        r#"
        INSERT INTO feeds (url, name, isgroup, groupid, retrievefulltext, priority)
        VALUES (?, ?, 0, ?, ?, ?)
        ON CONFLICT(url) DO NOTHING
        RETURNING _id
    "#,
    )
    .bind(&feed.xml_url)
    .bind(&feed.title)
    .bind(group_id)
    .bind(feed.retrieve_fulltext)
    .bind(priority)
    .fetch_optional(&mut *conn)
    .await?;

    let Some((feed_id,)) = row else {
        tracing::debug!(url = %feed.xml_url, "Feed already present, skipping");
        summary.duplicates += 1;
        return Ok(());
    };
    summary.feeds += 1;

    for filter in &feed.filters {
        sqlx::query(
            "INSERT INTO filters (feedid, filtertext, isregex, isappliedtotitle) VALUES (?, ?, ?, ?)",
        )
        .bind(feed_id)
        .bind(&filter.text)
        .bind(filter.is_regex)
        .bind(filter.applies_to_title)
        .execute(&mut *conn)
        .await?;
        summary.filters += 1;
    }

    Ok(())
}
