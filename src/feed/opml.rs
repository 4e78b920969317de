use anyhow::{Context, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::path::Path;
use thiserror::Error;

/// Maximum allowed nesting depth for outline elements.
const MAX_OPML_DEPTH: usize = 50;

/// Errors that can occur during OPML parsing.
#[derive(Debug, Error)]
pub enum OpmlError {
    /// OPML nesting depth exceeds safety limit.
    #[error("OPML nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),

    /// XML parsing failed.
    #[error("XML parse error: {0}")]
    XmlParse(String),

    /// File I/O error.
    #[error("Failed to read OPML file: {0}")]
    Io(#[from] std::io::Error),
}

/// A parsed subscription list: groups and ungrouped feeds in document order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OpmlDocument {
    pub outlines: Vec<Outline>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outline {
    Group { title: String, feeds: Vec<OpmlFeed> },
    Feed(OpmlFeed),
}

/// A feed subscription: an `<outline>` element with an `xmlUrl` attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFeed {
    /// Sourced from `title`, falling back to `text`, then to the URL itself.
    pub title: String,
    pub xml_url: String,
    /// `retrieveFullText="true"`
    pub retrieve_fulltext: bool,
    pub filters: Vec<OpmlFilter>,
}

/// A `<filter>` child of a feed outline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpmlFilter {
    pub text: String,
    pub is_regex: bool,
    pub applies_to_title: bool,
}

impl OpmlDocument {
    /// All feeds, grouped or not, in document order.
    pub fn feeds(&self) -> impl Iterator<Item = &OpmlFeed> {
        self.outlines.iter().flat_map(|outline| match outline {
            Outline::Group { feeds, .. } => feeds.iter(),
            Outline::Feed(feed) => std::slice::from_ref(feed).iter(),
        })
    }

    pub fn feed_count(&self) -> usize {
        self.feeds().count()
    }

    fn feed_mut(&mut self, slot: FeedSlot) -> Option<&mut OpmlFeed> {
        match slot {
            FeedSlot::TopLevel(i) => match self.outlines.get_mut(i)? {
                Outline::Feed(feed) => Some(feed),
                Outline::Group { .. } => None,
            },
            FeedSlot::Grouped(g, i) => match self.outlines.get_mut(g)? {
                Outline::Group { feeds, .. } => feeds.get_mut(i),
                Outline::Feed(_) => None,
            },
        }
    }
}

/// Parses an OPML file from disk.
///
/// # Errors
///
/// Returns an error if the file cannot be read, is not valid XML, or nests
/// outlines deeper than the supported limit.
///
/// # Security
///
/// `quick-xml` (0.37) does not parse `<!ENTITY>` declarations, so custom
/// entities cannot expand to file contents; they fail as unrecognized.
pub async fn parse(path: &Path) -> Result<OpmlDocument> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read OPML file: {}", path.display()))?;
    parse_str(&content)
}

#[derive(Debug, Clone, Copy)]
enum FeedSlot {
    TopLevel(usize),
    Grouped(usize, usize),
}

/// What an open `<outline>` turned out to be.
#[derive(Debug, Clone, Copy)]
enum Open {
    Group(usize),
    Category,
    Feed(FeedSlot),
    Skipped,
}

/// Parses OPML text.
///
/// Top-level outlines without `xmlUrl` become groups. Category outlines
/// nested below a group are walked through and their feeds land in the
/// enclosing top-level group.
pub fn parse_str(content: &str) -> Result<OpmlDocument> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(true);

    let mut doc = OpmlDocument::default();
    let mut buf = Vec::new();
    let mut stack: Vec<Open> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().as_ref() == b"outline" => {
                if stack.len() >= MAX_OPML_DEPTH {
                    return Err(OpmlError::MaxDepthExceeded(MAX_OPML_DEPTH).into());
                }
                let open = place_outline(&mut doc, &stack, &e, &reader)?;
                stack.push(open);
            }
            Ok(Event::Empty(e)) if e.name().as_ref() == b"outline" => {
                // Self-closing outline doesn't affect depth
                place_outline(&mut doc, &stack, &e, &reader)?;
            }
            Ok(Event::End(e)) if e.name().as_ref() == b"outline" => {
                stack.pop();
            }
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"filter" => {
                if let Some(Open::Feed(slot)) = stack.last().copied() {
                    let filter = parse_filter(&e, &reader)?;
                    if let (Some(filter), Some(feed)) = (filter, doc.feed_mut(slot)) {
                        feed.filters.push(filter);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(OpmlError::XmlParse(e.to_string()).into()),
            _ => {}
        }
        buf.clear();
    }

    Ok(doc)
}

fn enclosing_group(stack: &[Open]) -> Option<usize> {
    match stack.first() {
        Some(Open::Group(g)) => Some(*g),
        _ => None,
    }
}

/// Adds the outline to `doc` and reports what it was.
fn place_outline(
    doc: &mut OpmlDocument,
    stack: &[Open],
    e: &BytesStart<'_>,
    reader: &Reader<&[u8]>,
) -> Result<Open> {
    let attrs = OutlineAttributes::read(e, reader)?;

    let Some(xml_url) = attrs.xml_url else {
        if stack.is_empty() {
            doc.outlines.push(Outline::Group {
                title: attrs.title.unwrap_or_default(),
                feeds: Vec::new(),
            });
            return Ok(Open::Group(doc.outlines.len() - 1));
        }
        return Ok(Open::Category);
    };

    if !is_feed_url(&xml_url) {
        tracing::warn!(url = %xml_url, "Skipping invalid feed URL");
        return Ok(Open::Skipped);
    }

    let feed = OpmlFeed {
        title: attrs.title.unwrap_or_else(|| xml_url.clone()),
        xml_url,
        retrieve_fulltext: attrs.retrieve_fulltext,
        filters: Vec::new(),
    };

    let slot = match enclosing_group(stack) {
        Some(g) => match doc.outlines.get_mut(g) {
            Some(Outline::Group { feeds, .. }) => {
                feeds.push(feed);
                FeedSlot::Grouped(g, feeds.len() - 1)
            }
            _ => return Ok(Open::Skipped),
        },
        None => {
            doc.outlines.push(Outline::Feed(feed));
            FeedSlot::TopLevel(doc.outlines.len() - 1)
        }
    };
    Ok(Open::Feed(slot))
}

#[derive(Default)]
struct OutlineAttributes {
    xml_url: Option<String>,
    title: Option<String>,
    retrieve_fulltext: bool,
}

impl OutlineAttributes {
    fn read(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Self> {
        let mut attrs = Self::default();
        let decoder = reader.decoder();

        for attr_result in e.attributes() {
            let attr = match attr_result {
                Ok(attr) => attr,
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed OPML attribute");
                    continue;
                }
            };
            match attr.key.as_ref() {
                b"xmlUrl" => {
                    let url = attr.decode_and_unescape_value(decoder)?;
                    let url = url.trim();
                    if !url.is_empty() {
                        attrs.xml_url = Some(url.to_string());
                    }
                }
                b"title" => attrs.title = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
                b"text" => {
                    if attrs.title.is_none() {
                        attrs.title = Some(attr.decode_and_unescape_value(decoder)?.to_string())
                    }
                }
                b"retrieveFullText" => {
                    attrs.retrieve_fulltext = is_true(&attr.decode_and_unescape_value(decoder)?)
                }
                _ => {}
            }
        }

        Ok(attrs)
    }
}

fn parse_filter(e: &BytesStart<'_>, reader: &Reader<&[u8]>) -> Result<Option<OpmlFilter>> {
    let decoder = reader.decoder();
    let mut text = None;
    let mut is_regex = false;
    let mut applies_to_title = false;

    for attr in e.attributes().flatten() {
        match attr.key.as_ref() {
            b"text" => text = Some(attr.decode_and_unescape_value(decoder)?.to_string()),
            b"isRegex" => is_regex = is_true(&attr.decode_and_unescape_value(decoder)?),
            b"isAppliedToTitle" => {
                applies_to_title = is_true(&attr.decode_and_unescape_value(decoder)?)
            }
            _ => {}
        }
    }

    Ok(text.filter(|t| !t.is_empty()).map(|text| OpmlFilter {
        text,
        is_regex,
        applies_to_title,
    }))
}

fn is_true(value: &str) -> bool {
    value.trim().eq_ignore_ascii_case("true")
}

/// Absolute http(s) URL with a host.
fn is_feed_url(candidate: &str) -> bool {
    match url::Url::parse(candidate) {
        Ok(url) => matches!(url.scheme(), "http" | "https") && url.host_str().is_some(),
        Err(_) => false,
    }
}

/// Exports a subscription list as an OPML XML string.
///
/// Groups become outlines holding their feeds. Feeds with filters are written
/// as open elements with `<filter>` children, others as empty elements.
pub fn export_opml(doc: &OpmlDocument) -> Result<String> {
    use quick_xml::events::{BytesDecl, BytesEnd, BytesText};
    use quick_xml::Writer;
    use std::io::Cursor;

    let mut writer = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .context("Failed to write XML declaration")?;

    let mut opml = BytesStart::new("opml");
    opml.push_attribute(("version", "1.0"));
    writer
        .write_event(Event::Start(opml))
        .context("Failed to write opml element")?;

    // <head><title/><dateCreated/></head>
    let created = chrono::Utc::now().to_rfc2822();
    writer
        .write_event(Event::Start(BytesStart::new("head")))
        .context("Failed to write head element")?;
    for (tag, text) in [("title", "FeedEx export"), ("dateCreated", created.as_str())] {
        writer
            .write_event(Event::Start(BytesStart::new(tag)))
            .with_context(|| format!("Failed to write {} element", tag))?;
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .with_context(|| format!("Failed to write {} text", tag))?;
        writer
            .write_event(Event::End(BytesEnd::new(tag)))
            .with_context(|| format!("Failed to write {} end", tag))?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("head")))
        .context("Failed to write head end")?;

    writer
        .write_event(Event::Start(BytesStart::new("body")))
        .context("Failed to write body element")?;

    for outline in &doc.outlines {
        match outline {
            Outline::Group { title, feeds } => {
                let mut group = BytesStart::new("outline");
                group.push_attribute(("title", title.as_str()));
                group.push_attribute(("text", title.as_str()));
                writer
                    .write_event(Event::Start(group))
                    .context("Failed to write group outline")?;
                for feed in feeds {
                    write_feed(&mut writer, feed)?;
                }
                writer
                    .write_event(Event::End(BytesEnd::new("outline")))
                    .context("Failed to write group outline end")?;
            }
            Outline::Feed(feed) => write_feed(&mut writer, feed)?,
        }
    }

    writer
        .write_event(Event::End(BytesEnd::new("body")))
        .context("Failed to write body end")?;
    writer
        .write_event(Event::End(BytesEnd::new("opml")))
        .context("Failed to write opml end")?;

    let result = writer.into_inner().into_inner();
    String::from_utf8(result).context("Generated OPML contains invalid UTF-8")
}

fn write_feed<W: std::io::Write>(writer: &mut quick_xml::Writer<W>, feed: &OpmlFeed) -> Result<()> {
    use quick_xml::events::BytesEnd;

    let mut outline = BytesStart::new("outline");
    outline.push_attribute(("type", "rss"));
    outline.push_attribute(("title", feed.title.as_str()));
    outline.push_attribute(("text", feed.title.as_str()));
    outline.push_attribute(("xmlUrl", feed.xml_url.as_str()));
    if feed.retrieve_fulltext {
        outline.push_attribute(("retrieveFullText", "true"));
    }

    if feed.filters.is_empty() {
        writer
            .write_event(Event::Empty(outline))
            .context("Failed to write outline element")?;
        return Ok(());
    }

    writer
        .write_event(Event::Start(outline))
        .context("Failed to write outline element")?;
    for filter in &feed.filters {
        let mut element = BytesStart::new("filter");
        element.push_attribute(("text", filter.text.as_str()));
        element.push_attribute(("isRegex", if filter.is_regex { "true" } else { "false" }));
        element.push_attribute((
            "isAppliedToTitle",
            if filter.applies_to_title { "true" } else { "false" },
        ));
        writer
            .write_event(Event::Empty(element))
            .context("Failed to write filter element")?;
    }
    writer
        .write_event(Event::End(BytesEnd::new("outline")))
        .context("Failed to write outline end")?;
    Ok(())
}

/// Exports a subscription list to an OPML file atomically.
///
/// Writes to a temporary file in the same directory, syncs it, then renames
/// over the destination so a reader never sees a partial backup.
pub fn export_to_file(doc: &OpmlDocument, path: &Path) -> Result<()> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let content = export_opml(doc)?;

    // Unpredictable temp name so nothing can be planted there in advance
    let random_suffix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let temp_path = path.with_extension(format!("tmp.{:016x}", random_suffix));

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp_path)
        .with_context(|| {
            format!(
                "Failed to create temporary file '{}': check directory permissions",
                temp_path.display()
            )
        })?;

    std::io::Write::write_all(&mut file, content.as_bytes()).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to write OPML to temporary file '{}'",
            temp_path.display()
        )
    })?;

    file.sync_all().with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to sync temporary file '{}' to disk",
            temp_path.display()
        )
    })?;

    drop(file);

    std::fs::rename(&temp_path, path).with_context(|| {
        let _ = std::fs::remove_file(&temp_path);
        format!(
            "Failed to rename '{}' to '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    Ok(())
}
