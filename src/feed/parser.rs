use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::types::{FeedFormat, FeedItem, Source};

/// Errors that abort parsing of a whole feed body.
///
/// Problems with individual items never surface here: those items are
/// dropped and counted in [`ParseResult::skipped`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON feed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XML parse error: {0}")]
    Xml(String),
    #[error("Body contains no XML document")]
    NoDocument,
}

/// Items recovered from one feed body.
#[derive(Debug, Default)]
pub struct ParseResult {
    pub items: Vec<FeedItem>,
    /// Entries dropped because they could not be decoded.
    pub skipped: usize,
}

/// Parses a feed body according to the source's declared format.
pub fn parse_feed(source: &Source, bytes: &[u8]) -> Result<ParseResult, ParseError> {
    match source.format {
        FeedFormat::Json => parse_json_feed(&source.id, bytes),
        FeedFormat::Rss | FeedFormat::Atom => parse_xml_feed(&source.id, bytes),
    }
}

// ============================================================================
// JSON Feed
// ============================================================================

/// Parses a JSON-Feed-like body of the shape `{"items": [...]}`.
///
/// Item ids are `"{source_id}_{item.id}"`, or `"{source_id}_{index}"` when the
/// item carries no id. A body without an `items` array yields no items.
pub fn parse_json_feed(source_id: &str, bytes: &[u8]) -> Result<ParseResult, ParseError> {
    let document: Value = serde_json::from_slice(bytes)?;

    let Some(entries) = document.get("items").and_then(Value::as_array) else {
        tracing::warn!(source = %source_id, "JSON feed has no items array");
        return Ok(ParseResult::default());
    };

    let mut result = ParseResult::default();
    for (index, entry) in entries.iter().enumerate() {
        match json_item(source_id, index, entry) {
            Some(item) => result.items.push(item),
            None => {
                tracing::warn!(source = %source_id, index = index, "Skipping malformed JSON feed item");
                result.skipped += 1;
            }
        }
    }

    Ok(result)
}

fn json_item(source_id: &str, index: usize, entry: &Value) -> Option<FeedItem> {
    let obj = entry.as_object()?;

    let item_id = match obj.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => index.to_string(),
    };

    let text = |keys: &[&str]| -> Option<String> {
        keys.iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .map(str::to_string)
            .next()
    };

    let author = match obj.get("author") {
        Some(Value::String(name)) => Some(name.clone()),
        Some(Value::Object(a)) => a.get("name").and_then(Value::as_str).map(str::to_string),
        _ => obj
            .get("authors")
            .and_then(Value::as_array)
            .and_then(|list| list.first())
            .and_then(|a| a.get("name"))
            .and_then(Value::as_str)
            .map(str::to_string),
    };

    Some(FeedItem {
        id: format!("{}_{}", source_id, item_id),
        title: text(&["title"]).unwrap_or_else(|| "Untitled".to_string()),
        description: text(&["summary", "content_text", "content_html", "description"])
            .unwrap_or_default(),
        link: text(&["url", "link", "external_url"]).unwrap_or_default(),
        published_at: text(&["date_published", "published", "date_modified"])
            .and_then(|d| parse_date(&d))
            .unwrap_or_else(Utc::now),
        author,
        source_id: source_id.to_string(),
        raw: Some(entry.to_string()),
    })
}

// ============================================================================
// RSS / Atom
// ============================================================================

/// Fields gathered while walking one `<item>` or `<entry>`.
#[derive(Default)]
struct PendingItem {
    start: usize,
    guid: Option<String>,
    title: Option<String>,
    description: Option<String>,
    summary: Option<String>,
    content: Option<String>,
    link: Option<String>,
    published: Option<String>,
    updated: Option<String>,
    author: Option<String>,
    /// Text of the open child element, nested markup included.
    text: String,
    /// Text of `<author><name>` inside the open child, when present.
    author_name: String,
    /// Set when a field failed to decode; the item is dropped on close.
    broken: bool,
}

/// Parses an RSS 2.0 or Atom body.
///
/// RSS `<item>` elements are used when present, otherwise Atom `<entry>`
/// elements. Missing fields fall back to "Untitled", empty strings, and the
/// current time for the publish date.
pub fn parse_xml_feed(source_id: &str, bytes: &[u8]) -> Result<ParseResult, ParseError> {
    // SEC-002: quick-xml (0.37) never expands custom <!ENTITY> declarations;
    // an unknown entity fails to unescape and only that item is dropped.
    // Text is not trimmed per event so spacing between text and CDATA
    // segments survives; field values are trimmed once assembled.
    let mut reader = Reader::from_reader(bytes);

    let mut rss_items = ParseResult::default();
    let mut atom_entries = ParseResult::default();
    let mut saw_root = false;

    let mut buf = Vec::new();
    // Local names of open elements below the current item, innermost last
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<(ItemKind, PendingItem)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        let event = match reader.read_event_into(&mut buf) {
            Ok(event) => event,
            Err(e) => {
                if let Some((kind, _)) = current.take() {
                    tracing::warn!(source = %source_id, error = %e, "Dropping unterminated feed item");
                    match kind {
                        ItemKind::Item => rss_items.skipped += 1,
                        ItemKind::Entry => atom_entries.skipped += 1,
                    }
                }
                let collected = rss_items.items.len() + atom_entries.items.len();
                if collected == 0 {
                    return Err(ParseError::Xml(e.to_string()));
                }
                tracing::warn!(
                    source = %source_id,
                    error = %e,
                    recovered = collected,
                    "Feed truncated by XML error, keeping items parsed so far"
                );
                break;
            }
        };

        match event {
            Event::Start(e) => {
                saw_root = true;
                if let Some((_, item)) = current.as_mut() {
                    if path.is_empty() {
                        take_link_attr(&e, &reader, item);
                    }
                    path.push(e.local_name().as_ref().to_vec());
                } else if let Some(kind) = ItemKind::of(&e) {
                    path.clear();
                    current = Some((
                        kind,
                        PendingItem {
                            start: before,
                            ..Default::default()
                        },
                    ));
                }
            }
            Event::Empty(e) => {
                saw_root = true;
                if let Some((_, item)) = current.as_mut() {
                    if path.is_empty() {
                        take_link_attr(&e, &reader, item);
                    }
                } else if let Some(kind) = ItemKind::of(&e) {
                    let item = PendingItem {
                        start: before,
                        ..Default::default()
                    };
                    let end = reader.buffer_position() as usize;
                    let bucket = match kind {
                        ItemKind::Item => &mut rss_items,
                        ItemKind::Entry => &mut atom_entries,
                    };
                    finish_item(source_id, bytes, item, end, bucket);
                }
            }
            Event::End(_) if current.is_some() => match path.pop() {
                Some(field) => {
                    if path.is_empty() {
                        if let Some((_, item)) = current.as_mut() {
                            commit_field(item, &field);
                        }
                    }
                }
                // Closing tag of the item itself
                None => {
                    if let Some((kind, item)) = current.take() {
                        let end = reader.buffer_position() as usize;
                        let bucket = match kind {
                            ItemKind::Item => &mut rss_items,
                            ItemKind::Entry => &mut atom_entries,
                        };
                        finish_item(source_id, bytes, item, end, bucket);
                    }
                }
            },
            Event::Text(e) => {
                if let Some((_, item)) = current.as_mut() {
                    match e.unescape() {
                        Ok(text) => push_text(item, &path, &text),
                        Err(err) => {
                            tracing::debug!(source = %source_id, error = %err, "Undecodable text in feed item");
                            item.broken = true;
                        }
                    }
                }
            }
            Event::CData(e) => {
                if let Some((_, item)) = current.as_mut() {
                    let text = String::from_utf8_lossy(&e);
                    push_text(item, &path, &text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if !saw_root {
        return Err(ParseError::NoDocument);
    }

    // RSS items win; Atom entries are the fallback
    if rss_items.items.is_empty() && rss_items.skipped == 0 {
        Ok(atom_entries)
    } else {
        Ok(rss_items)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Item,
    Entry,
}

impl ItemKind {
    fn of(e: &BytesStart<'_>) -> Option<Self> {
        match e.local_name().as_ref() {
            b"item" => Some(ItemKind::Item),
            b"entry" => Some(ItemKind::Entry),
            _ => None,
        }
    }
}

/// Atom `<link href="..."/>`; only alternate (or rel-less) links count.
fn take_link_attr(e: &BytesStart<'_>, reader: &Reader<&[u8]>, item: &mut PendingItem) {
    if e.local_name().as_ref() != b"link" || item.link.is_some() {
        return;
    }

    let mut href = None;
    let mut rel = None;
    for attr in e.attributes().flatten() {
        let Ok(value) = attr.decode_and_unescape_value(reader.decoder()) else {
            continue;
        };
        match attr.key.as_ref() {
            b"href" => href = Some(value.into_owned()),
            b"rel" => rel = Some(value.into_owned()),
            _ => {}
        }
    }

    if matches!(rel.as_deref(), None | Some("alternate")) {
        item.link = href;
    }
}

/// Appends a text or CDATA segment to the open child element.
fn push_text(item: &mut PendingItem, path: &[Vec<u8>], text: &str) {
    if path.is_empty() {
        return;
    }
    item.text.push_str(text);
    if let [parent, field] = path {
        if parent.as_slice() == b"author" && field.as_slice() == b"name" {
            item.author_name.push_str(text);
        }
    }
}

/// Stores the assembled text of a closed child element. The first
/// non-empty occurrence of a field wins.
fn commit_field(item: &mut PendingItem, field: &[u8]) {
    let text = std::mem::take(&mut item.text);
    let author_name = std::mem::take(&mut item.author_name);

    let value = if field == b"author" && !author_name.trim().is_empty() {
        author_name
    } else {
        text
    };
    let value = value.trim();
    if value.is_empty() {
        return;
    }

    let slot = match field {
        b"guid" | b"id" => &mut item.guid,
        b"title" => &mut item.title,
        b"description" => &mut item.description,
        b"summary" => &mut item.summary,
        b"content" | b"encoded" => &mut item.content,
        b"link" => &mut item.link,
        b"pubDate" | b"published" | b"date" => &mut item.published,
        b"updated" => &mut item.updated,
        b"author" | b"creator" => &mut item.author,
        _ => return,
    };

    if slot.is_none() {
        *slot = Some(value.to_string());
    }
}

fn finish_item(
    source_id: &str,
    bytes: &[u8],
    item: PendingItem,
    end: usize,
    bucket: &mut ParseResult,
) {
    if item.broken {
        tracing::warn!(source = %source_id, "Skipping malformed feed item");
        bucket.skipped += 1;
        return;
    }

    let title = item.title.unwrap_or_else(|| "Untitled".to_string());
    let link = item.link.unwrap_or_default();
    let guid = generate_guid(item.guid.as_deref(), &link, &title);
    let raw = bytes
        .get(item.start..end)
        .map(|slice| String::from_utf8_lossy(slice).into_owned());

    bucket.items.push(FeedItem {
        id: format!("{}_{}", source_id, guid),
        title,
        description: item
            .description
            .or(item.summary)
            .or(item.content)
            .unwrap_or_default(),
        link,
        published_at: item
            .published
            .or(item.updated)
            .and_then(|d| parse_date(&d))
            .unwrap_or_else(Utc::now),
        author: item.author,
        source_id: source_id.to_string(),
        raw,
    });
}

/// Accepts RFC 2822 (RSS) and RFC 3339 (Atom, JSON Feed) timestamps.
fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Uses the feed's own guid when present, otherwise a digest of link and title
/// so the id is stable across refreshes.
fn generate_guid(existing: Option<&str>, link: &str, title: &str) -> String {
    if let Some(guid) = existing {
        let trimmed = guid.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let hash = Sha256::digest(format!("{}|{}", link, title).as_bytes());
    format!("{:x}", hash)[..16].to_string()
}
