//! Syndication document parser.
//!
//! Decodes RSS 0.9x/1.0/2.0 and Atom documents into [`ParsedItem`]s in
//! document order. Only a document that cannot be read as a feed at all is an
//! error; missing optional fields fall back to defaults.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use feed_rs::model::Entry;
use feed_rs::parser;

use super::types::{ParsedItem, MAX_DESCRIPTION_LENGTH};
use crate::datetime::parse_feed_timestamp;
use crate::{Result, RssaggError};

/// Parse feed bytes into normalized items.
///
/// `now` is used as the publish time of entries without a usable timestamp.
/// Entries without a link are dropped, and a link repeated within the same
/// document is kept only once (first occurrence wins).
pub fn parse_feed(bytes: &[u8], now: DateTime<Utc>) -> Result<Vec<ParsedItem>> {
    let feed = parser::Builder::new()
        .timestamp_parser(parse_feed_timestamp)
        .build()
        .parse(bytes)
        .map_err(|e| RssaggError::Parse(format!("failed to parse feed: {}", e)))?;

    let mut seen = HashSet::new();
    let items = feed
        .entries
        .into_iter()
        .filter_map(|entry| normalize_entry(entry, now))
        .filter(|item| seen.insert(item.link.clone()))
        .collect();

    Ok(items)
}

fn normalize_entry(entry: Entry, now: DateTime<Utc>) -> Option<ParsedItem> {
    let link = entry
        .links
        .iter()
        .map(|l| l.href.trim())
        .find(|href| !href.is_empty())?
        .to_string();

    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .unwrap_or_default();
    let description = entry
        .summary
        .map(|t| t.content)
        .or(entry.content.and_then(|c| c.body))
        .map(|d| truncate_description(&strip_html(&d)))
        .unwrap_or_default();
    let published_at = entry.published.or(entry.updated).unwrap_or(now);

    Some(ParsedItem {
        link,
        title,
        description,
        published_at,
    })
}

/// Strip HTML tags and decode common entities, collapsing whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut entity: Option<String> = None;

    for ch in html.chars() {
        match (ch, entity.as_mut()) {
            (';', Some(name)) => {
                decode_entity(name, &mut result);
                entity = None;
            }
            // A bare '&' followed by something that can't be an entity.
            (c, Some(name)) if c.is_whitespace() || c == '&' || c == '<' || name.len() > 10 => {
                result.push('&');
                result.push_str(name);
                match c {
                    '&' => name.clear(),
                    '<' => {
                        entity = None;
                        in_tag = true;
                    }
                    _ => {
                        result.push(c);
                        entity = None;
                    }
                }
            }
            (c, Some(name)) => name.push(c),
            ('<', None) => in_tag = true,
            ('>', None) if in_tag => {
                in_tag = false;
                result.push(' ');
            }
            ('&', None) if !in_tag => entity = Some(String::new()),
            (c, None) if !in_tag => result.push(c),
            _ => {}
        }
    }

    if let Some(name) = entity {
        result.push('&');
        result.push_str(&name);
    }

    result.split_whitespace().collect::<Vec<&str>>().join(" ")
}

fn decode_entity(name: &str, out: &mut String) {
    match name {
        "amp" => out.push('&'),
        "lt" => out.push('<'),
        "gt" => out.push('>'),
        "quot" => out.push('"'),
        "apos" => out.push('\''),
        "nbsp" => out.push(' '),
        _ => match parse_numeric_entity(name).and_then(char::from_u32) {
            Some(c) => out.push(c),
            None => {
                out.push('&');
                out.push_str(name);
                out.push(';');
            }
        },
    }
}

/// Parse a numeric HTML entity body (e.g. `#123` or `#x7B`).
fn parse_numeric_entity(entity: &str) -> Option<u32> {
    let digits = entity.strip_prefix('#')?;
    match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => digits.parse().ok(),
    }
}

/// Truncate to [`MAX_DESCRIPTION_LENGTH`] characters.
fn truncate_description(text: &str) -> String {
    match text.char_indices().nth(MAX_DESCRIPTION_LENGTH) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text.to_string(),
    }
}
