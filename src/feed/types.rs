//! Feed ingestion types for rssagg.

use chrono::{DateTime, Utc};

use crate::Result;

/// Maximum length for an item description, in characters.
pub const MAX_DESCRIPTION_LENGTH: usize = 10000;

/// A registered feed endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    /// Source ID.
    pub id: i64,
    /// Feed URL (unique within the catalog).
    pub url: String,
    /// Display name.
    pub name: String,
    /// Last time a fetch was attempted, successful or not.
    pub last_fetched_at: Option<DateTime<Utc>>,
}

/// New source for registration.
#[derive(Debug, Clone)]
pub struct NewSource {
    /// Feed URL.
    pub url: String,
    /// Display name.
    pub name: String,
}

impl NewSource {
    /// Create a new source.
    pub fn new(url: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            name: name.into(),
        }
    }
}

/// The sources selected for one scheduler tick, in selection order.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    sources: Vec<Source>,
}

impl Batch {
    /// Wrap a selection returned by the catalog.
    pub fn new(sources: Vec<Source>) -> Self {
        Self { sources }
    }

    /// Number of sources in the batch.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether the catalog returned nothing.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Source IDs in selection order.
    pub fn ids(&self) -> Vec<i64> {
        self.sources.iter().map(|s| s.id).collect()
    }

    /// Borrow the sources.
    pub fn sources(&self) -> &[Source] {
        &self.sources
    }
}

impl IntoIterator for Batch {
    type Item = Source;
    type IntoIter = std::vec::IntoIter<Source>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.into_iter()
    }
}

/// Outcome of one fetch attempt. Lives only inside a pipeline run.
#[derive(Debug)]
pub struct FetchResult {
    /// Source the fetch was made for.
    pub source_id: i64,
    /// When the attempt started.
    pub attempted_at: DateTime<Utc>,
    /// Raw body or transport error.
    pub payload: Result<Vec<u8>>,
}

/// A stored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    /// Item ID.
    pub id: i64,
    /// Source that first produced this link.
    pub source_id: i64,
    /// Link to the original content (unique).
    pub link: String,
    /// Item title.
    pub title: String,
    /// Item description (HTML stripped).
    pub description: String,
    /// Publish time, or ingestion time when the feed had none.
    pub published_at: DateTime<Utc>,
    /// When the item was first stored.
    pub discovered_at: DateTime<Utc>,
}

/// New item for insertion.
#[derive(Debug, Clone)]
pub struct NewItem {
    /// Owning source.
    pub source_id: i64,
    /// Link (natural key).
    pub link: String,
    /// Item title.
    pub title: String,
    /// Item description.
    pub description: String,
    /// Publish time.
    pub published_at: DateTime<Utc>,
    /// Discovery time.
    pub discovered_at: DateTime<Utc>,
}

impl NewItem {
    /// Build an insertable item from a parsed entry.
    pub fn from_parsed(source_id: i64, parsed: ParsedItem, discovered_at: DateTime<Utc>) -> Self {
        Self {
            source_id,
            link: parsed.link,
            title: parsed.title,
            description: parsed.description,
            published_at: parsed.published_at,
            discovered_at,
        }
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was stored with this ID.
    Inserted(i64),
    /// An item with the same link already existed; nothing changed.
    Duplicate,
}

impl UpsertOutcome {
    /// Whether a new row was stored.
    pub fn is_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// One normalized entry decoded from a feed document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedItem {
    /// Non-empty link.
    pub link: String,
    /// Title, empty when absent.
    pub title: String,
    /// Description, empty when absent.
    pub description: String,
    /// Publish time, parse time when absent or unparseable.
    pub published_at: DateTime<Utc>,
}
