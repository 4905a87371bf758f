//! Source catalog and item store.
//!
//! [`SourceCatalog`] and [`ItemSink`] are the seams the scheduler depends on;
//! [`Database`] implements both on top of the repositories below.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::fetcher::validate_url;
use super::types::{Item, NewItem, NewSource, Source, UpsertOutcome};
use crate::datetime::{parse_stored, to_stored};
use crate::db::{Database, DbPool};
use crate::{Result, RssaggError};

/// Read/write access to the registered sources.
#[async_trait]
pub trait SourceCatalog: Send + Sync {
    /// Up to `n` sources ordered by last fetch (never-fetched first), then ID.
    async fn select_due(&self, n: usize) -> Result<Vec<Source>>;

    /// Record a fetch attempt.
    async fn mark_fetched(&self, source_id: i64, at: DateTime<Utc>) -> Result<()>;
}

/// Idempotent item persistence keyed by link.
#[async_trait]
pub trait ItemSink: Send + Sync {
    /// Store an item unless one with the same link already exists.
    async fn upsert_item(&self, item: &NewItem) -> Result<UpsertOutcome>;
}

/// Row type for sources.
#[derive(Debug, Clone, sqlx::FromRow)]
struct SourceRow {
    id: i64,
    url: String,
    name: String,
    last_fetched_at: Option<String>,
}

impl From<SourceRow> for Source {
    fn from(row: SourceRow) -> Self {
        Source {
            id: row.id,
            url: row.url,
            name: row.name,
            last_fetched_at: row.last_fetched_at.and_then(|s| parse_stored(&s)),
        }
    }
}

/// Row type for items.
#[derive(Debug, Clone, sqlx::FromRow)]
struct ItemRow {
    id: i64,
    source_id: i64,
    link: String,
    title: String,
    description: String,
    published_at: String,
    discovered_at: String,
}

impl From<ItemRow> for Item {
    fn from(row: ItemRow) -> Self {
        Item {
            id: row.id,
            source_id: row.source_id,
            link: row.link,
            title: row.title,
            description: row.description,
            published_at: parse_stored(&row.published_at).unwrap_or_else(Utc::now),
            discovered_at: parse_stored(&row.discovered_at).unwrap_or_else(Utc::now),
        }
    }
}

const SOURCE_COLUMNS: &str = "id, url, name, last_fetched_at";
const ITEM_COLUMNS: &str =
    "id, source_id, link, title, description, published_at, discovered_at";

/// Repository for source operations.
pub struct SourceRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> SourceRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Create a new source. Fails if the URL is already registered.
    pub async fn create(&self, source: &NewSource) -> Result<Source> {
        validate_new_source(source)?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO sources (url, name)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(&source.url)
        .bind(&source.name)
        .fetch_one(self.pool)
        .await?;

        self.get_by_id(id)
            .await?
            .ok_or_else(|| RssaggError::NotFound("source".into()))
    }

    /// Register a source, returning the existing row when the URL is known.
    pub async fn register(&self, source: &NewSource) -> Result<Source> {
        validate_new_source(source)?;

        sqlx::query("INSERT INTO sources (url, name) VALUES ($1, $2) ON CONFLICT(url) DO NOTHING")
            .bind(&source.url)
            .bind(&source.name)
            .execute(self.pool)
            .await?;

        self.get_by_url(&source.url)
            .await?
            .ok_or_else(|| RssaggError::NotFound("source".into()))
    }

    /// Get a source by ID.
    pub async fn get_by_id(&self, id: i64) -> Result<Option<Source>> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE id = $1");
        let row = sqlx::query_as::<_, SourceRow>(&query)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(row.map(Source::from))
    }

    /// Get a source by URL.
    pub async fn get_by_url(&self, url: &str) -> Result<Option<Source>> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources WHERE url = $1");
        let row = sqlx::query_as::<_, SourceRow>(&query)
            .bind(url)
            .fetch_optional(self.pool)
            .await?;

        Ok(row.map(Source::from))
    }

    /// List all sources in registration order.
    pub async fn list_all(&self) -> Result<Vec<Source>> {
        let query = format!("SELECT {SOURCE_COLUMNS} FROM sources ORDER BY id ASC");
        let rows = sqlx::query_as::<_, SourceRow>(&query)
            .fetch_all(self.pool)
            .await?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    /// Select up to `n` least-recently-fetched sources.
    ///
    /// Never-fetched sources come first; ties are broken by ID.
    pub async fn select_due(&self, n: usize) -> Result<Vec<Source>> {
        if n == 0 {
            return Ok(Vec::new());
        }

        let query = format!(
            r#"
            SELECT {SOURCE_COLUMNS}
            FROM sources
            ORDER BY last_fetched_at ASC NULLS FIRST, id ASC
            LIMIT $1
            "#
        );
        let limit = i64::try_from(n).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, SourceRow>(&query)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        Ok(rows.into_iter().map(Source::from).collect())
    }

    /// Set a source's last fetch attempt time.
    pub async fn mark_fetched(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query("UPDATE sources SET last_fetched_at = $1 WHERE id = $2")
            .bind(to_stored(&at))
            .bind(id)
            .execute(self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(RssaggError::NotFound(format!("source {}", id)));
        }
        Ok(())
    }

    /// Count registered sources.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sources")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}

fn validate_new_source(source: &NewSource) -> Result<()> {
    validate_url(&source.url)?;
    if source.name.trim().is_empty() {
        return Err(RssaggError::Validation("source name is empty".into()));
    }
    Ok(())
}

/// Repository for item operations.
pub struct ItemRepository<'a> {
    pool: &'a DbPool,
}

impl<'a> ItemRepository<'a> {
    /// Create a new repository instance.
    pub fn new(pool: &'a DbPool) -> Self {
        Self { pool }
    }

    /// Insert an item, ignoring a conflict on its link.
    pub async fn upsert(&self, item: &NewItem) -> Result<UpsertOutcome> {
        let id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO items (source_id, link, title, description, published_at, discovered_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT(link) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(item.source_id)
        .bind(&item.link)
        .bind(&item.title)
        .bind(&item.description)
        .bind(to_stored(&item.published_at))
        .bind(to_stored(&item.discovered_at))
        .fetch_optional(self.pool)
        .await?;

        Ok(match id {
            Some(id) => UpsertOutcome::Inserted(id),
            None => UpsertOutcome::Duplicate,
        })
    }

    /// Get an item by link.
    pub async fn get_by_link(&self, link: &str) -> Result<Option<Item>> {
        let query = format!("SELECT {ITEM_COLUMNS} FROM items WHERE link = $1");
        let row = sqlx::query_as::<_, ItemRow>(&query)
            .bind(link)
            .fetch_optional(self.pool)
            .await?;

        Ok(row.map(Item::from))
    }

    /// List a source's items, newest first.
    pub async fn list_by_source(&self, source_id: i64, limit: i64) -> Result<Vec<Item>> {
        let query = format!(
            r#"
            SELECT {ITEM_COLUMNS}
            FROM items
            WHERE source_id = $1
            ORDER BY published_at DESC, id DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, ItemRow>(&query)
            .bind(source_id)
            .bind(limit)
            .fetch_all(self.pool)
            .await?;

        Ok(rows.into_iter().map(Item::from).collect())
    }

    /// Count all stored items.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }

    /// Count items first stored for a source.
    pub async fn count_by_source(&self, source_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items WHERE source_id = $1")
            .bind(source_id)
            .fetch_one(self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl SourceCatalog for Database {
    async fn select_due(&self, n: usize) -> Result<Vec<Source>> {
        SourceRepository::new(self.pool()).select_due(n).await
    }

    async fn mark_fetched(&self, source_id: i64, at: DateTime<Utc>) -> Result<()> {
        SourceRepository::new(self.pool())
            .mark_fetched(source_id, at)
            .await
    }
}

#[async_trait]
impl ItemSink for Database {
    async fn upsert_item(&self, item: &NewItem) -> Result<UpsertOutcome> {
        ItemRepository::new(self.pool()).upsert(item).await
    }
}
