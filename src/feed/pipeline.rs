//! Per-source fetch, parse and persist pipeline.
//!
//! Every failure is contained here: the caller only ever receives a
//! [`PipelineReport`].

use chrono::Utc;
use tracing::{debug, error, info, warn};

use super::fetcher::FeedFetcher;
use super::parser::parse_feed;
use super::repository::{ItemSink, SourceCatalog};
use super::types::{FetchResult, NewItem, Source, UpsertOutcome};

/// How far a pipeline run got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Fetched and parsed; every item was offered to the sink.
    Completed,
    /// The fetch client returned a transport error.
    FetchFailed(String),
    /// The document could not be parsed.
    ParseFailed(String),
}

/// Result of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineReport {
    /// Source the run was for.
    pub source_id: i64,
    /// Where the run stopped.
    pub outcome: PipelineOutcome,
    /// Items newly stored.
    pub inserted: usize,
    /// Items whose link was already stored.
    pub duplicates: usize,
    /// Items the sink failed to store.
    pub failed: usize,
    /// Whether recording the attempt in the catalog failed.
    pub mark_failed: bool,
}

impl PipelineReport {
    fn new(source_id: i64) -> Self {
        Self {
            source_id,
            outcome: PipelineOutcome::Completed,
            inserted: 0,
            duplicates: 0,
            failed: 0,
            mark_failed: false,
        }
    }

    /// Whether the source was fetched and parsed.
    pub fn is_completed(&self) -> bool {
        self.outcome == PipelineOutcome::Completed
    }
}

/// Run fetch, parse and per-item upsert for one source, then record the
/// attempt in the catalog regardless of outcome.
pub async fn run_pipeline(
    source: &Source,
    fetcher: &dyn FeedFetcher,
    catalog: &dyn SourceCatalog,
    sink: &dyn ItemSink,
) -> PipelineReport {
    let mut report = PipelineReport::new(source.id);
    debug!(source_id = source.id, url = %source.url, "Fetching source");

    let fetched = FetchResult {
        source_id: source.id,
        attempted_at: Utc::now(),
        payload: fetcher.fetch(&source.url).await,
    };

    match fetched.payload {
        Ok(bytes) => ingest(source, &bytes, sink, &mut report).await,
        Err(e) => {
            warn!(source_id = source.id, url = %source.url, error = %e, "Fetch failed");
            report.outcome = PipelineOutcome::FetchFailed(e.to_string());
        }
    }

    if let Err(e) = catalog
        .mark_fetched(fetched.source_id, fetched.attempted_at)
        .await
    {
        error!(source_id = source.id, error = %e, "Failed to mark source fetched");
        report.mark_failed = true;
    }

    report
}

async fn ingest(source: &Source, bytes: &[u8], sink: &dyn ItemSink, report: &mut PipelineReport) {
    let now = Utc::now();
    let items = match parse_feed(bytes, now) {
        Ok(items) => items,
        Err(e) => {
            warn!(source_id = source.id, url = %source.url, error = %e, "Parse failed");
            report.outcome = PipelineOutcome::ParseFailed(e.to_string());
            return;
        }
    };

    for parsed in items {
        let item = NewItem::from_parsed(source.id, parsed, now);
        match sink.upsert_item(&item).await {
            Ok(UpsertOutcome::Inserted(_)) => report.inserted += 1,
            Ok(UpsertOutcome::Duplicate) => report.duplicates += 1,
            Err(e) => {
                error!(
                    source_id = source.id,
                    link = %item.link,
                    error = %e,
                    "Failed to store item"
                );
                report.failed += 1;
            }
        }
    }

    if report.inserted > 0 {
        info!(
            source_id = source.id,
            "Source updated: {} new item(s)", report.inserted
        );
    } else {
        debug!(source_id = source.id, "Source updated: no new items");
    }
}
