//! Periodic ingestion scheduler.
//!
//! Each tick selects up to `concurrency` due sources and launches one
//! pipeline per source behind a [`ConcurrencyGate`] shared by every round, so
//! overlapping rounds never exceed `concurrency` in-flight pipelines. Rounds
//! are not awaited by the tick loop.
//!
//! A source stays claimed from selection until its pipeline has recorded the
//! attempt. Claimed sources are filtered out of later selections, so a round
//! that outlives the interval never has its sources queued a second time and
//! the next tick moves on to the next due sources instead.
//!
//! Ticks run on a fixed period. If the loop ever falls behind (only batch
//! selection is awaited), the next tick is pushed back by a full period
//! rather than fired in a burst or dropped.
//!
//! Cancellation stops new ticks and new launches; pipelines already running
//! are allowed to finish.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::fetcher::FeedFetcher;
use super::gate::ConcurrencyGate;
use super::pipeline::{run_pipeline, PipelineOutcome, PipelineReport};
use super::repository::{ItemSink, SourceCatalog};
use super::types::{Batch, Source};
use crate::config::{CatalogErrorPolicy, SchedulerConfig};
use crate::Result;

/// Shortest accepted tick period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Aggregated result of one round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Sources returned by the catalog.
    pub selected: usize,
    /// Pipelines started.
    pub launched: usize,
    /// Pipelines that fetched and parsed their source.
    pub completed: usize,
    /// Pipelines stopped by a transport error.
    pub fetch_failures: usize,
    /// Pipelines stopped by a parse error.
    pub parse_failures: usize,
    /// Items newly stored.
    pub inserted: usize,
    /// Items already present.
    pub duplicates: usize,
    /// Items the sink failed to store.
    pub item_failures: usize,
}

impl RoundSummary {
    fn record(&mut self, report: &PipelineReport) {
        match report.outcome {
            PipelineOutcome::Completed => self.completed += 1,
            PipelineOutcome::FetchFailed(_) => self.fetch_failures += 1,
            PipelineOutcome::ParseFailed(_) => self.parse_failures += 1,
        }
        self.inserted += report.inserted;
        self.duplicates += report.duplicates;
        self.item_failures += report.failed;
    }
}

/// Source IDs selected by a round whose pipelines have not finished.
#[derive(Debug, Clone, Default)]
struct ClaimedSources {
    ids: Arc<Mutex<HashSet<i64>>>,
}

impl ClaimedSources {
    fn len(&self) -> usize {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Claim up to `limit` unclaimed sources, keeping catalog order.
    fn claim(&self, candidates: Vec<Source>, limit: usize) -> Vec<(Source, SourceClaim)> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        candidates
            .into_iter()
            .filter(|source| ids.insert(source.id))
            .take(limit)
            .map(|source| {
                let claim = SourceClaim {
                    id: source.id,
                    claimed: self.clone(),
                };
                (source, claim)
            })
            .collect()
    }
}

/// Releases a source for selection when dropped.
#[derive(Debug)]
struct SourceClaim {
    id: i64,
    claimed: ClaimedSources,
}

impl Drop for SourceClaim {
    fn drop(&mut self) {
        self.claimed
            .ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// Handle to a round in progress.
#[derive(Debug)]
pub struct RoundHandle {
    source_ids: Vec<i64>,
    launcher: JoinHandle<RoundSummary>,
}

impl RoundHandle {
    /// Number of sources selected for this round.
    pub fn selected(&self) -> usize {
        self.source_ids.len()
    }

    /// IDs of the selected sources, in launch order.
    pub fn source_ids(&self) -> &[i64] {
        &self.source_ids
    }

    /// Wait for every pipeline launched by this round to finish.
    pub async fn wait(self) -> RoundSummary {
        match self.launcher.await {
            Ok(summary) => summary,
            Err(e) => {
                error!("Round launcher task failed: {}", e);
                RoundSummary {
                    selected: self.source_ids.len(),
                    ..RoundSummary::default()
                }
            }
        }
    }
}

/// Feed ingestion scheduler.
pub struct Scheduler {
    catalog: Arc<dyn SourceCatalog>,
    sink: Arc<dyn ItemSink>,
    fetcher: Arc<dyn FeedFetcher>,
    gate: ConcurrencyGate,
    interval: Duration,
    on_catalog_error: CatalogErrorPolicy,
    claimed: ClaimedSources,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl Scheduler {
    /// Create a scheduler with the given batch width and tick period.
    ///
    /// A `concurrency` of zero is treated as one, and `interval` is at
    /// least one millisecond.
    pub fn new(
        catalog: Arc<dyn SourceCatalog>,
        sink: Arc<dyn ItemSink>,
        fetcher: Arc<dyn FeedFetcher>,
        concurrency: usize,
        interval: Duration,
    ) -> Self {
        Self {
            catalog,
            sink,
            fetcher,
            gate: ConcurrencyGate::new(concurrency.max(1)),
            interval: interval.max(MIN_INTERVAL),
            on_catalog_error: CatalogErrorPolicy::default(),
            claimed: ClaimedSources::default(),
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Create a scheduler from configuration.
    pub fn from_config(
        catalog: Arc<dyn SourceCatalog>,
        sink: Arc<dyn ItemSink>,
        fetcher: Arc<dyn FeedFetcher>,
        config: &SchedulerConfig,
    ) -> Self {
        Self::new(
            catalog,
            sink,
            fetcher,
            config.concurrency,
            config.interval(),
        )
        .with_catalog_error_policy(config.on_catalog_error)
    }

    /// Set how [`run`](Self::run) reacts to a failing catalog selection.
    pub fn with_catalog_error_policy(mut self, policy: CatalogErrorPolicy) -> Self {
        self.on_catalog_error = policy;
        self
    }

    /// Batch width and pipeline limit.
    pub fn concurrency(&self) -> usize {
        self.gate.capacity()
    }

    /// Tick period.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The gate bounding in-flight pipelines.
    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    /// A token that stops the scheduler when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request shutdown. In-flight pipelines keep running until drained.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Number of tracked tasks still running.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Number of sources selected by earlier rounds and not yet finished.
    pub fn claimed_sources(&self) -> usize {
        self.claimed.len()
    }

    /// Select a batch and start its pipelines.
    ///
    /// Sources still queued or running from an earlier round are skipped in
    /// favour of the next due ones. Returns once the batch is selected;
    /// pipelines are launched in the background as gate slots free up.
    /// Fails only if the catalog does.
    pub async fn run_round(&self) -> Result<RoundHandle> {
        let width = self.concurrency();
        let candidates = self
            .catalog
            .select_due(width + self.claimed.len())
            .await?;
        let (sources, claims): (Vec<Source>, Vec<SourceClaim>) =
            self.claimed.claim(candidates, width).into_iter().unzip();
        let batch = Batch::new(sources);
        let source_ids = batch.ids();

        if batch.is_empty() {
            debug!("No sources due");
        } else {
            debug!("Selected {} source(s): {:?}", batch.len(), source_ids);
        }

        let launcher = self.tracker.spawn(launch_round(
            batch,
            claims,
            self.gate.clone(),
            self.cancel.clone(),
            self.tracker.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.catalog),
            Arc::clone(&self.sink),
        ));

        Ok(RoundHandle {
            source_ids,
            launcher,
        })
    }

    /// Run the tick loop until cancelled, then drain in-flight pipelines.
    ///
    /// The first round starts immediately. A tick that falls behind delays
    /// the following ones by a full period. A catalog failure ends the loop
    /// with an error only under [`CatalogErrorPolicy::Abort`].
    pub async fn run(&self) -> Result<()> {
        info!(
            "Scheduler started (concurrency: {}, interval: {:?})",
            self.concurrency(),
            self.interval
        );

        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Scheduler: shutdown requested");
                    break Ok(());
                }
                _ = timer.tick() => {}
            }

            debug!("Tick");
            if let Err(e) = self.run_round().await {
                match self.on_catalog_error {
                    CatalogErrorPolicy::Abort => {
                        error!("Failed to select due sources, stopping: {}", e);
                        break Err(e);
                    }
                    CatalogErrorPolicy::Retry => {
                        warn!("Failed to select due sources, retrying next tick: {}", e);
                    }
                }
            }
        };

        self.drain().await;
        info!("Scheduler stopped");
        result
    }

    /// Wait for every launched round and pipeline to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        if !self.tracker.is_empty() {
            info!("Waiting for {} task(s) to finish", self.tracker.len());
        }
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Run the scheduler on a new Tokio task.
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run().await })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("concurrency", &self.concurrency())
            .field("interval", &self.interval)
            .field("on_catalog_error", &self.on_catalog_error)
            .finish()
    }
}

#[allow(clippy::too_many_arguments)]
async fn launch_round(
    batch: Batch,
    claims: Vec<SourceClaim>,
    gate: ConcurrencyGate,
    cancel: CancellationToken,
    tracker: TaskTracker,
    fetcher: Arc<dyn FeedFetcher>,
    catalog: Arc<dyn SourceCatalog>,
    sink: Arc<dyn ItemSink>,
) -> RoundSummary {
    let mut summary = RoundSummary {
        selected: batch.len(),
        ..RoundSummary::default()
    };
    let mut pipelines = Vec::with_capacity(batch.len());

    // Claims left unlaunched on shutdown drop with the iterator.
    for (source, claim) in batch.into_iter().zip(claims) {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(source_id = source.id, "Shutdown requested, not launching");
                break;
            }
            permit = gate.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Failed to acquire pipeline slot: {}", e);
                    break;
                }
            },
        };

        let fetcher = Arc::clone(&fetcher);
        let catalog = Arc::clone(&catalog);
        let sink = Arc::clone(&sink);
        pipelines.push(tracker.spawn(async move {
            let _permit = permit;
            let _claim = claim;
            run_pipeline(&source, fetcher.as_ref(), catalog.as_ref(), sink.as_ref()).await
        }));
    }
    summary.launched = pipelines.len();

    for joined in join_all(pipelines).await {
        match joined {
            Ok(report) => summary.record(&report),
            Err(e) => error!("Pipeline task failed: {}", e),
        }
    }

    if summary.selected > 0 {
        info!(
            selected = summary.selected,
            succeeded = summary.completed,
            failed = summary.fetch_failures + summary.parse_failures,
            inserted = summary.inserted,
            duplicates = summary.duplicates,
            "Round finished"
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::feed::repository::{ItemRepository, SourceRepository};
    use crate::feed::types::{NewSource, Source};
    use crate::RssaggError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    const FEED: &str = r#"<rss version="2.0"><channel><title>T</title>
        <item><title>A</title><link>https://items.example/1</link></item>
    </channel></rss>"#;

    /// Serves the same document for every URL after an optional delay.
    struct SlowFetcher {
        delay: Duration,
    }

    #[async_trait]
    impl FeedFetcher for SlowFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
            tokio::time::sleep(self.delay).await;
            // One unique link per source so every source inserts an item.
            Ok(FEED
                .replace("https://items.example/1", &format!("{url}#item"))
                .into_bytes())
        }
    }

    struct BrokenCatalog;

    #[async_trait]
    impl SourceCatalog for BrokenCatalog {
        async fn select_due(&self, _n: usize) -> Result<Vec<Source>> {
            Err(RssaggError::Storage("database is locked".into()))
        }

        async fn mark_fetched(&self, _source_id: i64, _at: DateTime<Utc>) -> Result<()> {
            Ok(())
        }
    }

    async fn setup(sources: usize) -> Arc<Database> {
        let db = Database::open_in_memory().await.unwrap();
        let repo = SourceRepository::new(db.pool());
        for n in 0..sources {
            repo.create(&NewSource::new(
                format!("https://feeds.example.com/{n}.xml"),
                format!("Feed {n}"),
            ))
            .await
            .unwrap();
        }
        Arc::new(db)
    }

    fn scheduler(db: &Arc<Database>, concurrency: usize, delay: Duration) -> Scheduler {
        Scheduler::new(
            db.clone(),
            db.clone(),
            Arc::new(SlowFetcher { delay }),
            concurrency,
            Duration::from_millis(50),
        )
    }

    #[tokio::test]
    async fn test_from_config() {
        let db = setup(0).await;
        let config = SchedulerConfig {
            concurrency: 4,
            interval_secs: 30,
            on_catalog_error: CatalogErrorPolicy::Abort,
        };
        let scheduler = Scheduler::from_config(
            db.clone(),
            db.clone(),
            Arc::new(SlowFetcher {
                delay: Duration::ZERO,
            }),
            &config,
        );

        assert_eq!(scheduler.concurrency(), 4);
        assert_eq!(scheduler.interval(), Duration::from_secs(30));
        assert_eq!(scheduler.on_catalog_error, CatalogErrorPolicy::Abort);
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_clamped() {
        let db = setup(0).await;
        assert_eq!(scheduler(&db, 0, Duration::ZERO).concurrency(), 1);
    }

    #[tokio::test]
    async fn test_round_processes_batch() {
        let db = setup(3).await;
        let scheduler = scheduler(&db, 2, Duration::ZERO);

        let handle = scheduler.run_round().await.unwrap();
        assert_eq!(handle.selected(), 2);
        let summary = handle.wait().await;

        assert_eq!(summary.selected, 2);
        assert_eq!(summary.launched, 2);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.inserted, 2);
        assert_eq!(ItemRepository::new(db.pool()).count().await.unwrap(), 2);

        // The third source is now the least recently fetched
        let due = SourceRepository::new(db.pool()).select_due(1).await.unwrap();
        assert_eq!(due[0].name, "Feed 2");
    }

    #[tokio::test]
    async fn test_small_catalog_is_not_an_error() {
        let db = setup(1).await;
        let scheduler = scheduler(&db, 5, Duration::ZERO);

        let summary = scheduler.run_round().await.unwrap().wait().await;
        assert_eq!(summary.selected, 1);
        assert_eq!(summary.completed, 1);
    }

    #[tokio::test]
    async fn test_empty_catalog_round() {
        let db = setup(0).await;
        let scheduler = scheduler(&db, 5, Duration::ZERO);

        let summary = scheduler.run_round().await.unwrap().wait().await;
        assert_eq!(summary, RoundSummary::default());
    }

    #[tokio::test]
    async fn test_overlapping_rounds_share_gate() {
        let db = setup(6).await;
        let scheduler = scheduler(&db, 3, Duration::from_millis(100));

        let first = scheduler.run_round().await.unwrap();
        let second = scheduler.run_round().await.unwrap();
        assert_eq!(scheduler.claimed_sources(), 6);

        // The second round skips the sources still held by the first
        let mut ids: Vec<i64> = first.source_ids().to_vec();
        ids.extend_from_slice(second.source_ids());
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 6);

        let (a, b) = tokio::join!(first.wait(), second.wait());

        assert_eq!(a.launched + b.launched, 6);
        assert!(scheduler.gate().peak() <= 3);
        assert_eq!(scheduler.gate().in_flight(), 0);
        assert_eq!(scheduler.claimed_sources(), 0);
    }

    #[tokio::test]
    async fn test_round_skips_claimed_sources_when_catalog_exhausted() {
        let db = setup(2).await;
        let scheduler = scheduler(&db, 2, Duration::from_millis(100));

        let first = scheduler.run_round().await.unwrap();
        let second = scheduler.run_round().await.unwrap();
        assert_eq!(first.selected(), 2);
        assert_eq!(second.selected(), 0);

        first.wait().await;
        assert_eq!(scheduler.claimed_sources(), 0);

        // Released sources are selectable again
        let third = scheduler.run_round().await.unwrap();
        assert_eq!(third.selected(), 2);
        third.wait().await;
        second.wait().await;
    }

    #[tokio::test]
    async fn test_catalog_error_fails_round() {
        let db = setup(0).await;
        let scheduler = Scheduler::new(
            Arc::new(BrokenCatalog),
            db.clone(),
            Arc::new(SlowFetcher {
                delay: Duration::ZERO,
            }),
            2,
            Duration::from_millis(10),
        );

        let err = scheduler.run_round().await.unwrap_err();
        assert!(err.is_storage());
    }

    #[tokio::test]
    async fn test_run_aborts_on_catalog_error() {
        let db = setup(0).await;
        let scheduler = Scheduler::new(
            Arc::new(BrokenCatalog),
            db.clone(),
            Arc::new(SlowFetcher {
                delay: Duration::ZERO,
            }),
            2,
            Duration::from_millis(10),
        )
        .with_catalog_error_policy(CatalogErrorPolicy::Abort);

        let result = tokio::time::timeout(Duration::from_secs(5), scheduler.run()).await;
        assert!(result.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_run_retries_on_catalog_error() {
        let db = setup(0).await;
        let scheduler = Scheduler::new(
            Arc::new(BrokenCatalog),
            db.clone(),
            Arc::new(SlowFetcher {
                delay: Duration::ZERO,
            }),
            2,
            Duration::from_millis(10),
        );
        let token = scheduler.cancellation_token();
        let handle = scheduler.spawn();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished());

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_shutdown_drains_in_flight_pipelines() {
        let db = setup(2).await;
        let scheduler = scheduler(&db, 2, Duration::from_millis(200));
        let token = scheduler.cancellation_token();
        let handle = scheduler.spawn();

        // Let the first round start its pipelines
        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // Both pipelines ran to completion despite the shutdown
        assert_eq!(ItemRepository::new(db.pool()).count().await.unwrap(), 2);
        let sources = SourceRepository::new(db.pool()).list_all().await.unwrap();
        assert!(sources.iter().all(|s| s.last_fetched_at.is_some()));
    }

    #[tokio::test]
    async fn test_cancel_before_round_launches_nothing() {
        let db = setup(2).await;
        let scheduler = scheduler(&db, 2, Duration::ZERO);
        scheduler.shutdown();
        assert!(scheduler.is_shutting_down());

        let summary = scheduler.run_round().await.unwrap().wait().await;
        assert_eq!(summary.selected, 2);
        assert_eq!(summary.launched, 0);
        assert_eq!(scheduler.claimed_sources(), 0);
        assert_eq!(ItemRepository::new(db.pool()).count().await.unwrap(), 0);
    }
}
