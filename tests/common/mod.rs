//! Test helpers for integration tests.
//!
//! Provides an in-process HTTP server serving fixture feeds, plus in-memory
//! catalog, sink and fetcher doubles.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio::net::TcpListener;

use rssagg::{
    FeedFetcher, ItemSink, NewItem, Result, RssaggError, Source, SourceCatalog, UpsertOutcome,
};

/// Default timeout for test operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build an RSS 2.0 document with one item per link.
pub fn rss_feed(title: &str, links: &[&str]) -> String {
    let items: String = links
        .iter()
        .enumerate()
        .map(|(i, link)| {
            format!(
                "<item><title>{title} #{i}</title><link>{link}</link>\
                 <description>&lt;p&gt;Entry {i}&lt;/p&gt;</description>\
                 <pubDate>Mon, 15 Jan 2024 10:30:00 +0000</pubDate></item>"
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0"><channel><title>{title}</title><link>https://example.com/</link>{items}</channel></rss>"#
    )
}

/// A canned HTTP response.
#[derive(Clone)]
struct Fixture {
    status: StatusCode,
    body: String,
}

#[derive(Clone, Default)]
struct ServerState {
    fixtures: Arc<Mutex<HashMap<String, Fixture>>>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    streamed: Arc<AtomicUsize>,
}

/// Size of each chunk sent by the `/stream/{chunks}` route.
pub const STREAM_CHUNK_SIZE: usize = 4096;

/// In-process HTTP server serving fixture feeds at `/feeds/{name}` and
/// chunked bodies with no `Content-Length` at `/stream/{chunks}`.
pub struct FeedServer {
    addr: SocketAddr,
    state: ServerState,
}

impl FeedServer {
    /// Start a server on an ephemeral port.
    pub async fn start() -> Self {
        let state = ServerState::default();
        let app = Router::new()
            .route("/feeds/:name", get(serve_fixture))
            .route("/stream/:chunks", get(serve_stream))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// Serve `body` with 200 at `/feeds/{name}`.
    pub fn serve(&self, name: &str, body: impl Into<String>) {
        self.serve_status(name, StatusCode::OK, body);
    }

    /// Serve `body` with an arbitrary status at `/feeds/{name}`.
    pub fn serve_status(&self, name: &str, status: StatusCode, body: impl Into<String>) {
        self.state.fixtures.lock().unwrap().insert(
            name.to_string(),
            Fixture {
                status,
                body: body.into(),
            },
        );
    }

    /// Absolute URL for a fixture.
    pub fn url(&self, name: &str) -> String {
        format!("http://{}/feeds/{}", self.addr, name)
    }

    /// URL of a chunked body made of `chunks` pieces of [`STREAM_CHUNK_SIZE`].
    pub fn stream_url(&self, chunks: usize) -> String {
        format!("http://{}/stream/{}", self.addr, chunks)
    }

    /// Bytes the client has pulled from streamed bodies so far.
    pub fn streamed_bytes(&self) -> usize {
        self.state.streamed.load(Ordering::SeqCst)
    }

    /// Number of requests received for a fixture.
    pub fn hits(&self, name: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

async fn serve_fixture(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> (StatusCode, String) {
    *state.hits.lock().unwrap().entry(name.clone()).or_default() += 1;
    let fixture = state.fixtures.lock().unwrap().get(&name).cloned();
    match fixture {
        Some(f) => (f.status, f.body),
        None => (StatusCode::NOT_FOUND, "not found".to_string()),
    }
}

async fn serve_stream(State(state): State<ServerState>, Path(chunks): Path<usize>) -> Body {
    let streamed = state.streamed.clone();
    // Lazy: each chunk is produced only when the connection asks for it
    let stream = futures::stream::iter(0..chunks).map(move |_| {
        streamed.fetch_add(STREAM_CHUNK_SIZE, Ordering::SeqCst);
        Ok::<_, std::io::Error>(Bytes::from(vec![b'x'; STREAM_CHUNK_SIZE]))
    });
    Body::from_stream(stream)
}

/// In-memory catalog with the same ordering rules as the database.
#[derive(Default)]
pub struct MemoryCatalog {
    sources: Mutex<Vec<Source>>,
    attempts: Mutex<Vec<i64>>,
}

impl MemoryCatalog {
    /// Catalog with `n` never-fetched sources at `https://feeds.test/{id}`.
    pub fn with_sources(n: i64) -> Self {
        let sources = (1..=n)
            .map(|id| Source {
                id,
                url: format!("https://feeds.test/{id}"),
                name: format!("Feed {id}"),
                last_fetched_at: None,
            })
            .collect();
        Self {
            sources: Mutex::new(sources),
            attempts: Mutex::new(Vec::new()),
        }
    }

    /// Source IDs in the order `mark_fetched` was called.
    pub fn attempts(&self) -> Vec<i64> {
        self.attempts.lock().unwrap().clone()
    }

    /// Snapshot of one source.
    pub fn source(&self, id: i64) -> Option<Source> {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
    }
}

#[async_trait]
impl SourceCatalog for MemoryCatalog {
    async fn select_due(&self, n: usize) -> Result<Vec<Source>> {
        let mut sources = self.sources.lock().unwrap().clone();
        // None sorts before Some, matching NULLS FIRST
        sources.sort_by_key(|s| (s.last_fetched_at, s.id));
        sources.truncate(n);
        Ok(sources)
    }

    async fn mark_fetched(&self, source_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut sources = self.sources.lock().unwrap();
        let source = sources
            .iter_mut()
            .find(|s| s.id == source_id)
            .ok_or_else(|| RssaggError::NotFound(format!("source {source_id}")))?;
        source.last_fetched_at = Some(at);
        self.attempts.lock().unwrap().push(source_id);
        Ok(())
    }
}

/// In-memory sink keyed by link.
#[derive(Default)]
pub struct MemorySink {
    items: Mutex<HashMap<String, NewItem>>,
}

impl MemorySink {
    /// Number of stored items.
    pub fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    /// Stored items owned by a source.
    pub fn count_by_source(&self, source_id: i64) -> usize {
        self.items
            .lock()
            .unwrap()
            .values()
            .filter(|i| i.source_id == source_id)
            .count()
    }

    /// Whether a link is stored.
    pub fn contains(&self, link: &str) -> bool {
        self.items.lock().unwrap().contains_key(link)
    }
}

#[async_trait]
impl ItemSink for MemorySink {
    async fn upsert_item(&self, item: &NewItem) -> Result<UpsertOutcome> {
        let mut items = self.items.lock().unwrap();
        if items.contains_key(&item.link) {
            return Ok(UpsertOutcome::Duplicate);
        }
        items.insert(item.link.clone(), item.clone());
        Ok(UpsertOutcome::Inserted(items.len() as i64))
    }
}

/// Fetcher that serves a generated feed per URL, optionally failing some
/// URLs, and records how many fetches overlap.
pub struct ScriptedFetcher {
    delay: Duration,
    failing: Vec<String>,
    active: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    /// Succeed for every URL after `delay`.
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            failing: Vec::new(),
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    /// Return a transport error for `url`.
    pub fn failing(mut self, url: impl Into<String>) -> Self {
        self.failing.push(url.into());
        self
    }

    /// Highest number of overlapping fetches observed.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Total fetches.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FeedFetcher for ScriptedFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.iter().any(|f| f == url) {
            return Err(RssaggError::Transport("connection refused".into()));
        }
        let link = format!("{url}/item");
        Ok(rss_feed(url, &[&link]).into_bytes())
    }
}
