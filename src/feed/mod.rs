//! Feed ingestion core.
//!
//! A [`Scheduler`] periodically selects due sources from a [`SourceCatalog`]
//! and runs one fetch, parse and persist pipeline per source, storing items
//! into an [`ItemSink`] exactly once per link.

pub mod fetcher;
pub mod gate;
pub mod parser;
pub mod pipeline;
pub mod repository;
pub mod scheduler;
pub mod types;

pub use fetcher::{validate_url, FeedFetcher, HttpFetcher};
pub use gate::{ConcurrencyGate, GatePermit};
pub use parser::{parse_feed, strip_html};
pub use pipeline::{run_pipeline, PipelineOutcome, PipelineReport};
pub use repository::{ItemRepository, ItemSink, SourceCatalog, SourceRepository};
pub use scheduler::{RoundHandle, RoundSummary, Scheduler};
pub use types::{
    Batch, FetchResult, Item, NewItem, NewSource, ParsedItem, Source, UpsertOutcome,
    MAX_DESCRIPTION_LENGTH,
};
