//! rssagg - periodic feed aggregator
//!
//! Polls registered RSS/Atom sources on a fixed cadence with bounded
//! concurrency and stores every discovered item exactly once.

pub mod config;
pub mod datetime;
pub mod db;
pub mod error;
pub mod feed;
pub mod logging;

pub use config::{CatalogErrorPolicy, Config};
pub use db::Database;
pub use error::{Result, RssaggError};
pub use feed::{
    FeedFetcher, HttpFetcher, Item, ItemSink, NewItem, NewSource, RoundSummary, Scheduler, Source,
    SourceCatalog, UpsertOutcome,
};
