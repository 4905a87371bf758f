use std::sync::Arc;

use tracing::{error, info, warn};

use rssagg::feed::SourceRepository;
use rssagg::{Config, Database, HttpFetcher, NewSource, Scheduler};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() {
    // Load configuration
    let config_path =
        std::env::var("RSSAGG_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = match Config::load_with_env(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {config_path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = rssagg::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        // Fall back to console-only logging
        rssagg::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = run(config).await {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> rssagg::Result<()> {
    config.validate()?;
    info!("rssagg starting");

    let db = Arc::new(Database::open(&config.database.path).await?);

    let sources = SourceRepository::new(db.pool());
    for seed in &config.sources {
        let name = seed.name.clone().unwrap_or_else(|| seed.url.clone());
        match sources.register(&NewSource::new(&seed.url, name)).await {
            Ok(source) => info!(source_id = source.id, url = %source.url, "Registered source"),
            Err(e) => warn!(url = %seed.url, "Failed to register source: {}", e),
        }
    }
    info!("{} source(s) in catalog", sources.count().await?);

    let fetcher = Arc::new(HttpFetcher::new(&config.fetch)?);
    let scheduler = Scheduler::from_config(db.clone(), db.clone(), fetcher, &config.scheduler);
    let shutdown = scheduler.cancellation_token();
    let mut handle = scheduler.spawn();

    let result = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!("Failed to listen for shutdown signal: {}", e);
            }
            info!("Shutting down, waiting for in-flight pipelines");
            shutdown.cancel();
            (&mut handle).await
        }
        joined = &mut handle => joined,
    };

    db.close().await;
    result.map_err(|e| rssagg::RssaggError::Io(std::io::Error::other(e)))?
}
