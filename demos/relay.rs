//! Relay a feed to an upload sink
//!
//! This demo wires the whole pipeline together:
//! - Loading configuration from a JSON file (or defaults)
//! - Reading items from an RSS/Atom feed
//! - Printing pipeline events as they happen
//! - Stopping cleanly on Ctrl+C / SIGTERM
//!
//! Environment (a `.env` file is read if present):
//! - `RELAY_FEED_URL` - feed to read (required)
//! - `RELAY_CONFIG` - path of a JSON config file (optional)
//! - `RELAY_SINK_ENDPOINT` - overrides `publish.endpoint` (optional)
//! - `RUST_LOG` - log filter, e.g. `relay_dl=debug` (optional)
//!
//! ```bash
//! RELAY_FEED_URL=https://origin.example.com/feed.xml \
//! RELAY_SINK_ENDPOINT=https://sink.example.com/upload \
//! cargo run --example relay
//! ```

use relay_dl::{Config, Event, FeedSource, Pipeline, run_with_shutdown};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("relay_dl=info")))
        .init();

    let feed_url = std::env::var("RELAY_FEED_URL").map_err(|_| "RELAY_FEED_URL not set in environment")?;

    let mut config = match std::env::var("RELAY_CONFIG") {
        Ok(path) => Config::load(&path).await?,
        Err(_) => Config::default(),
    };
    if let Ok(endpoint) = std::env::var("RELAY_SINK_ENDPOINT") {
        config.publish.endpoint = endpoint;
    }

    let mut pipeline = Pipeline::open(config).await?;

    let mut events = pipeline.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::Discovered { new_items, total_items } => {
                    println!("Discovered {} item(s), {} new", total_items, new_items);
                }
                Event::Fetched { fetch_url, reused, .. } => {
                    let how = if reused { "reused" } else { "downloaded" };
                    println!("  {} {}", how, fetch_url);
                }
                Event::Published { fetch_url, url } => {
                    println!("✓ {} -> {}", fetch_url, url);
                }
                Event::ArtifactFailed { fetch_url, stage, error } => {
                    println!("✗ {} failed at {}: {}", fetch_url, stage, error);
                }
                Event::NotifyFailed { error } => {
                    println!("! notification failed: {}", error);
                }
                Event::LedgerWriteFailed { error } => {
                    println!("! ledger not saved: {}", error);
                }
                _ => {}
            }
        }
    });

    let source = FeedSource::new(feed_url);
    let summary = run_with_shutdown(&mut pipeline, &source).await?;

    println!(
        "\nProcessed {} | fetched {} | published {} | skipped {} | errors {}{}",
        summary.processed,
        summary.fetched,
        summary.published,
        summary.skipped_already_delivered,
        summary.errors,
        if summary.cancelled { " | cancelled" } else { "" }
    );

    let stats = pipeline.stats();
    println!(
        "Ledger: {} item(s) known, {} artifact(s) delivered, {} item(s) pending",
        stats.total_found, stats.total_delivered, stats.remaining
    );

    pipeline.close().await?;
    Ok(())
}
