//! # relay-dl
//!
//! Discovery → fetch → publish pipeline with a durable dedup ledger.
//!
//! A run asks an [`ItemSource`] for items, records them in the [`Ledger`],
//! downloads every artifact not yet delivered (bounded concurrency, retry on
//! transient failure), uploads it to an external sink (linear backoff on 5xx,
//! fail fast on 4xx) and announces deliveries through a [`Notifier`].
//!
//! Re-running is always safe: an artifact whose fetch URL is in the ledger's
//! delivered set is never fetched or published again, across restarts.
//!
//! ## Quick Start
//!
//! ```no_run
//! use relay_dl::{Config, FeedSource, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = Config::default();
//!     config.publish.endpoint = "https://sink.example.com/upload".to_string();
//!
//!     let mut pipeline = Pipeline::open(config).await?;
//!
//!     // Subscribe to events
//!     let mut events = pipeline.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let source = FeedSource::new("https://origin.example.com/feed.xml");
//!     let summary = pipeline.run(&source).await?;
//!     println!("{} published, {} errors", summary.published, summary.errors);
//!
//!     pipeline.close().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Error types
pub mod error;
/// Fetch stage
pub mod fetch;
/// Durable dedup ledger
pub mod ledger;
/// Notification sinks
pub mod notify;
/// Minimum-interval pacing
pub mod pacing;
/// Pipeline orchestrator
pub mod pipeline;
/// Publish stage
pub mod publish;
/// Retry loop with classified outcomes
pub mod retry;
/// Sink-safe filename derivation
pub mod sanitize;
/// Item sources
pub mod source;
/// Core types and events
pub mod types;

// Re-export commonly used types
pub use config::{Config, FetchConfig, NotificationConfig, PersistenceConfig, PublishConfig, WebhookConfig, WebhookEvent};
pub use error::{DiscoveryError, Error, FetchError, LedgerError, NotifyError, PublishError, Result};
pub use fetch::{FetchSlot, Fetched, Fetcher};
pub use ledger::Ledger;
pub use notify::{NoOpNotifier, Notifier, NotifyEvent, WebhookNotifier};
pub use pipeline::Pipeline;
pub use publish::{Published, Publisher};
pub use source::{FeedSource, ItemSource, StaticSource};
pub use types::{
    Artifact, DeliveryOutcome, Event, FailureStage, Item, ItemId, LedgerStats, RunSummary,
};

/// Run the pipeline once with graceful signal handling.
///
/// A termination signal cancels the run: artifacts already in flight finish,
/// no new ones start, and the summary comes back with `cancelled` set.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use relay_dl::{Config, FeedSource, Pipeline, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let mut pipeline = Pipeline::open(Config::load("relay.json").await?).await?;
///     let source = FeedSource::new("https://origin.example.com/feed.xml");
///
///     // Run with automatic signal handling
///     let summary = run_with_shutdown(&mut pipeline, &source).await?;
///     println!("cancelled: {}", summary.cancelled);
///     pipeline.close().await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(pipeline: &mut Pipeline, source: &dyn ItemSource) -> Result<RunSummary> {
    let cancel = pipeline.cancel_token();
    let watcher = tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("shutdown requested, finishing in-flight artifacts");
        cancel.cancel();
    });

    let result = pipeline.run(source).await;
    watcher.abort();
    result
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!(signal = "SIGTERM", "signal received"),
                _ = sigint.recv() => tracing::info!(signal = "SIGINT", "signal received"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "SIGINT handler unavailable, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!(signal = "SIGTERM", "signal received");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!(signal = "SIGINT", "signal received");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "no signal handlers available, falling back to ctrl_c");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for Ctrl+C");
        return;
    }
    tracing::info!(signal = "ctrl_c", "signal received");
}
