//! Assertions over run summaries, events and ledger state

use relay_dl::{Event, Pipeline, RunSummary};
use std::time::Duration;
use tokio::sync::broadcast;

/// Drain events until `RunComplete` (or the timeout)
pub async fn collect_events_until_complete(
    events: &mut broadcast::Receiver<Event>,
    timeout: Duration,
) -> Vec<Event> {
    let mut collected = Vec::new();
    let _ = tokio::time::timeout(timeout, async {
        while let Ok(event) = events.recv().await {
            let done = matches!(event, Event::RunComplete(_));
            collected.push(event);
            if done {
                break;
            }
        }
    })
    .await;
    collected
}

/// Compare the counters that describe artifact handling
#[track_caller]
pub fn assert_counts(summary: &RunSummary, fetched: u64, published: u64, skipped: u64, errors: u64) {
    assert_eq!(
        (
            summary.fetched,
            summary.published,
            summary.skipped_already_delivered,
            summary.errors
        ),
        (fetched, published, skipped, errors),
        "(fetched, published, skipped, errors) mismatch in {summary:?}"
    );
}

/// Every fetch URL is delivered in the pipeline's ledger
#[track_caller]
pub fn assert_delivered(pipeline: &Pipeline, fetch_urls: &[&str]) {
    for url in fetch_urls {
        assert!(pipeline.ledger().is_delivered(url), "{url} should be delivered");
    }
}

/// No fetch URL is delivered in the pipeline's ledger
#[track_caller]
pub fn assert_not_delivered(pipeline: &Pipeline, fetch_urls: &[&str]) {
    for url in fetch_urls {
        assert!(!pipeline.ledger().is_delivered(url), "{url} should not be delivered");
    }
}
