//! Pipeline orchestrator
//!
//! A run sequences source → ledger → fetch → publish → notify:
//!
//! 1. Discover items and merge them into the ledger.
//! 2. Enrich items that are stored without artifacts.
//! 3. Skip artifacts whose fetch URL is already delivered.
//! 4. Fetch and publish the rest, with at most `fetch.concurrency` fetches at a time.
//! 5. Record each delivery in the ledger, then notify (best effort).
//!
//! Only a discovery failure aborts a run. Every other failure is confined to
//! its artifact and counted in the [`RunSummary`].
//!
//! The pipeline owns the ledger; delivery tasks never write it. Completions
//! are funneled back here and applied one at a time.

use chrono::Utc;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{Error, LedgerError, Result};
use crate::fetch::{FetchSlot, Fetcher, local_path_for};
use crate::ledger::Ledger;
use crate::notify::{NoOpNotifier, Notifier, NotifyEvent, WebhookNotifier};
use crate::publish::Publisher;
use crate::source::ItemSource;
use crate::types::{Artifact, DeliveryOutcome, Event, FailureStage, ItemId, LedgerStats, RunSummary};

/// Capacity of the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// One artifact scheduled for delivery, with the item context it needs
struct WorkUnit {
    item_id: ItemId,
    title: String,
    tags: Vec<String>,
    artifact: Artifact,
}

/// What woke the delivery loop
enum Step {
    Admitted(Option<FetchSlot>),
    Completed(std::result::Result<(WorkUnit, DeliveryOutcome), tokio::task::JoinError>),
    Cancelled,
}

/// The stateless half of the pipeline, shared with delivery tasks
struct Stages {
    fetcher: Fetcher,
    publisher: Publisher,
    output_dir: PathBuf,
    event_tx: broadcast::Sender<Event>,
}

impl Stages {
    /// Fetch then publish one artifact. Never touches the ledger.
    ///
    /// The fetch slot is given back as soon as the fetch ends, so publish
    /// retries never hold up other fetches.
    async fn deliver(&self, unit: &WorkUnit, slot: FetchSlot) -> DeliveryOutcome {
        let mut outcome = DeliveryOutcome::default();
        let destination = local_path_for(&self.output_dir, &unit.artifact, &unit.title);

        let fetched = match self.fetcher.fetch_with_slot(slot, &unit.artifact, &destination).await {
            Ok(fetched) => fetched,
            Err(e) => {
                outcome.failure = Some((FailureStage::Fetch, e.to_string()));
                return outcome;
            }
        };
        outcome.fetched = true;
        self.event_tx
            .send(Event::Fetched {
                fetch_url: unit.artifact.fetch_url.clone(),
                path: fetched.path.clone(),
                reused: fetched.reused,
            })
            .ok();

        let name = unit.artifact.display_name(&unit.title);
        match self.publisher.publish(&fetched.path, &name).await {
            Ok(published) => {
                outcome.published = true;
                outcome.external_url = Some(published.url);
            }
            Err(e) => {
                // The local copy stays so a later run can retry the publish
                if e.is_permanent() {
                    debug!(fetch_url = %unit.artifact.fetch_url, "sink refused the artifact, re-running will not help");
                }
                outcome.failure = Some((FailureStage::Publish, e.to_string()));
            }
        }
        outcome
    }
}

/// Discovery → fetch → publish pipeline with a durable dedup ledger
///
/// # Example
///
/// ```no_run
/// use relay_dl::{Config, Pipeline, StaticSource};
///
/// # async fn example() -> relay_dl::Result<()> {
/// let mut config = Config::default();
/// config.publish.endpoint = "https://sink.example.com/upload".to_string();
///
/// let mut pipeline = Pipeline::open(config).await?;
/// let summary = pipeline.run(&StaticSource::new(vec![])).await?;
/// println!("published {} artifact(s)", summary.published);
/// pipeline.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct Pipeline {
    config: Arc<Config>,
    ledger: Ledger,
    stages: Arc<Stages>,
    notifier: Arc<dyn Notifier>,
    event_tx: broadcast::Sender<Event>,
    cancel: CancellationToken,
}

impl Pipeline {
    /// Validate configuration, prepare the output directory and load the ledger
    pub async fn open(config: Config) -> Result<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.fetch.output_dir)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create output directory '{}': {}",
                        config.fetch.output_dir.display(),
                        e
                    ),
                ))
            })?;

        let ledger = Ledger::load(&config.persistence.ledger_path).await;

        // Buffered so slow subscribers lag instead of blocking delivery
        let (event_tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let fetcher = Fetcher::new(&config.fetch)?.with_events(event_tx.clone());
        let publisher = Publisher::new(&config.publish)?;

        let notifier: Arc<dyn Notifier> = if config.notifications.webhooks.is_empty() {
            Arc::new(NoOpNotifier)
        } else {
            Arc::new(WebhookNotifier::new(config.notifications.webhooks.clone()))
        };

        let stages = Arc::new(Stages {
            fetcher,
            publisher,
            output_dir: config.fetch.output_dir.clone(),
            event_tx: event_tx.clone(),
        });

        info!(
            ledger = %config.persistence.ledger_path.display(),
            output_dir = %config.fetch.output_dir.display(),
            concurrency = config.fetch.concurrency,
            notifier = notifier.name(),
            "pipeline opened"
        );

        Ok(Self {
            config: Arc::new(config),
            ledger,
            stages,
            notifier,
            event_tx,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the notifier chosen from configuration
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Subscribe to pipeline events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Token that stops the current (and any later) run at the next artifact boundary
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current configuration
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// Read access to the ledger
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Write access to the ledger, e.g. for [`Ledger::reset`]
    pub fn ledger_mut(&mut self) -> &mut Ledger {
        &mut self.ledger
    }

    /// Ledger counters
    pub fn stats(&self) -> LedgerStats {
        self.ledger.stats()
    }

    /// Run the pipeline once against `source`.
    ///
    /// Returns `Err` only when discovery fails. Per-artifact failures are
    /// counted in the summary.
    pub async fn run(&mut self, source: &dyn ItemSource) -> Result<RunSummary> {
        info!(source = source.name(), "pipeline run started");
        let mut summary = RunSummary::default();

        let items = match source.discover().await {
            Ok(items) => items,
            Err(e) => {
                error!(source = source.name(), error = %e, "discovery failed, aborting run");
                return Err(e.into());
            }
        };
        summary.items_discovered = items.len() as u64;

        let known_before = self.ledger.total_found();
        if let Err(e) = self.ledger.record_discovered(&items).await {
            self.ledger_write_failed(&mut summary, &e);
        }
        summary.new_items = self.ledger.total_found().saturating_sub(known_before);
        self.emit(Event::Discovered {
            new_items: summary.new_items,
            total_items: summary.items_discovered,
        });
        debug!(
            discovered = summary.items_discovered,
            new = summary.new_items,
            "discovery merged into ledger"
        );

        let mut seen = HashSet::new();
        let ids: Vec<ItemId> = items
            .into_iter()
            .map(|item| item.id)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        self.enrich(source, &ids, &mut summary).await;
        let work = self.plan(&ids, &mut summary);
        self.deliver_all(work, &mut summary).await;

        summary.cancelled = self.cancel.is_cancelled();

        if let Err(e) = self.ledger.finish_run(Utc::now()).await {
            self.ledger_write_failed(&mut summary, &e);
        }

        self.notify(NotifyEvent::RunSummary {
            total_found: self.ledger.total_found(),
            fetched: summary.fetched,
            published: summary.published,
            errors: summary.errors,
        })
        .await;

        info!(
            discovered = summary.items_discovered,
            new = summary.new_items,
            processed = summary.processed,
            fetched = summary.fetched,
            published = summary.published,
            skipped = summary.skipped_already_delivered,
            errors = summary.errors,
            cancelled = summary.cancelled,
            "pipeline run complete"
        );
        self.emit(Event::RunComplete(summary.clone()));

        Ok(summary)
    }

    /// Persist the ledger one last time
    pub async fn close(self) -> Result<()> {
        self.ledger.flush().await?;
        info!(path = %self.ledger.path().display(), "pipeline closed");
        Ok(())
    }

    /// Ask the source for artifacts of items stored without any
    async fn enrich(&mut self, source: &dyn ItemSource, ids: &[ItemId], summary: &mut RunSummary) {
        for id in ids {
            if self.cancel.is_cancelled() {
                return;
            }

            let Some(stored) = self.ledger.get(id) else {
                continue;
            };
            if !stored.artifacts.is_empty() {
                continue;
            }

            match source.enrich(stored.clone()).await {
                Ok(enriched) => match self.ledger.record_enrichment(id, enriched.artifacts).await {
                    Ok(added) => debug!(item_id = %id, added, "item enriched"),
                    Err(e) => self.ledger_write_failed(summary, &e),
                },
                Err(e) => {
                    summary.errors += 1;
                    warn!(item_id = %id, error = %e, "enrichment failed");
                    self.emit(Event::ArtifactFailed {
                        fetch_url: id.to_string(),
                        stage: FailureStage::Enrich,
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    /// Artifacts of this run's items that still need delivery, in discovery order
    fn plan(&self, ids: &[ItemId], summary: &mut RunSummary) -> Vec<WorkUnit> {
        let mut seen_urls = HashSet::new();
        let mut work = Vec::new();

        for item in ids.iter().filter_map(|id| self.ledger.get(id)) {
            for artifact in &item.artifacts {
                if !seen_urls.insert(artifact.fetch_url.as_str()) {
                    debug!(fetch_url = %artifact.fetch_url, "artifact listed twice in this run");
                    summary.skipped_already_delivered += 1;
                    continue;
                }

                if self.ledger.is_delivered(&artifact.fetch_url) {
                    debug!(fetch_url = %artifact.fetch_url, "already delivered, skipping");
                    summary.skipped_already_delivered += 1;
                    self.emit(Event::ArtifactSkipped {
                        fetch_url: artifact.fetch_url.clone(),
                    });
                    continue;
                }

                work.push(WorkUnit {
                    item_id: item.id.clone(),
                    title: item.title.clone(),
                    tags: item.tags.clone(),
                    artifact: artifact.clone(),
                });
            }
        }

        work
    }

    /// Admit artifacts in order as fetch slots free up and apply completions as they land.
    ///
    /// Only fetches are bounded; an artifact that is publishing holds no slot.
    async fn deliver_all(&mut self, work: Vec<WorkUnit>, summary: &mut RunSummary) {
        let fetcher = self.stages.fetcher.clone();
        let cancel = self.cancel.clone();
        let mut queue = work.into_iter();
        let mut in_flight = FuturesUnordered::new();
        let mut limiter_open = true;

        loop {
            let admitting = limiter_open && queue.len() > 0 && !cancel.is_cancelled();
            if !admitting && in_flight.is_empty() {
                break;
            }

            let step = tokio::select! {
                biased;
                Some(joined) = in_flight.next(), if !in_flight.is_empty() => Step::Completed(joined),
                _ = cancel.cancelled(), if admitting => Step::Cancelled,
                slot = fetcher.reserve(), if admitting => Step::Admitted(slot),
            };

            match step {
                Step::Completed(Ok((unit, outcome))) => self.complete(unit, outcome, summary).await,
                Step::Completed(Err(e)) => {
                    summary.errors += 1;
                    error!(error = %e, "delivery task failed");
                }
                Step::Cancelled => debug!("cancellation requested, no new artifacts will start"),
                Step::Admitted(None) => {
                    error!("fetch limiter closed, no new artifacts will start");
                    limiter_open = false;
                }
                Step::Admitted(Some(slot)) => {
                    // Checked again once the slot is ours; started artifacts finish
                    if cancel.is_cancelled() {
                        continue;
                    }
                    let Some(unit) = queue.next() else {
                        continue;
                    };
                    summary.processed += 1;
                    let stages = Arc::clone(&self.stages);
                    in_flight.push(tokio::spawn(async move {
                        let outcome = stages.deliver(&unit, slot).await;
                        (unit, outcome)
                    }));
                }
            }
        }

        if queue.len() > 0 {
            info!(remaining = queue.len(), "run cancelled, remaining artifacts left for next run");
        }
    }

    /// Apply one delivery outcome: counters, ledger mark, cleanup, notify
    async fn complete(&mut self, unit: WorkUnit, outcome: DeliveryOutcome, summary: &mut RunSummary) {
        if outcome.fetched {
            summary.fetched += 1;
        }

        if let Some((stage, error)) = outcome.failure {
            summary.errors += 1;
            warn!(
                item_id = %unit.item_id,
                fetch_url = %unit.artifact.fetch_url,
                %stage,
                error = %error,
                "artifact failed"
            );
            self.emit(Event::ArtifactFailed {
                fetch_url: unit.artifact.fetch_url,
                stage,
                error,
            });
            return;
        }

        let Some(url) = outcome.external_url else {
            return;
        };
        summary.published += 1;

        // The delivered mark is persisted before anything else observes the delivery
        if let Err(e) = self.ledger.record_published(&unit.artifact.fetch_url, &url).await {
            self.ledger_write_failed(summary, &e);
        }
        info!(item_id = %unit.item_id, fetch_url = %unit.artifact.fetch_url, %url, "artifact delivered");
        self.emit(Event::Published {
            fetch_url: unit.artifact.fetch_url.clone(),
            url: url.clone(),
        });

        if self.config.publish.delete_after_publish {
            let path = local_path_for(&self.config.fetch.output_dir, &unit.artifact, &unit.title);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!(path = %path.display(), error = %e, "failed to remove published file");
            }
        }

        self.notify(NotifyEvent::Published {
            item_id: unit.item_id,
            title: unit.title,
            external_url: url,
            tags: unit.tags,
        })
        .await;
    }

    /// Best-effort notification; failures are logged and reported as events
    async fn notify(&self, event: NotifyEvent) {
        if let Err(e) = self.notifier.notify(&event).await {
            warn!(notifier = self.notifier.name(), error = %e, "notification failed");
            self.emit(Event::NotifyFailed { error: e.to_string() });
        }
    }

    fn ledger_write_failed(&self, summary: &mut RunSummary, e: &LedgerError) {
        summary.ledger_write_failures += 1;
        warn!(error = %e, "ledger write failed, continuing with in-memory state");
        self.emit(Event::LedgerWriteFailed { error: e.to_string() });
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine
        self.event_tx.send(event).ok();
    }
}
