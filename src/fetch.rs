//! Fetch stage: stream an artifact's bytes to local storage
//!
//! - Concurrency is bounded by a semaphore; tokio's semaphore is fair, so
//!   waiting fetches are admitted in submission order. A caller can
//!   [`Fetcher::reserve`] a slot up front and pass it to
//!   [`Fetcher::fetch_with_slot`]; the slot frees when that fetch ends.
//! - A non-empty file already at the destination is treated as fetched (a prior
//!   run finished the download but not the publish).
//! - Bytes stream into `<destination>.part`, which is renamed into place only
//!   after the body is complete. A failed attempt deletes the partial file.
//! - Every network failure (transport error, timeout, non-2xx, truncated body)
//!   is retried with a fixed delay; local write errors are not.
//!
//! The fetch stage never touches the ledger.

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast};

use crate::config::FetchConfig;
use crate::error::{Error, FetchError, Result};
use crate::pacing::Pacer;
use crate::retry::{AttemptOutcome, RetryPolicy, run_with_retry};
use crate::sanitize::sanitize_component;
use crate::types::{Artifact, Event};

/// Emit a progress event every this many bytes
const PROGRESS_STEP_BYTES: u64 = 1024 * 1024;

/// A successfully fetched artifact
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fetched {
    /// Final local path
    pub path: PathBuf,
    /// Size of the local file
    pub bytes: u64,
    /// True when an existing file was reused without a network call
    pub reused: bool,
}

/// A reserved fetch slot, released on drop
#[derive(Debug)]
pub struct FetchSlot {
    _permit: OwnedSemaphorePermit,
}

/// Deterministic local path for an artifact.
///
/// The prefix is derived from the fetch URL so two artifacts with the same
/// display name never share a file, and a re-run finds the same file again.
pub fn local_path_for(output_dir: &Path, artifact: &Artifact, item_title: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(artifact.fetch_url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let prefix = &digest[..16];

    let file_name = match sanitize_component(&artifact.display_name(item_title)) {
        Some(name) => format!("{prefix}-{name}"),
        None => prefix.to_string(),
    };
    output_dir.join(file_name)
}

fn part_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

/// Downloads artifacts with bounded concurrency and retry (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    limiter: Arc<Semaphore>,
    policy: RetryPolicy,
    pacer: Pacer,
    event_tx: Option<broadcast::Sender<Event>>,
}

impl Fetcher {
    /// Create a fetcher from configuration
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            limiter: Arc::new(Semaphore::new(config.concurrency.max(1))),
            policy: config.retry_policy(),
            pacer: Pacer::new(config.min_interval),
            event_tx: None,
        })
    }

    /// Report progress on the given event channel
    #[must_use]
    pub fn with_events(mut self, event_tx: broadcast::Sender<Event>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    /// Wait for a free fetch slot.
    ///
    /// Waiters are admitted in the order they asked. The slot frees when the
    /// returned [`FetchSlot`] drops. `None` only if the limiter was closed.
    pub async fn reserve(&self) -> Option<FetchSlot> {
        Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .ok()
            .map(|permit| FetchSlot { _permit: permit })
    }

    /// Retrieve `artifact` into `destination`, waiting for a slot first
    pub async fn fetch(&self, artifact: &Artifact, destination: &Path) -> std::result::Result<Fetched, FetchError> {
        if let Some(fetched) = reuse_existing(artifact, destination).await {
            return Ok(fetched);
        }

        let slot = self.reserve().await.ok_or_else(|| FetchError::Failed {
            artifact: artifact.fetch_url.clone(),
            attempts: 0,
            cause: "fetch limiter closed".to_string(),
        })?;
        self.fetch_with_slot(slot, artifact, destination).await
    }

    /// Retrieve `artifact` into `destination` using an already reserved slot.
    ///
    /// The slot is released when the fetch finishes, before anything the
    /// caller does next.
    pub async fn fetch_with_slot(
        &self,
        slot: FetchSlot,
        artifact: &Artifact,
        destination: &Path,
    ) -> std::result::Result<Fetched, FetchError> {
        let _slot = slot;
        if let Some(fetched) = reuse_existing(artifact, destination).await {
            return Ok(fetched);
        }

        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FetchError::Destination {
                    path: parent.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }

        let part = part_path(destination);
        let part_ref: &Path = &part;
        let result = run_with_retry(&self.policy, |_| self.attempt(artifact, part_ref)).await;

        match result {
            Ok(bytes) => {
                tokio::fs::rename(&part, destination)
                    .await
                    .map_err(|e| FetchError::Destination {
                        path: destination.to_path_buf(),
                        reason: e.to_string(),
                    })?;
                tracing::info!(
                    fetch_url = %artifact.fetch_url,
                    path = %destination.display(),
                    bytes,
                    "artifact fetched"
                );
                Ok(Fetched {
                    path: destination.to_path_buf(),
                    bytes,
                    reused: false,
                })
            }
            Err(failure) => {
                remove_partial(&part).await;
                Err(FetchError::Failed {
                    artifact: artifact.fetch_url.clone(),
                    attempts: failure.attempts(),
                    cause: failure.into_error(),
                })
            }
        }
    }

    /// One download attempt into `part`
    async fn attempt(&self, artifact: &Artifact, part: &Path) -> AttemptOutcome<u64, String> {
        self.pacer.wait().await;

        let mut response = match self.client.get(&artifact.fetch_url).send().await {
            Ok(response) => response,
            Err(e) => return AttemptOutcome::Transient(describe_request_error(&e)),
        };

        let status = response.status();
        if !status.is_success() {
            return AttemptOutcome::Transient(format!("HTTP {}", status.as_u16()));
        }

        let content_length = response.content_length();
        let expected = content_length.or(artifact.size);

        let mut file = match tokio::fs::File::create(part).await {
            Ok(file) => file,
            Err(e) => {
                return AttemptOutcome::Permanent(format!(
                    "cannot create {}: {}",
                    part.display(),
                    e
                ));
            }
        };

        let mut written: u64 = 0;
        let mut next_report = PROGRESS_STEP_BYTES;

        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = file.write_all(&chunk).await {
                        drop(file);
                        remove_partial(part).await;
                        return AttemptOutcome::Permanent(format!(
                            "cannot write {}: {}",
                            part.display(),
                            e
                        ));
                    }
                    written += chunk.len() as u64;
                    if written >= next_report {
                        self.report_progress(&artifact.fetch_url, written, expected);
                        next_report = written + PROGRESS_STEP_BYTES;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    drop(file);
                    remove_partial(part).await;
                    return AttemptOutcome::Transient(format!(
                        "stream interrupted after {} bytes: {}",
                        written,
                        describe_request_error(&e)
                    ));
                }
            }
        }

        if let Err(e) = file.sync_all().await {
            drop(file);
            remove_partial(part).await;
            return AttemptOutcome::Permanent(format!("cannot sync {}: {}", part.display(), e));
        }
        drop(file);

        // Only the server's Content-Length is binding; the source's declared size is informational
        if let Some(len) = content_length
            && written < len
        {
            remove_partial(part).await;
            return AttemptOutcome::Transient(format!(
                "body truncated: got {} of {} bytes",
                written, len
            ));
        }

        self.report_progress(&artifact.fetch_url, written, expected);
        AttemptOutcome::Success(written)
    }

    fn report_progress(&self, fetch_url: &str, bytes: u64, total: Option<u64>) {
        tracing::trace!(fetch_url, bytes, ?total, "fetch progress");
        if let Some(tx) = &self.event_tx {
            tx.send(Event::FetchProgress {
                fetch_url: fetch_url.to_string(),
                bytes,
                total,
            })
            .ok();
        }
    }
}

fn describe_request_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("timeout: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else {
        e.to_string()
    }
}

/// A non-empty file already at `destination` counts as fetched
async fn reuse_existing(artifact: &Artifact, destination: &Path) -> Option<Fetched> {
    let bytes = existing_file_len(destination).await?;
    tracing::debug!(
        fetch_url = %artifact.fetch_url,
        path = %destination.display(),
        bytes,
        "destination already present, skipping download"
    );
    Some(Fetched {
        path: destination.to_path_buf(),
        bytes,
        reused: true,
    })
}

async fn existing_file_len(path: &Path) -> Option<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Some(meta.len()),
        _ => None,
    }
}

async fn remove_partial(part: &Path) {
    match tokio::fs::remove_file(part).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %part.display(), error = %e, "could not remove partial file"),
    }
}
