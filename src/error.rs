//! Error types for relay-dl
//!
//! This module provides the error taxonomy for the pipeline:
//! - Stage-specific error types (Discovery, Fetch, Publish, Ledger, Notify)
//! - [`PublishError::is_permanent`], used to classify publish failures
//! - A top-level [`Error`] used by the public API
//!
//! Only [`Error::Discovery`] aborts a run. Every other stage error is caught at
//! the artifact boundary and counted in the run summary.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for relay-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for relay-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "fetch.concurrency")
        key: Option<String>,
    },

    /// The item source could not produce a listing; the run cannot proceed
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// Artifact fetch failed
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Artifact publish failed
    #[error("publish error: {0}")]
    Publish(#[from] PublishError),

    /// Ledger persistence failed
    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Notification delivery failed
    #[error("notify error: {0}")]
    Notify(#[from] NotifyError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Item source errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The source could not be reached or refused the request
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The source answered with content that could not be parsed
    #[error("failed to parse listing from {origin}: {reason}")]
    Parse {
        /// Where the listing came from (URL or label)
        origin: String,
        /// Parser error description
        reason: String,
    },

    /// Detail lookup for a single item failed
    #[error("failed to enrich item {item_id}: {reason}")]
    Enrich {
        /// The item whose detail lookup failed
        item_id: String,
        /// The reason the lookup failed
        reason: String,
    },
}

/// Fetch stage errors
#[derive(Debug, Error)]
pub enum FetchError {
    /// All attempts to retrieve the artifact failed
    #[error("failed to fetch {artifact} after {attempts} attempt(s): {cause}")]
    Failed {
        /// The artifact's fetch URL
        artifact: String,
        /// Number of attempts made
        attempts: u32,
        /// Description of the last failure
        cause: String,
    },

    /// The local destination could not be prepared
    #[error("cannot write to {path}: {reason}")]
    Destination {
        /// The destination path
        path: PathBuf,
        /// The reason the destination is unusable
        reason: String,
    },
}

/// Publish stage errors
#[derive(Debug, Error)]
pub enum PublishError {
    /// The sink rejected the request with a client error (4xx)
    #[error("sink rejected {filename} with status {status}: {body}")]
    Rejected {
        /// Sanitized filename that was uploaded
        filename: String,
        /// HTTP status code returned by the sink
        status: u16,
        /// Response body (truncated)
        body: String,
    },

    /// The sink answered 2xx without a well-formed absolute URL
    #[error("sink returned an invalid URL for {filename}: {body:?}")]
    InvalidResponse {
        /// Sanitized filename that was uploaded
        filename: String,
        /// Response body (truncated)
        body: String,
    },

    /// Transient failures persisted through every attempt
    #[error("giving up on {filename} after {attempts} attempt(s): {last_error}")]
    Exhausted {
        /// Sanitized filename that was uploaded
        filename: String,
        /// Number of attempts made
        attempts: u32,
        /// Description of the last transient failure
        last_error: String,
    },

    /// The local file could not be read
    #[error("cannot read local file {path}: {reason}")]
    LocalFile {
        /// The local file path
        path: PathBuf,
        /// The reason the file could not be read
        reason: String,
    },
}

impl PublishError {
    /// Permanent failures need operator intervention; re-running will not help.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            PublishError::Rejected { .. } | PublishError::InvalidResponse { .. }
        )
    }
}

/// Ledger persistence errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// Writing the ledger document failed; in-memory state is still intact
    #[error("failed to persist ledger to {path}: {source}")]
    Write {
        /// The ledger path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Encoding the ledger document failed
    #[error("failed to encode ledger: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Notification errors. Always logged and swallowed by the orchestrator.
#[derive(Debug, Error)]
pub enum NotifyError {
    /// The request could not be sent
    #[error("failed to send notification to {url}: {reason}")]
    Request {
        /// Webhook URL
        url: String,
        /// Transport error description
        reason: String,
    },

    /// The receiver answered with a non-success status
    #[error("notification to {url} returned status {status}")]
    Status {
        /// Webhook URL
        url: String,
        /// HTTP status code
        status: u16,
    },

    /// The receiver did not answer in time
    #[error("notification to {url} timed out after {timeout:?}")]
    Timeout {
        /// Webhook URL
        url: String,
        /// Configured timeout
        timeout: Duration,
    },
}
