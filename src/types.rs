//! Core types for relay-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Stable identifier of a discovered item, as reported by the item source
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    /// Create a new ItemId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ItemId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ItemId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A discovered listing that may own downloadable artifacts
///
/// Items are created when the source reports them and are never deleted.
/// The only mutation after creation is enrichment (attaching artifacts).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Stable identifier across source calls
    pub id: ItemId,

    /// Human-readable title
    pub title: String,

    /// Canonical source location of the listing
    pub source_url: String,

    /// Free-form labels forwarded with notifications
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Publication time reported by the source, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,

    /// Downloadable files attached to this item
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

impl Item {
    /// Create an item without artifacts
    pub fn new(id: impl Into<ItemId>, title: impl Into<String>, source_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            source_url: source_url.into(),
            tags: Vec::new(),
            published_at: None,
            artifacts: Vec::new(),
        }
    }

    /// Builder-style helper to attach an artifact
    #[must_use]
    pub fn with_artifact(mut self, artifact: Artifact) -> Self {
        self.artifacts.push(artifact);
        self
    }

    /// Builder-style helper to attach tags
    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }
}

/// A single downloadable file belonging to an item
///
/// Identity for deduplication is `fetch_url`, never the local filename.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    /// Where the bytes are fetched from
    pub fetch_url: String,

    /// Filename suggested by the source, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,

    /// Declared size in bytes (informational only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,

    /// Public location after a successful publish
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_url: Option<String>,
}

impl Artifact {
    /// Create an artifact for the given fetch URL
    pub fn new(fetch_url: impl Into<String>) -> Self {
        Self {
            fetch_url: fetch_url.into(),
            file_name: None,
            size: None,
            published_url: None,
        }
    }

    /// Builder-style helper to set the suggested filename
    #[must_use]
    pub fn with_file_name(mut self, name: impl Into<String>) -> Self {
        self.file_name = Some(name.into());
        self
    }

    /// Builder-style helper to set the declared size
    #[must_use]
    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    /// Name used for the local copy and the published file.
    ///
    /// Prefers the source-provided filename, then the last URL path segment,
    /// then the owning item's title.
    pub fn display_name(&self, item_title: &str) -> String {
        if let Some(name) = self.file_name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }

        if let Ok(parsed) = url::Url::parse(&self.fetch_url)
            && let Some(mut segments) = parsed.path_segments()
            && let Some(last) = segments.next_back()
            && !last.is_empty()
        {
            return urlencoding::decode(last)
                .map(|s| s.into_owned())
                .unwrap_or_else(|_| last.to_string());
        }

        item_title.to_string()
    }
}

/// Pipeline stage at which an artifact or item failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    /// Detail lookup for the item failed
    Enrich,
    /// Retrieving bytes failed
    Fetch,
    /// Uploading to the sink failed
    Publish,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureStage::Enrich => "enrich",
            FailureStage::Fetch => "fetch",
            FailureStage::Publish => "publish",
        };
        f.write_str(s)
    }
}

/// Result of pushing one artifact through fetch and publish
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryOutcome {
    /// Bytes are present locally
    pub fetched: bool,
    /// The sink accepted the artifact
    pub published: bool,
    /// Public URL returned by the sink
    pub external_url: Option<String>,
    /// Where and why the artifact stopped, if it did
    pub failure: Option<(FailureStage, String)>,
}

/// Snapshot of the ledger's bookkeeping
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Items ever discovered
    pub total_found: u64,
    /// Artifacts ever delivered (since the last reset)
    pub total_delivered: u64,
    /// Items with at least one undelivered artifact
    pub remaining: u64,
    /// When the last run finished
    pub last_run_at: Option<DateTime<Utc>>,
}

/// Counters for one pipeline run
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Items reported by the source in this run
    pub items_discovered: u64,
    /// Items the ledger had not seen before
    pub new_items: u64,
    /// Artifacts that entered fetch
    pub processed: u64,
    /// Artifacts available locally after fetch
    pub fetched: u64,
    /// Artifacts accepted by the sink
    pub published: u64,
    /// Artifacts skipped because they were already delivered
    pub skipped_already_delivered: u64,
    /// Enrich, fetch and publish failures
    pub errors: u64,
    /// Ledger writes that failed during the run
    pub ledger_write_failures: u64,
    /// Whether the run stopped early on cancellation
    pub cancelled: bool,
}

/// Events emitted by the pipeline
///
/// Subscribe with [`Pipeline::subscribe`](crate::Pipeline::subscribe). Events are
/// informational and never required for correctness.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Discovery finished and the ledger was updated
    Discovered {
        /// Items not seen in earlier runs
        new_items: u64,
        /// Items reported by the source this run
        total_items: u64,
    },

    /// Artifact already delivered; nothing to do
    ArtifactSkipped {
        /// Artifact fetch URL
        fetch_url: String,
    },

    /// Bytes transferred so far for an artifact
    FetchProgress {
        /// Artifact fetch URL
        fetch_url: String,
        /// Bytes written so far
        bytes: u64,
        /// Expected total, when known
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },

    /// Artifact is available locally
    Fetched {
        /// Artifact fetch URL
        fetch_url: String,
        /// Local path of the artifact
        path: PathBuf,
        /// True when a prior run's file was reused
        reused: bool,
    },

    /// Artifact accepted by the sink
    Published {
        /// Artifact fetch URL
        fetch_url: String,
        /// Public URL returned by the sink
        url: String,
    },

    /// Artifact (or item enrichment) failed
    ArtifactFailed {
        /// Artifact fetch URL, or item id for enrichment failures
        fetch_url: String,
        /// Failing stage
        stage: FailureStage,
        /// Error message
        error: String,
    },

    /// A notification could not be delivered
    NotifyFailed {
        /// Error message
        error: String,
    },

    /// The ledger could not be written
    LedgerWriteFailed {
        /// Error message
        error: String,
    },

    /// A run finished (or was cancelled)
    RunComplete(RunSummary),
}
