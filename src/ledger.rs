//! Durable ledger of discovered items and delivered artifacts
//!
//! The ledger is a single JSON document:
//!
//! ```json
//! {
//!   "items": [ { "id": "...", "title": "...", "sourceUrl": "...", "artifacts": [...] } ],
//!   "deliveredFetchUrls": [ "https://..." ],
//!   "lastRunAt": "2024-03-09T14:05:07Z",
//!   "totalFound": 12,
//!   "totalDelivered": 9
//! }
//! ```
//!
//! Every mutation rewrites the whole document before returning. The write goes
//! to a sibling temp file which is synced and then renamed over the ledger, so
//! a crash leaves either the old or the new document, never a torn one.
//!
//! A failed write is returned as [`LedgerError`] but the in-memory state keeps
//! the mutation; the caller may continue and the next successful write
//! persists everything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::LedgerError;
use crate::types::{Artifact, Item, ItemId, LedgerStats};

/// On-disk form, owned (for loading)
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerDocument {
    #[serde(default)]
    items: Vec<Item>,
    #[serde(default)]
    delivered_fetch_urls: Vec<String>,
    #[serde(default)]
    last_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    total_found: u64,
    #[serde(default)]
    total_delivered: u64,
}

/// On-disk form, borrowed (for writing)
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LedgerSnapshot<'a> {
    items: &'a [Item],
    delivered_fetch_urls: Vec<&'a str>,
    last_run_at: Option<DateTime<Utc>>,
    total_found: u64,
    total_delivered: u64,
}

/// Persistent record of known items and delivered artifact URLs
///
/// Single-writer: the pipeline owns it for the duration of a run.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    /// Items in discovery order
    items: Vec<Item>,
    /// id -> position in `items`
    index: HashMap<ItemId, usize>,
    delivered: HashSet<String>,
    total_found: u64,
    total_delivered: u64,
    last_run_at: Option<DateTime<Utc>>,
}

impl Ledger {
    /// Create an empty ledger that will persist to `path`
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            items: Vec::new(),
            index: HashMap::new(),
            delivered: HashSet::new(),
            total_found: 0,
            total_delivered: 0,
            last_run_at: None,
        }
    }

    /// Load the ledger stored at `path`.
    ///
    /// A missing file yields an empty ledger. An unreadable or corrupt file is
    /// moved aside (best effort) and also yields an empty ledger; loading never
    /// fails.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();

        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no ledger on disk, starting empty");
                return Self::empty(path);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read ledger, starting empty");
                return Self::empty(path);
            }
        };

        match serde_json::from_slice::<LedgerDocument>(&content) {
            Ok(doc) => {
                let ledger = Self::from_document(path, doc);
                info!(
                    path = %ledger.path.display(),
                    items = ledger.items.len(),
                    delivered = ledger.delivered.len(),
                    "ledger loaded"
                );
                ledger
            }
            Err(e) => {
                let backup = corrupt_backup_path(&path);
                warn!(
                    path = %path.display(),
                    backup = %backup.display(),
                    error = %e,
                    "ledger is corrupt, moving it aside and starting empty"
                );
                if let Err(rename_err) = tokio::fs::rename(&path, &backup).await {
                    warn!(error = %rename_err, "could not move corrupt ledger aside");
                }
                Self::empty(path)
            }
        }
    }

    fn from_document(path: PathBuf, doc: LedgerDocument) -> Self {
        let mut ledger = Self::empty(path);

        for item in doc.items {
            if ledger.index.contains_key(&item.id) {
                continue;
            }
            ledger.index.insert(item.id.clone(), ledger.items.len());
            ledger.items.push(item);
        }
        ledger.delivered = doc.delivered_fetch_urls.into_iter().collect();
        ledger.total_found = doc.total_found.max(ledger.items.len() as u64);
        ledger.total_delivered = doc.total_delivered.max(ledger.delivered.len() as u64);
        ledger.last_run_at = doc.last_run_at;
        ledger
    }

    /// Where the ledger is persisted
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Known items in discovery order
    pub fn items(&self) -> &[Item] {
        &self.items
    }

    /// Look up an item by id
    pub fn get(&self, id: &ItemId) -> Option<&Item> {
        self.index.get(id).map(|&i| &self.items[i])
    }

    /// Items ever discovered
    pub fn total_found(&self) -> u64 {
        self.total_found
    }

    /// Merge discovered items by id and persist.
    ///
    /// Items already known are left untouched, including any artifacts they
    /// gained through enrichment. Returns how many items were new.
    pub async fn record_discovered(&mut self, items: &[Item]) -> Result<u64, LedgerError> {
        let mut added = 0u64;
        for item in items {
            if self.index.contains_key(&item.id) {
                continue;
            }
            self.index.insert(item.id.clone(), self.items.len());
            self.items.push(item.clone());
            added += 1;
        }

        if added > 0 {
            self.total_found += added;
            debug!(added, total = self.items.len(), "recorded discovered items");
            self.flush().await?;
        }
        Ok(added)
    }

    /// Attach artifacts to a known item and persist.
    ///
    /// Only artifacts whose fetch URL is new for that item are added; existing
    /// artifacts are never rewritten. Returns how many were added (0 for an
    /// unknown item).
    pub async fn record_enrichment(
        &mut self,
        id: &ItemId,
        artifacts: Vec<Artifact>,
    ) -> Result<usize, LedgerError> {
        let Some(&pos) = self.index.get(id) else {
            return Ok(0);
        };
        let item = &mut self.items[pos];

        let mut added = 0;
        for artifact in artifacts {
            if item.artifacts.iter().any(|a| a.fetch_url == artifact.fetch_url) {
                continue;
            }
            item.artifacts.push(artifact);
            added += 1;
        }

        if added > 0 {
            debug!(item_id = %id, added, "recorded enrichment");
            self.flush().await?;
        }
        Ok(added)
    }

    /// Whether an artifact with this fetch URL has been delivered
    pub fn is_delivered(&self, fetch_url: &str) -> bool {
        self.delivered.contains(fetch_url)
    }

    /// Number of delivered fetch URLs
    pub fn delivered_count(&self) -> usize {
        self.delivered.len()
    }

    /// Mark an artifact delivered and persist.
    ///
    /// Idempotent: returns `Ok(false)` without writing if already delivered.
    pub async fn mark_delivered(&mut self, fetch_url: &str) -> Result<bool, LedgerError> {
        if !self.insert_delivered(fetch_url) {
            return Ok(false);
        }
        self.flush().await?;
        Ok(true)
    }

    /// Mark an artifact delivered and remember its public URL, in one write.
    ///
    /// Every artifact carrying `fetch_url` gets `published_url`. Returns
    /// whether the delivered set grew.
    pub async fn record_published(
        &mut self,
        fetch_url: &str,
        published_url: &str,
    ) -> Result<bool, LedgerError> {
        let mut changed = false;
        for artifact in self
            .items
            .iter_mut()
            .flat_map(|item| item.artifacts.iter_mut())
            .filter(|a| a.fetch_url == fetch_url)
        {
            if artifact.published_url.as_deref() != Some(published_url) {
                artifact.published_url = Some(published_url.to_string());
                changed = true;
            }
        }

        let newly_delivered = self.insert_delivered(fetch_url);
        if changed || newly_delivered {
            self.flush().await?;
        }
        Ok(newly_delivered)
    }

    fn insert_delivered(&mut self, fetch_url: &str) -> bool {
        if self.delivered.contains(fetch_url) {
            return false;
        }
        self.delivered.insert(fetch_url.to_string());
        self.total_delivered += 1;
        true
    }

    /// Summary counters
    pub fn stats(&self) -> LedgerStats {
        let remaining = self
            .items
            .iter()
            .filter(|item| {
                item.artifacts
                    .iter()
                    .any(|a| !self.delivered.contains(&a.fetch_url))
            })
            .count() as u64;

        LedgerStats {
            total_found: self.total_found,
            total_delivered: self.total_delivered,
            remaining,
            last_run_at: self.last_run_at,
        }
    }

    /// Forget every delivery so artifacts are processed again.
    ///
    /// Discovered items (with their artifacts) are kept.
    pub async fn reset(&mut self) -> Result<(), LedgerError> {
        let cleared = self.delivered.len();
        self.delivered.clear();
        self.total_delivered = 0;
        info!(cleared, "ledger delivered set reset");
        self.flush().await
    }

    /// Stamp the end of a run and persist
    pub async fn finish_run(&mut self, at: DateTime<Utc>) -> Result<(), LedgerError> {
        self.last_run_at = Some(at);
        self.flush().await
    }

    /// Write the whole document atomically (temp file + rename)
    pub async fn flush(&self) -> Result<(), LedgerError> {
        let mut delivered: Vec<&str> = self.delivered.iter().map(String::as_str).collect();
        delivered.sort_unstable();

        let snapshot = LedgerSnapshot {
            items: &self.items,
            delivered_fetch_urls: delivered,
            last_run_at: self.last_run_at,
            total_found: self.total_found,
            total_delivered: self.total_delivered,
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let result = self.write_atomically(&bytes).await;
        if let Err(e) = &result {
            warn!(path = %self.path.display(), error = %e, "ledger write failed");
        }
        result
    }

    async fn write_atomically(&self, bytes: &[u8]) -> Result<(), LedgerError> {
        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let tmp = temp_path(&self.path);
        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        file.write_all(bytes).await.map_err(write_err)?;
        file.sync_all().await.map_err(write_err)?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await.map_err(write_err)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn corrupt_backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(format!(".corrupt-{}", Utc::now().format("%Y%m%d%H%M%S")));
    path.with_file_name(name)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn item(id: &str, artifact_urls: &[&str]) -> Item {
        artifact_urls.iter().fold(
            Item::new(id, format!("Item {id}"), format!("https://site.test/{id}")),
            |item, url| item.with_artifact(Artifact::new(*url)),
        )
    }

    fn ledger_path(dir: &TempDir) -> PathBuf {
        dir.path().join("ledger.json")
    }

    #[tokio::test]
    async fn test_load_missing_file_starts_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(ledger_path(&dir)).await;

        assert!(ledger.items().is_empty());
        assert_eq!(ledger.delivered_count(), 0);
        assert_eq!(ledger.stats().last_run_at, None);
    }

    #[tokio::test]
    async fn test_load_corrupt_file_starts_empty_and_moves_it_aside() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        tokio::fs::write(&path, b"{ not json").await.unwrap();

        let ledger = Ledger::load(&path).await;
        assert!(ledger.items().is_empty());
        assert!(!path.exists(), "corrupt ledger should be moved aside");

        let backups: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
            .collect();
        assert_eq!(backups.len(), 1);
    }

    #[tokio::test]
    async fn test_record_discovered_counts_only_new_items() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(ledger_path(&dir)).await;

        let added = ledger
            .record_discovered(&[item("1", &[]), item("2", &[])])
            .await
            .unwrap();
        assert_eq!(added, 2);

        let added = ledger
            .record_discovered(&[item("2", &[]), item("3", &[])])
            .await
            .unwrap();
        assert_eq!(added, 1);
        assert_eq!(ledger.total_found(), 3);

        let ids: Vec<_> = ledger.items().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"], "discovery order is preserved");
    }

    #[tokio::test]
    async fn test_record_discovered_keeps_prior_enrichment() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(ledger_path(&dir)).await;

        ledger.record_discovered(&[item("1", &[])]).await.unwrap();
        ledger
            .record_enrichment(&ItemId::from("1"), vec![Artifact::new("https://cdn.test/1.zip")])
            .await
            .unwrap();

        // Rediscovered without artifacts and with a new title
        let mut again = item("1", &[]);
        again.title = "Renamed".into();
        ledger.record_discovered(&[again]).await.unwrap();

        let stored = ledger.get(&ItemId::from("1")).unwrap();
        assert_eq!(stored.title, "Item 1");
        assert_eq!(stored.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn test_record_enrichment_skips_known_fetch_urls() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(ledger_path(&dir)).await;
        ledger
            .record_discovered(&[item("1", &["https://cdn.test/a"])])
            .await
            .unwrap();

        let added = ledger
            .record_enrichment(
                &ItemId::from("1"),
                vec![
                    Artifact::new("https://cdn.test/a").with_size(99),
                    Artifact::new("https://cdn.test/b"),
                ],
            )
            .await
            .unwrap();

        assert_eq!(added, 1);
        let stored = ledger.get(&ItemId::from("1")).unwrap();
        assert_eq!(stored.artifacts.len(), 2);
        assert_eq!(stored.artifacts[0].size, None, "existing artifact not rewritten");

        let unknown = ledger
            .record_enrichment(&ItemId::from("nope"), vec![Artifact::new("x")])
            .await
            .unwrap();
        assert_eq!(unknown, 0);
    }

    #[tokio::test]
    async fn test_mark_delivered_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(ledger_path(&dir)).await;

        assert!(!ledger.is_delivered("https://cdn.test/a"));
        assert!(ledger.mark_delivered("https://cdn.test/a").await.unwrap());
        assert!(!ledger.mark_delivered("https://cdn.test/a").await.unwrap());

        assert!(ledger.is_delivered("https://cdn.test/a"));
        assert_eq!(ledger.delivered_count(), 1);
        assert_eq!(ledger.stats().total_delivered, 1);
    }

    #[tokio::test]
    async fn test_delivered_set_survives_reload() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);

        {
            let mut ledger = Ledger::load(&path).await;
            ledger
                .record_discovered(&[item("1", &["https://cdn.test/a", "https://cdn.test/b"])])
                .await
                .unwrap();
            ledger
                .record_published("https://cdn.test/a", "https://sink.test/f/a")
                .await
                .unwrap();
        }

        let ledger = Ledger::load(&path).await;
        assert!(ledger.is_delivered("https://cdn.test/a"));
        assert!(!ledger.is_delivered("https://cdn.test/b"));

        let stored = ledger.get(&ItemId::from("1")).unwrap();
        assert_eq!(
            stored.artifacts[0].published_url.as_deref(),
            Some("https://sink.test/f/a")
        );
        assert_eq!(stored.artifacts[1].published_url, None);
    }

    #[tokio::test]
    async fn test_document_uses_documented_field_names() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        let mut ledger = Ledger::load(&path).await;
        ledger
            .record_discovered(&[item("1", &["https://cdn.test/a"])])
            .await
            .unwrap();
        ledger.mark_delivered("https://cdn.test/a").await.unwrap();
        ledger.finish_run(Utc::now()).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        assert_eq!(raw["deliveredFetchUrls"][0], "https://cdn.test/a");
        assert_eq!(raw["totalFound"], 1);
        assert_eq!(raw["totalDelivered"], 1);
        assert!(raw["lastRunAt"].is_string());
        assert_eq!(raw["items"][0]["artifacts"][0]["fetchUrl"], "https://cdn.test/a");
        assert!(!temp_path(&path).exists(), "temp file is renamed into place");
    }

    #[tokio::test]
    async fn test_stats_counts_items_with_undelivered_artifacts() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::load(ledger_path(&dir)).await;
        ledger
            .record_discovered(&[
                item("1", &["https://cdn.test/a"]),
                item("2", &["https://cdn.test/b", "https://cdn.test/c"]),
                item("3", &[]),
            ])
            .await
            .unwrap();

        assert_eq!(ledger.stats().remaining, 2);

        ledger.mark_delivered("https://cdn.test/a").await.unwrap();
        ledger.mark_delivered("https://cdn.test/b").await.unwrap();
        let stats = ledger.stats();
        assert_eq!(stats.remaining, 1, "item 2 still has c outstanding");
        assert_eq!(stats.total_found, 3);
        assert_eq!(stats.total_delivered, 2);
    }

    #[tokio::test]
    async fn test_reset_clears_deliveries_but_keeps_items() {
        let dir = TempDir::new().unwrap();
        let path = ledger_path(&dir);
        let mut ledger = Ledger::load(&path).await;
        ledger
            .record_discovered(&[item("1", &["https://cdn.test/a"])])
            .await
            .unwrap();
        ledger.mark_delivered("https://cdn.test/a").await.unwrap();

        ledger.reset().await.unwrap();
        assert!(!ledger.is_delivered("https://cdn.test/a"));
        assert_eq!(ledger.items().len(), 1);

        let reloaded = Ledger::load(&path).await;
        assert_eq!(reloaded.delivered_count(), 0);
        assert_eq!(reloaded.stats().total_delivered, 0);
        assert_eq!(reloaded.items().len(), 1);
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_and_memory_is_kept() {
        let dir = TempDir::new().unwrap();
        // Parent "directory" is a regular file, so the ledger can never be written
        let blocker = dir.path().join("blocker");
        tokio::fs::write(&blocker, b"x").await.unwrap();
        let mut ledger = Ledger::load(blocker.join("ledger.json")).await;

        let err = ledger.mark_delivered("https://cdn.test/a").await.unwrap_err();
        assert!(matches!(err, LedgerError::Write { .. }));
        assert!(
            ledger.is_delivered("https://cdn.test/a"),
            "in-memory state must survive a failed write"
        );
    }
}
