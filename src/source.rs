//! Item sources
//!
//! An [`ItemSource`] produces the items a run works on. Discovery returns the
//! listing; enrichment attaches artifacts to a single item when the listing
//! alone does not carry them. Sources own no state the pipeline depends on:
//! a stable `id` per item across calls is the only requirement.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tracing::debug;

use crate::error::DiscoveryError;
use crate::types::{Artifact, Item, ItemId};

/// Produces discovered items and, optionally, their artifacts
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// List the items currently offered by the source
    async fn discover(&self) -> Result<Vec<Item>, DiscoveryError>;

    /// Look up the artifacts of one item.
    ///
    /// The default returns the item unchanged, for sources whose listing
    /// already carries artifacts.
    async fn enrich(&self, item: Item) -> Result<Item, DiscoveryError> {
        Ok(item)
    }

    /// Human-readable name for logging
    fn name(&self) -> &str;
}

/// In-memory source with optional per-item enrichment results
#[derive(Clone, Debug, Default)]
pub struct StaticSource {
    items: Vec<Item>,
    enrichments: HashMap<ItemId, Result<Vec<Artifact>, String>>,
}

impl StaticSource {
    /// Source that always reports `items`
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items,
            enrichments: HashMap::new(),
        }
    }

    /// Artifacts attached when `id` is enriched
    #[must_use]
    pub fn with_enrichment(mut self, id: impl Into<ItemId>, artifacts: Vec<Artifact>) -> Self {
        self.enrichments.insert(id.into(), Ok(artifacts));
        self
    }

    /// Make enrichment of `id` fail with `reason`
    #[must_use]
    pub fn with_failing_enrichment(mut self, id: impl Into<ItemId>, reason: impl Into<String>) -> Self {
        self.enrichments.insert(id.into(), Err(reason.into()));
        self
    }
}

#[async_trait]
impl ItemSource for StaticSource {
    async fn discover(&self) -> Result<Vec<Item>, DiscoveryError> {
        Ok(self.items.clone())
    }

    async fn enrich(&self, mut item: Item) -> Result<Item, DiscoveryError> {
        match self.enrichments.get(&item.id) {
            Some(Ok(artifacts)) => {
                for artifact in artifacts {
                    if !item.artifacts.iter().any(|a| a.fetch_url == artifact.fetch_url) {
                        item.artifacts.push(artifact.clone());
                    }
                }
                Ok(item)
            }
            Some(Err(reason)) => Err(DiscoveryError::Enrich {
                item_id: item.id.to_string(),
                reason: reason.clone(),
            }),
            None => Ok(item),
        }
    }

    fn name(&self) -> &str {
        "static"
    }
}

/// RSS 2.0 or Atom feed whose entries become items.
///
/// Enclosures (RSS) and `rel="enclosure"` links (Atom) become artifacts, so
/// the default no-op enrichment is used.
#[derive(Clone, Debug)]
pub struct FeedSource {
    url: String,
    client: reqwest::Client,
}

impl FeedSource {
    /// Source reading the feed at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Source using a preconfigured HTTP client
    pub fn with_client(url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            url: url.into(),
            client,
        }
    }

    /// Feed URL
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Parse feed content, trying RSS first and Atom second
    pub fn parse(&self, content: &str) -> Result<Vec<Item>, DiscoveryError> {
        match parse_rss(content) {
            Ok(items) => {
                debug!(count = items.len(), "parsed feed as RSS");
                Ok(items)
            }
            Err(rss_err) => {
                debug!(error = %rss_err, "not an RSS feed, trying Atom");
                match parse_atom(content) {
                    Ok(items) => {
                        debug!(count = items.len(), "parsed feed as Atom");
                        Ok(items)
                    }
                    Err(atom_err) => Err(DiscoveryError::Parse {
                        origin: self.url.clone(),
                        reason: format!("RSS error: {rss_err}. Atom error: {atom_err}"),
                    }),
                }
            }
        }
    }
}

#[async_trait]
impl ItemSource for FeedSource {
    async fn discover(&self) -> Result<Vec<Item>, DiscoveryError> {
        debug!(url = %self.url, "checking feed");

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| DiscoveryError::Unavailable(format!("failed to fetch {}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Unavailable(format!(
                "{} returned HTTP {}",
                self.url,
                status.as_u16()
            )));
        }

        let content = response
            .text()
            .await
            .map_err(|e| DiscoveryError::Unavailable(format!("failed to read {}: {}", self.url, e)))?;

        self.parse(&content)
    }

    fn name(&self) -> &str {
        &self.url
    }
}

fn parse_rss(content: &str) -> Result<Vec<Item>, rss::Error> {
    let channel = content.parse::<rss::Channel>()?;

    let items = channel
        .items()
        .iter()
        .filter_map(|entry| {
            // guid, then link, then title
            let id = entry
                .guid()
                .map(|g| g.value().to_string())
                .or_else(|| entry.link().map(str::to_string))
                .or_else(|| entry.title().map(str::to_string))?;

            let title = entry.title().unwrap_or(id.as_str()).to_string();
            let source_url = entry.link().unwrap_or(id.as_str()).to_string();

            let mut item = Item::new(id.as_str(), title, source_url)
                .with_tags(entry.categories().iter().map(|c| c.name().to_string()));
            item.published_at = entry
                .pub_date()
                .and_then(|date| chrono::DateTime::parse_from_rfc2822(date).ok())
                .map(|dt| dt.with_timezone(&Utc));

            if let Some(enclosure) = entry.enclosure() {
                let mut artifact = Artifact::new(enclosure.url());
                if let Ok(size) = enclosure.length().parse::<u64>()
                    && size > 0
                {
                    artifact = artifact.with_size(size);
                }
                item = item.with_artifact(artifact);
            }

            Some(item)
        })
        .collect();

    Ok(items)
}

fn parse_atom(content: &str) -> Result<Vec<Item>, atom_syndication::Error> {
    let feed = atom_syndication::Feed::read_from(content.as_bytes())?;

    let items = feed
        .entries()
        .iter()
        .map(|entry| {
            let id = entry.id().to_string();
            let source_url = entry
                .links()
                .iter()
                .find(|link| link.rel() == "alternate")
                .or_else(|| entry.links().first())
                .map(|link| link.href().to_string())
                .unwrap_or_else(|| id.clone());

            let mut item = Item::new(id.as_str(), entry.title().as_str(), source_url)
                .with_tags(entry.categories().iter().map(|c| c.term().to_string()));
            item.published_at = Some(entry.published().unwrap_or(entry.updated()).with_timezone(&Utc));

            for link in entry.links().iter().filter(|link| link.rel() == "enclosure") {
                let mut artifact = Artifact::new(link.href());
                if let Some(size) = link.length().and_then(|l| l.parse::<u64>().ok()) {
                    artifact = artifact.with_size(size);
                }
                item = item.with_artifact(artifact);
            }

            item
        })
        .collect();

    Ok(items)
}
