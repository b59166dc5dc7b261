//! Test environment: mock origin, mock sink and a scratch directory

use std::time::Duration;
use tempfile::TempDir;
use relay_dl::{Config, Pipeline};
use wiremock::MockServer;

/// Everything one pipeline test needs
pub struct TestEnv {
    /// Serves artifact bytes
    pub origin: MockServer,
    /// Accepts uploads
    pub sink: MockServer,
    /// Holds the ledger and the output directory
    pub dir: TempDir,
}

impl TestEnv {
    /// Start both mock servers in a fresh scratch directory
    pub async fn start() -> Self {
        Self {
            origin: MockServer::start().await,
            sink: MockServer::start().await,
            dir: TempDir::new().expect("failed to create temp dir"),
        }
    }

    /// Configuration pointing at the mocks, with millisecond retry delays
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        config.fetch.output_dir = self.dir.path().join("downloads");
        config.fetch.retry_attempts = 1;
        config.fetch.retry_delay = Duration::from_millis(1);
        config.fetch.timeout = Duration::from_secs(5);
        config.publish.endpoint = format!("{}/upload", self.sink.uri());
        config.publish.max_retries = 3;
        config.publish.base_delay = Duration::from_millis(1);
        config.publish.delay_increment = Duration::from_millis(1);
        config.publish.timeout = Duration::from_secs(5);
        config.persistence.ledger_path = self.dir.path().join("ledger.json");
        config
    }

    /// Open a pipeline with [`TestEnv::config`]
    pub async fn pipeline(&self) -> Pipeline {
        self.pipeline_with(self.config()).await
    }

    /// Open a pipeline with a customized configuration
    pub async fn pipeline_with(&self, config: Config) -> Pipeline {
        Pipeline::open(config).await.expect("failed to open pipeline")
    }

    /// Fetch URL of an artifact served by the origin
    pub fn artifact_url(&self, name: &str) -> String {
        format!("{}/files/{}", self.origin.uri(), name)
    }

    /// Raw ledger document as JSON
    pub async fn ledger_json(&self) -> serde_json::Value {
        let raw = tokio::fs::read(self.dir.path().join("ledger.json"))
            .await
            .expect("ledger file should exist");
        serde_json::from_slice(&raw).expect("ledger file should be valid JSON")
    }
}
