//! Publish stage: upload a fetched artifact to the external sink
//!
//! The sink accepts `PUT <endpoint>/<filename>` with the raw bytes and answers:
//!
//! | Response | Classification | Action |
//! |---|---|---|
//! | 2xx + absolute URL body | success | return the URL |
//! | 2xx + anything else | permanent | [`PublishError::InvalidResponse`] |
//! | 4xx | permanent | [`PublishError::Rejected`], no retry |
//! | 5xx, timeout, reset, DNS | transient | retry with linear backoff |
//!
//! When every attempt fails transiently the result is
//! [`PublishError::Exhausted`]. The publish stage never touches the ledger.

use reqwest::header::{AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE};
use std::path::Path;
use tokio_util::io::ReaderStream;

use crate::config::PublishConfig;
use crate::error::{Error, PublishError, Result};
use crate::pacing::Pacer;
use crate::retry::{AttemptOutcome, RetryFailure, RetryPolicy, run_with_retry};
use crate::sanitize::sanitize_filename;

/// Longest response body kept in error messages
const MAX_ERROR_BODY: usize = 512;

/// A successful upload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Published {
    /// Public URL returned by the sink
    pub url: String,
    /// Sanitized filename used for the upload
    pub filename: String,
    /// Attempts it took
    pub attempts: u32,
}

/// Why a single attempt failed
#[derive(Debug)]
enum AttemptError {
    Rejected { status: u16, body: String },
    InvalidResponse { body: String },
    LocalFile(String),
    Transient(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Rejected { status, body } => write!(f, "HTTP {status}: {body}"),
            AttemptError::InvalidResponse { body } => write!(f, "invalid URL in response: {body:?}"),
            AttemptError::LocalFile(reason) => write!(f, "{reason}"),
            AttemptError::Transient(reason) => write!(f, "{reason}"),
        }
    }
}

/// Uploads local files to the sink (cloneable - the HTTP client is Arc-backed)
#[derive(Clone)]
pub struct Publisher {
    client: reqwest::Client,
    endpoint: String,
    auth_header: Option<String>,
    policy: RetryPolicy,
    pacer: Pacer,
}

impl Publisher {
    /// Create a publisher from configuration
    pub fn new(config: &PublishConfig) -> Result<Self> {
        if url::Url::parse(&config.endpoint).is_err() {
            return Err(Error::Config {
                message: format!("publish endpoint '{}' is not a valid URL", config.endpoint),
                key: Some("publish.endpoint".to_string()),
            });
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(Error::Network)?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            auth_header: config.auth_header.clone(),
            policy: config.retry_policy(),
            pacer: Pacer::new(config.min_interval),
        })
    }

    /// Resource location for a sanitized filename
    pub fn upload_url(&self, filename: &str) -> String {
        format!("{}/{}", self.endpoint, urlencoding::encode(filename))
    }

    /// Upload the file at `local_path` under a name derived from `title`
    pub async fn publish(&self, local_path: &Path, title: &str) -> std::result::Result<Published, PublishError> {
        let filename = sanitize_filename(title);

        let len = match tokio::fs::metadata(local_path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(PublishError::LocalFile {
                    path: local_path.to_path_buf(),
                    reason: "not a regular file".to_string(),
                });
            }
            Err(e) => {
                return Err(PublishError::LocalFile {
                    path: local_path.to_path_buf(),
                    reason: e.to_string(),
                });
            }
        };

        let url = self.upload_url(&filename);
        tracing::debug!(path = %local_path.display(), %url, bytes = len, "publishing artifact");

        let url_ref = url.as_str();
        let result = run_with_retry(&self.policy, |index| self.attempt(local_path, url_ref, len, index)).await;

        match result {
            Ok((published_url, attempts)) => {
                tracing::info!(filename = %filename, url = %published_url, attempts, "artifact published");
                Ok(Published {
                    url: published_url,
                    filename,
                    attempts,
                })
            }
            Err(RetryFailure::Permanent { error, .. }) => Err(match error {
                AttemptError::Rejected { status, body } => PublishError::Rejected {
                    filename,
                    status,
                    body,
                },
                AttemptError::InvalidResponse { body } => {
                    PublishError::InvalidResponse { filename, body }
                }
                AttemptError::LocalFile(reason) => PublishError::LocalFile {
                    path: local_path.to_path_buf(),
                    reason,
                },
                AttemptError::Transient(reason) => PublishError::Exhausted {
                    filename,
                    attempts: 1,
                    last_error: reason,
                },
            }),
            Err(RetryFailure::Exhausted {
                last_error,
                attempts,
            }) => Err(PublishError::Exhausted {
                filename,
                attempts,
                last_error: last_error.to_string(),
            }),
        }
    }

    async fn attempt(
        &self,
        local_path: &Path,
        url: &str,
        len: u64,
        index: u32,
    ) -> AttemptOutcome<(String, u32), AttemptError> {
        self.pacer.wait().await;

        // The body stream is consumed by each request, so every attempt reopens the file
        let file = match tokio::fs::File::open(local_path).await {
            Ok(file) => file,
            Err(e) => {
                return AttemptOutcome::Permanent(AttemptError::LocalFile(format!(
                    "cannot open {}: {}",
                    local_path.display(),
                    e
                )));
            }
        };
        let body = reqwest::Body::wrap_stream(ReaderStream::new(file));

        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, len)
            .body(body);
        if let Some(auth) = &self.auth_header {
            request = request.header(AUTHORIZATION, auth);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                let reason = if e.is_timeout() {
                    format!("timeout: {e}")
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    format!("request failed: {e}")
                };
                return AttemptOutcome::Transient(AttemptError::Transient(reason));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                return AttemptOutcome::Transient(AttemptError::Transient(format!(
                    "failed to read response body: {e}"
                )));
            }
        };

        match classify_response(status.as_u16(), &body) {
            AttemptOutcome::Success(url) => AttemptOutcome::Success((url, index + 1)),
            AttemptOutcome::Transient(e) => AttemptOutcome::Transient(e),
            AttemptOutcome::Permanent(e) => AttemptOutcome::Permanent(e),
        }
    }
}

/// Map a sink response to an attempt outcome
fn classify_response(status: u16, body: &str) -> AttemptOutcome<String, AttemptError> {
    match status {
        200..=299 => match parse_public_url(body) {
            Some(url) => AttemptOutcome::Success(url),
            None => AttemptOutcome::Permanent(AttemptError::InvalidResponse {
                body: truncate(body),
            }),
        },
        400..=499 => AttemptOutcome::Permanent(AttemptError::Rejected {
            status,
            body: truncate(body),
        }),
        _ => AttemptOutcome::Transient(AttemptError::Transient(format!("HTTP {status}"))),
    }
}

/// Plain-text body holding an absolute http(s) URL
fn parse_public_url(body: &str) -> Option<String> {
    let candidate = body.trim();
    let parsed = url::Url::parse(candidate).ok()?;
    if matches!(parsed.scheme(), "http" | "https") && parsed.has_host() {
        Some(candidate.to_string())
    } else {
        None
    }
}

fn truncate(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= MAX_ERROR_BODY {
        return trimmed.to_string();
    }
    let mut end = MAX_ERROR_BODY;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &trimmed[..end])
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;
    use wiremock::matchers::{body_bytes, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(endpoint: String, max_retries: u32) -> PublishConfig {
        PublishConfig {
            endpoint,
            max_retries,
            base_delay: Duration::from_millis(1),
            delay_increment: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    async fn local_file(dir: &TempDir, content: &[u8]) -> std::path::PathBuf {
        let p = dir.path().join("artifact.bin");
        tokio::fs::write(&p, content).await.unwrap();
        p
    }

    #[tokio::test]
    async fn test_publish_puts_bytes_under_sanitized_name() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/upload/Privet_mir.zip"))
            .and(header("authorization", "Bearer t0k"))
            .and(body_bytes(b"payload".to_vec()))
            .respond_with(ResponseTemplate::new(201).set_body_string("https://cdn.sink.test/f/Privet_mir.zip\n"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, b"payload").await;
        let mut config = test_config(format!("{}/upload/", server.uri()), 3);
        config.auth_header = Some("Bearer t0k".to_string());
        let publisher = Publisher::new(&config).unwrap();

        let published = publisher.publish(&file, "Привет мир.zip").await.unwrap();

        assert_eq!(published.url, "https://cdn.sink.test/f/Privet_mir.zip");
        assert_eq!(published.filename, "Privet_mir.zip");
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad filename"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, b"x").await;
        let publisher = Publisher::new(&test_config(server.uri(), 10)).unwrap();

        let err = publisher.publish(&file, "a.bin").await.unwrap_err();
        assert!(err.is_permanent());
        match err {
            PublishError::Rejected { status, body, .. } => {
                assert_eq!(status, 400);
                assert_eq!(body, "bad filename");
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_success_without_url_is_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_string("uploaded!"))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, b"x").await;
        let publisher = Publisher::new(&test_config(server.uri(), 10)).unwrap();

        let err = publisher.publish(&file, "a.bin").await.unwrap_err();
        assert!(matches!(err, PublishError::InvalidResponse { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn test_server_errors_below_budget_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(3)
            .with_priority(1)
            .expect(3)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200).set_body_string("https://sink.test/a.bin"))
            .with_priority(2)
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, b"x").await;
        let publisher = Publisher::new(&test_config(server.uri(), 4)).unwrap();

        let published = publisher.publish(&file, "a.bin").await.unwrap();
        assert_eq!(published.url, "https://sink.test/a.bin");
    }

    #[tokio::test]
    async fn test_server_errors_exhaust_budget() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(502))
            .expect(4)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, b"x").await;
        let publisher = Publisher::new(&test_config(server.uri(), 4)).unwrap();

        let err = publisher.publish(&file, "a.bin").await.unwrap_err();
        match err {
            PublishError::Exhausted {
                filename,
                attempts,
                last_error,
            } => {
                assert_eq!(filename, "a.bin");
                assert_eq!(attempts, 4);
                assert!(last_error.contains("502"));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unreachable_sink_is_transient() {
        // Bind and drop a listener to get a port nobody is serving
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let dir = TempDir::new().unwrap();
        let file = local_file(&dir, b"x").await;
        let publisher =
            Publisher::new(&test_config(format!("http://127.0.0.1:{port}/upload"), 2)).unwrap();

        let err = publisher.publish(&file, "a.bin").await.unwrap_err();
        assert!(matches!(err, PublishError::Exhausted { attempts: 2, .. }), "{err:?}");
        assert!(!err.is_permanent());
    }

    #[tokio::test]
    async fn test_missing_local_file_fails_without_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let publisher = Publisher::new(&test_config(server.uri(), 3)).unwrap();
        let err = publisher
            .publish(&dir.path().join("gone.bin"), "gone.bin")
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::LocalFile { .. }));
    }

    #[test]
    fn test_classify_response() {
        assert!(matches!(
            classify_response(200, " https://x.test/a \n"),
            AttemptOutcome::Success(ref u) if u == "https://x.test/a"
        ));
        assert!(matches!(
            classify_response(200, "/relative/path"),
            AttemptOutcome::Permanent(AttemptError::InvalidResponse { .. })
        ));
        assert!(matches!(
            classify_response(200, "mailto:someone@x.test"),
            AttemptOutcome::Permanent(AttemptError::InvalidResponse { .. })
        ));
        assert!(matches!(
            classify_response(404, ""),
            AttemptOutcome::Permanent(AttemptError::Rejected { status: 404, .. })
        ));
        assert!(matches!(
            classify_response(500, ""),
            AttemptOutcome::Transient(_)
        ));
    }

    #[test]
    fn test_upload_url_encodes_filename() {
        let publisher = Publisher::new(&test_config("https://sink.test/up/".into(), 1)).unwrap();
        assert_eq!(publisher.upload_url("a b.zip"), "https://sink.test/up/a%20b.zip");
    }
}
