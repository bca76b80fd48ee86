use crate::config::normalized_base;
use crate::error::SourceError;
use crate::models::RetryPolicy;
use crate::traits::Fetch;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use tracing::{debug, error, warn};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched(Vec<u8>),
    NotFound,
    Forbidden,
    Failed(String),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Fetched(_) => "fetched",
            Self::NotFound => "not_found",
            Self::Forbidden => "forbidden",
            Self::Failed(_) => "failed",
        }
    }
}

enum Attempt {
    Done(FetchOutcome),
    Transient(String),
}

#[derive(Clone)]
pub struct HttpDownloader {
    client: Arc<Client>,
    files_base: Url,
    token: String,
    retry: RetryPolicy,
}

impl HttpDownloader {
    pub fn new(
        storage_base: &str,
        token: impl Into<String>,
        retry: RetryPolicy,
    ) -> Result<Self, SourceError> {
        let client = Client::builder().timeout(retry.request_timeout).build()?;
        let files_base = normalized_base(storage_base)?.join("storage/file/")?;

        Ok(Self {
            client: Arc::new(client),
            files_base,
            token: token.into(),
            retry,
        })
    }

    pub fn file_url(&self, link: &str) -> Result<Url, SourceError> {
        let invalid = || SourceError::InvalidLink(link.to_string());
        let segments: Vec<&str> = link.split('/').filter(|segment| !segment.is_empty()).collect();
        if segments.is_empty() || segments.iter().any(|segment| matches!(*segment, "." | "..")) {
            return Err(invalid());
        }

        let mut url = self.files_base.clone();
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn attempt(&self, url: &Url) -> Attempt {
        let response = match self
            .client
            .get(url.clone())
            .bearer_auth(&self.token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(error) if is_transient(&error) => return Attempt::Transient(error.to_string()),
            Err(error) => return Attempt::Done(FetchOutcome::Failed(error.to_string())),
        };

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            warn!(url = %url, "file not found (404)");
            return Attempt::Done(FetchOutcome::NotFound);
        }
        if status == StatusCode::FORBIDDEN {
            warn!(url = %url, "access to file forbidden (403)");
            return Attempt::Done(FetchOutcome::Forbidden);
        }
        if !status.is_success() {
            error!(url = %url, status = %status, "file download failed");
            return Attempt::Done(FetchOutcome::Failed(format!("unexpected status {status}")));
        }

        match response.bytes().await {
            Ok(body) => Attempt::Done(FetchOutcome::Fetched(body.to_vec())),
            Err(error) if is_transient(&error) => Attempt::Transient(error.to_string()),
            Err(error) => Attempt::Done(FetchOutcome::Failed(error.to_string())),
        }
    }
}

fn is_transient(error: &reqwest::Error) -> bool {
    error.is_timeout() || error.is_connect() || error.is_body()
}

#[async_trait]
impl Fetch for HttpDownloader {
    async fn fetch(&self, link: &str) -> FetchOutcome {
        let url = match self.file_url(link) {
            Ok(url) => url,
            Err(error) => {
                warn!(link = %link, error = %error, "refusing to request file link");
                return FetchOutcome::Failed(error.to_string());
            }
        };

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(&url).await {
                Attempt::Done(outcome) => return outcome,
                Attempt::Transient(reason) if attempt >= max_attempts => {
                    error!(url = %url, attempts = max_attempts, reason = %reason, "giving up on file download");
                    return FetchOutcome::Failed(format!(
                        "gave up after {max_attempts} attempts: {reason}"
                    ));
                }
                Attempt::Transient(reason) => {
                    debug!(url = %url, attempt, reason = %reason, "transient download error, retrying");
                    tokio::time::sleep(self.retry.delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn quick_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            delay: Duration::from_millis(10),
            request_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn fetched_bytes_are_returned_with_bearer_token() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/storage/file/docs/a.pdf"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"%PDF-1.4".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let downloader =
            HttpDownloader::new(&format!("{}/api/v1", server.uri()), "secret", quick_retry(3))?;
        let outcome = downloader.fetch("docs/a.pdf").await;

        assert_eq!(outcome, FetchOutcome::Fetched(b"%PDF-1.4".to_vec()));
        Ok(())
    }

    #[tokio::test]
    async fn status_codes_are_classified_without_retry() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;
        for (file, status) in [("missing.pdf", 404), ("locked.pdf", 403), ("broken.pdf", 500)] {
            Mock::given(method("GET"))
                .and(path(format!("/storage/file/{file}")))
                .respond_with(ResponseTemplate::new(status))
                .expect(1)
                .mount(&server)
                .await;
        }

        let downloader = HttpDownloader::new(&server.uri(), "secret", quick_retry(5))?;

        assert_eq!(downloader.fetch("missing.pdf").await, FetchOutcome::NotFound);
        assert_eq!(downloader.fetch("locked.pdf").await, FetchOutcome::Forbidden);
        assert!(matches!(
            downloader.fetch("broken.pdf").await,
            FetchOutcome::Failed(reason) if reason.contains("500")
        ));
        Ok(())
    }

    #[tokio::test]
    async fn timeouts_are_retried_up_to_the_attempt_bound() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/file/slow.pdf"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
            .mount(&server)
            .await;

        let downloader = HttpDownloader::new(&server.uri(), "secret", quick_retry(3))?;
        let outcome = downloader.fetch("slow.pdf").await;

        assert!(matches!(outcome, FetchOutcome::Failed(reason) if reason.contains("3 attempts")));
        let requests = server.received_requests().await.unwrap_or_default();
        assert_eq!(requests.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_server_fails_after_retries() -> Result<(), Box<dyn std::error::Error>> {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let address = listener.local_addr()?;
        drop(listener);

        let downloader = HttpDownloader::new(&format!("http://{address}"), "secret", quick_retry(2))?;
        let outcome = downloader.fetch("a.pdf").await;

        assert!(matches!(outcome, FetchOutcome::Failed(reason) if reason.contains("2 attempts")));
        Ok(())
    }

    #[test]
    fn links_cannot_leave_the_storage_path() -> Result<(), Box<dyn std::error::Error>> {
        let downloader =
            HttpDownloader::new("https://api.example.org/api/v1", "secret", RetryPolicy::default())?;

        let absolute = downloader.file_url("https://attacker.invalid/x.pdf")?;
        assert_eq!(absolute.host_str(), Some("api.example.org"));
        assert!(absolute.path().starts_with("/api/v1/storage/file/"));

        let protocol_relative = downloader.file_url("//attacker.invalid/x.pdf")?;
        assert_eq!(protocol_relative.host_str(), Some("api.example.org"));

        for link in ["../../x.pdf", "docs/../../x.pdf", "./x.pdf", "", "/"] {
            assert!(
                matches!(downloader.file_url(link), Err(SourceError::InvalidLink(_))),
                "{link}"
            );
        }
        Ok(())
    }

    #[tokio::test]
    async fn traversal_links_are_never_requested() -> Result<(), Box<dyn std::error::Error>> {
        let server = MockServer::start().await;
        let downloader = HttpDownloader::new(&server.uri(), "secret", quick_retry(3))?;

        let outcome = downloader.fetch("../../admin/export").await;

        assert!(matches!(outcome, FetchOutcome::Failed(reason) if reason.contains("invalid file link")));
        let requests = server.received_requests().await.unwrap_or_default();
        assert!(requests.is_empty());
        Ok(())
    }

    #[test]
    fn file_url_is_built_under_storage_path() -> Result<(), Box<dyn std::error::Error>> {
        let downloader =
            HttpDownloader::new("https://example.org/api/v1", "secret", RetryPolicy::default())?;
        assert_eq!(
            downloader.file_url("/2023/08/a b.pdf")?.as_str(),
            "https://example.org/api/v1/storage/file/2023/08/a%20b.pdf"
        );
        Ok(())
    }
}
