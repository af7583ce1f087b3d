use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use crate::{content_type_for_name, CastError, CastResult, ObjectStorage};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const RETRY_ATTEMPTS: u32 = 10;
const RETRY_FIRST_DELAY: Duration = Duration::from_secs(1);

/// Object store behind a plain HTTP PUT/DELETE endpoint, e.g. an
/// S3-compatible bucket. Objects are published world-readable
/// (`x-amz-acl: public-read`) with a content type derived from the name,
/// so the polling reader needs nothing but GET.
///
/// `has` stays unimplemented: the adapter is always wrapped by an
/// [`IndexedStore`](crate::IndexedStore), which answers membership from
/// its own set instead of issuing HEAD requests.
pub struct HttpBucketStore {
    base_url: String,
    session_token: Option<String>,
    client: Client,
}

impl HttpBucketStore {
    pub fn new(base_url: &str, session_token: Option<String>) -> CastResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CastError::InvalidParam("empty remote url".to_string()));
        }
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CastError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self {
            base_url,
            session_token,
            client,
        })
    }

    fn object_url(&self, name: &str) -> String {
        format!("{}/{}", self.base_url, name)
    }

    /// Retries transient failures (connect errors, timeouts, 5xx) with a
    /// doubling backoff. Anything else 4xx is permanent and kills the
    /// stream.
    async fn send_with_retry<F>(&self, url: &str, not_found_ok: bool, build: F) -> CastResult<StatusCode>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut delay = RETRY_FIRST_DELAY;
        let mut last_err = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            let mut req = build();
            if let Some(token) = &self.session_token {
                req = req.bearer_auth(token);
            }
            match req.send().await {
                Ok(res) => {
                    let status = res.status();
                    if status.is_success() || (not_found_ok && status == StatusCode::NOT_FOUND) {
                        return Ok(status);
                    }
                    if !status.is_server_error() {
                        return Err(CastError::from_http_status(status, url.to_string()));
                    }
                    last_err = format!("HTTP {}", status);
                }
                Err(e) => {
                    last_err = e.to_string();
                }
            }
            if attempt < RETRY_ATTEMPTS {
                warn!(
                    "HttpBucketStore: {} failed ({}), retry {}/{} in {:?}",
                    url, last_err, attempt, RETRY_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(CastError::RemoteError(format!(
            "{} failed after {} attempts: {}",
            url, RETRY_ATTEMPTS, last_err
        )))
    }
}

#[async_trait]
impl ObjectStorage for HttpBucketStore {
    async fn write(&self, name: &str, data: &[u8]) -> CastResult<()> {
        let url = self.object_url(name);
        let content_type = content_type_for_name(name);
        let body = data.to_vec();
        debug!("SEND PUT object request, url:{} ({} bytes)", url, body.len());
        self.send_with_retry(&url, false, || {
            self.client
                .put(&url)
                .header("Content-Type", content_type)
                .header("x-amz-acl", "public-read")
                .body(body.clone())
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, names: &[String]) -> CastResult<()> {
        for name in names {
            let url = self.object_url(name);
            debug!("SEND DELETE object request, url:{}", url);
            self.send_with_retry(&url, true, || self.client.delete(&url)).await?;
        }
        Ok(())
    }
}
