use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use tokio::fs;

use crate::{CastError, CastResult};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const FETCH_ATTEMPTS: u32 = 10;
const FETCH_FIRST_DELAY: Duration = Duration::from_secs(1);

/// One fetched object body. `from_offset` records whether the source
/// honoured the requested offset (HTTP 206); if not, the body starts at
/// byte zero and the caller discards the leading bytes itself.
pub struct FetchBody {
    pub data: Vec<u8>,
    pub from_offset: bool,
}

/// Read access to the store, as narrow as the wire contract: GET by name,
/// optionally from an offset. `Ok(None)` is "object does not exist",
/// which the protocol uses as its terminal signal.
#[async_trait]
pub trait Fetch: Send + Sync {
    async fn fetch(&self, name: &str, offset: u64) -> CastResult<Option<FetchBody>>;
}

/// HTTP GET with a `Range` header, the 10-attempt doubling backoff of the
/// storage adapters, and 200-instead-of-206 degradation left to the
/// caller via [`FetchBody::from_offset`].
pub struct HttpFetcher {
    base_url: String,
    client: Client,
}

impl HttpFetcher {
    pub fn new(base_url: &str) -> CastResult<Self> {
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(CastError::InvalidParam("empty base url".to_string()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CastError::Internal(format!("Failed to create client: {}", e)))?;
        Ok(Self { base_url, client })
    }
}

#[async_trait]
impl Fetch for HttpFetcher {
    async fn fetch(&self, name: &str, offset: u64) -> CastResult<Option<FetchBody>> {
        let url = format!("{}/{}", self.base_url, name);
        let mut delay = FETCH_FIRST_DELAY;
        let mut last_err = String::new();
        for attempt in 1..=FETCH_ATTEMPTS {
            let mut req = self.client.get(&url);
            if offset > 0 {
                req = req.header(header::RANGE, format!("bytes={}-", offset));
            }
            match req.send().await {
                Ok(res) => match res.status() {
                    StatusCode::NOT_FOUND => return Ok(None),
                    // Offset at or past the end of the object.
                    StatusCode::RANGE_NOT_SATISFIABLE => {
                        return Ok(Some(FetchBody {
                            data: Vec::new(),
                            from_offset: true,
                        }));
                    }
                    status if status.is_success() => {
                        let from_offset = status == StatusCode::PARTIAL_CONTENT || offset == 0;
                        let data = res
                            .bytes()
                            .await
                            .map_err(|e| {
                                CastError::RemoteError(format!("read body of {} failed: {}", url, e))
                            })?
                            .to_vec();
                        return Ok(Some(FetchBody { data, from_offset }));
                    }
                    status if status.is_server_error() => {
                        last_err = format!("HTTP {}", status);
                    }
                    status => {
                        return Err(CastError::from_http_status(status, url));
                    }
                },
                Err(e) => last_err = e.to_string(),
            }
            if attempt < FETCH_ATTEMPTS {
                warn!(
                    "fetch {} failed ({}), retry {}/{} in {:?}",
                    url, last_err, attempt, FETCH_ATTEMPTS, delay
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        Err(CastError::RemoteError(format!(
            "{} failed after {} attempts: {}",
            url, FETCH_ATTEMPTS, last_err
        )))
    }
}

/// Reads objects straight off a [`LocalDirStore`](crate::LocalDirStore)
/// directory. Backs the tests and local-target use; offsets are applied
/// here, so `from_offset` is always honoured.
pub struct LocalFetcher {
    base_dir: PathBuf,
}

impl LocalFetcher {
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl Fetch for LocalFetcher {
    async fn fetch(&self, name: &str, offset: u64) -> CastResult<Option<FetchBody>> {
        match fs::read(self.base_dir.join(name)).await {
            Ok(mut data) => {
                let offset = (offset as usize).min(data.len());
                data.drain(..offset);
                Ok(Some(FetchBody {
                    data,
                    from_offset: true,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CastError::IoError(format!("read {} failed: {}", name, e))),
        }
    }
}

pub enum FollowState {
    /// Stream still live; the follower holds a (possibly longer) prefix.
    Running,
    /// Manifest is gone and the consolidated object has been read.
    Finished,
}

/// The reference reader of the wire contract. Polls the manifest, walks
/// the listed ranges, skips everything already held, and fetches only the
/// tail of the one straddling range plus all later ranges. Everything is
/// byte-addressed: held data is raw UTF-8 bytes and is only interpreted
/// as text by the caller once complete, so chunk boundaries falling
/// mid-character are harmless.
pub struct StreamFollower<F: Fetch> {
    fetch: F,
    filename: String,
    held: Vec<u8>,
}

impl<F: Fetch> StreamFollower<F> {
    pub fn new(fetch: F, filename: &str) -> Self {
        Self {
            fetch,
            filename: filename.to_string(),
            held: Vec::new(),
        }
    }

    /// Bytes of the stream held so far.
    pub fn held(&self) -> &[u8] {
        &self.held
    }

    /// One round of the poll loop.
    pub async fn poll_once(&mut self) -> CastResult<FollowState> {
        let manifest_name = format!("{}.chunks", self.filename);
        let manifest = match self.fetch.fetch(&manifest_name, 0).await? {
            Some(body) => body.data,
            // Manifest gone: the stream finalised. Resume into the
            // consolidated object from what we already hold.
            None => {
                let offset = self.held.len() as u64;
                let body = self
                    .fetch
                    .fetch(&self.filename, offset)
                    .await?
                    .ok_or_else(|| CastError::NotFound(self.filename.clone()))?;
                self.held.extend(clip_to_offset(body, offset)?);
                return Ok(FollowState::Finished);
            }
        };

        let sizes: Vec<u64> = serde_json::from_slice(&manifest)
            .map_err(|e| CastError::DecodeError(format!("bad manifest: {}", e)))?;

        let mut chunk_start = 0u64;
        for size in sizes {
            let chunk_end = chunk_start + size;
            if (self.held.len() as u64) >= chunk_end {
                chunk_start = chunk_end;
                continue;
            }
            let offset = self.held.len() as u64 - chunk_start;
            let name = format!("{}.{}-{}", self.filename, chunk_start, chunk_end);
            let body = match self.fetch.fetch(&name, offset).await? {
                Some(body) => body,
                // Chunk vanished between manifest and fetch: the stream
                // finalised under us. Restart the outer poll.
                None => {
                    debug!("chunk {} gone mid-walk, restarting poll", name);
                    return Ok(FollowState::Running);
                }
            };
            let mut bytes = clip_to_offset(body, offset)?;
            // A merge racing us may have extended this object past the
            // end this manifest promised; consume only up to it.
            let wanted = (chunk_end - self.held.len() as u64) as usize;
            if bytes.len() < wanted {
                return Err(CastError::InvalidState(format!(
                    "chunk {} shorter than manifest: {} < {}",
                    name,
                    bytes.len(),
                    wanted
                )));
            }
            bytes.truncate(wanted);
            self.held.extend(bytes);
            chunk_start = chunk_end;
        }
        Ok(FollowState::Running)
    }

    /// Poll until finalisation and return the complete stream.
    pub async fn run_to_end(mut self) -> CastResult<Vec<u8>> {
        loop {
            if let FollowState::Finished = self.poll_once().await? {
                return Ok(self.held);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Degrade a 200-instead-of-206 response by discarding the bytes before
/// the requested offset.
fn clip_to_offset(body: FetchBody, offset: u64) -> CastResult<Vec<u8>> {
    if body.from_offset {
        return Ok(body.data);
    }
    let mut data = body.data;
    if (data.len() as u64) < offset {
        return Err(CastError::InvalidState(format!(
            "full response shorter ({}) than resume offset {}",
            data.len(),
            offset
        )));
    }
    data.drain(..offset as usize);
    Ok(data)
}
