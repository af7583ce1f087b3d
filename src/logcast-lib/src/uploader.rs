use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use encoding_rs::{Decoder, DecoderResult, Encoding};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::{CastError, CastResult, ChunkList, IndexedStore, ObjectStorage};

/// A pending buffer at or above this size is flushed immediately.
pub const SIZE_LIMIT: usize = 1_000_000;
/// Pending bytes are flushed at the latest this long after they first
/// appeared.
pub const TIME_LIMIT_SECS: u64 = 10;

const MANIFEST_SUFFIX: &str = "chunks";

/// Assets seeded into the store at startup so a browser pointed at the
/// bucket can render the stream while it runs.
static STATIC_ASSETS: &[(&str, &[u8])] = &[("view.html", include_bytes!("../static/view.html"))];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploaderConfig {
    /// Name of the consolidated object; chunk objects and the manifest
    /// derive their names from it.
    pub filename: String,
    pub size_limit: usize,
    pub time_limit_secs: u64,
    /// WHATWG label of the child's output encoding. Output is always
    /// re-encoded to UTF-8.
    pub encoding: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            filename: "output.txt".to_string(),
            size_limit: SIZE_LIMIT,
            time_limit_secs: TIME_LIMIT_SECS,
            encoding: "utf-8".to_string(),
        }
    }
}

/// Consumes the byte stream and maintains the published chunk layout.
///
/// Ordering guarantee: every chunk object write is acknowledged before the
/// manifest naming it is rewritten, so a reader that holds a manifest can
/// always fetch the ranges it lists. A racing merge may make a fetched
/// chunk *longer* than the manifest promised, never shorter; readers bound
/// consumption by the manifest's sizes.
pub struct ChunkedUploader {
    config: UploaderConfig,
    index: IndexedStore,
    store: Arc<dyn ObjectStorage>,
    decoder: Decoder,
    pending: Vec<u8>,
    chunks: ChunkList,
    send_at: Option<Instant>,
    published: HashSet<String>,
    finished: bool,
}

impl ChunkedUploader {
    /// Publishes the empty manifest immediately so a reader that starts
    /// polling before the first flush gets `[]` instead of a 404 (a 404
    /// means "finalised"), then seeds the static viewer assets.
    pub async fn new(config: UploaderConfig, index: IndexedStore) -> CastResult<Self> {
        let encoding = Encoding::for_label(config.encoding.as_bytes()).ok_or_else(|| {
            CastError::InvalidParam(format!("unknown encoding label: {}", config.encoding))
        })?;
        if config.filename.is_empty() {
            return Err(CastError::InvalidParam("empty stream filename".to_string()));
        }

        let store = index.inner_store();
        let uploader = Self {
            decoder: encoding.new_decoder(),
            config,
            index,
            store,
            pending: Vec::new(),
            chunks: ChunkList::new(),
            send_at: None,
            published: HashSet::new(),
            finished: false,
        };

        uploader
            .store
            .write(&uploader.manifest_name(), b"[]")
            .await?;
        for &(name, data) in STATIC_ASSETS {
            uploader.index.write(name, data).await?;
        }
        info!(
            "uploader ready, stream {} ({})",
            uploader.config.filename, uploader.config.encoding
        );
        Ok(uploader)
    }

    fn manifest_name(&self) -> String {
        format!("{}.{}", self.config.filename, MANIFEST_SUFFIX)
    }

    fn object_name(&self, suffix: &str) -> String {
        format!("{}.{}", self.config.filename, suffix)
    }

    /// Bytes decoded but not yet promoted into a block.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed the next slice of raw child output. `last` finalises: the
    /// consolidated object is written and every chunk plus the manifest is
    /// deleted, after which the uploader refuses further writes.
    pub async fn write(&mut self, data: &[u8], last: bool) -> CastResult<()> {
        if self.finished {
            return Err(CastError::InvalidState(
                "write after finalisation".to_string(),
            ));
        }

        self.decode_into_pending(data, last)?;

        if last {
            return self.finalise().await;
        }

        if self.pending.is_empty() {
            return Ok(());
        }
        let now = Instant::now();
        let deadline = *self
            .send_at
            .get_or_insert_with(|| now + Duration::from_secs(self.config.time_limit_secs));
        if now >= deadline || self.pending.len() >= self.config.size_limit {
            let block = std::mem::take(&mut self.pending);
            self.flush_block(block).await?;
            self.send_at = None;
        }
        Ok(())
    }

    /// Incremental transcode to UTF-8. Malformed input is fatal; the
    /// stream aborts rather than silently publishing mangled bytes.
    fn decode_into_pending(&mut self, data: &[u8], last: bool) -> CastResult<()> {
        let mut src = data;
        loop {
            let capacity = self
                .decoder
                .max_utf8_buffer_length_without_replacement(src.len())
                .unwrap_or(src.len() * 4 + 16);
            let mut out = String::with_capacity(capacity.max(16));
            let (result, read) =
                self.decoder
                    .decode_to_string_without_replacement(src, &mut out, last);
            self.pending.extend_from_slice(out.as_bytes());
            src = &src[read..];
            match result {
                DecoderResult::InputEmpty => return Ok(()),
                DecoderResult::OutputFull => continue,
                DecoderResult::Malformed(len, _) => {
                    return Err(CastError::DecodeError(format!(
                        "malformed {} input ({} bytes) at stream offset {}",
                        self.config.encoding,
                        len,
                        self.chunks.flushed_len() as usize + self.pending.len()
                    )));
                }
            }
        }
    }

    /// Promote the pending buffer into a block, publish the (possibly
    /// merged) last chunk, then rewrite the manifest. Chunk first,
    /// manifest second; readers must never see a manifest naming an
    /// object that is not yet visible.
    async fn flush_block(&mut self, block: Vec<u8>) -> CastResult<()> {
        let write = self.chunks.push_block(block);
        let suffix = write.suffix();
        self.store
            .write(&self.object_name(&suffix), &write.data)
            .await?;
        self.published.insert(suffix);

        let manifest = serde_json::to_string(&write.sizes)
            .map_err(|e| CastError::Internal(format!("encode manifest failed: {}", e)))?;
        self.store
            .write(&self.manifest_name(), manifest.as_bytes())
            .await?;
        info!(
            "flushed chunk {}-{} ({} bytes, {} chunks, {} total)",
            write.start,
            write.end,
            write.end - write.start,
            self.chunks.chunk_count(),
            self.chunks.flushed_len()
        );
        Ok(())
    }

    /// Write the full stream as one object (through the index, so the
    /// listing picks it up), then drop every transient object in a single
    /// batch. After this the manifest 404s, which is the terminal signal
    /// of the wire contract.
    async fn finalise(&mut self) -> CastResult<()> {
        let mut full = self.chunks.concat_all();
        full.append(&mut self.pending);
        self.index.write(&self.config.filename, &full).await?;

        let mut names = self
            .published
            .iter()
            .map(|suffix| self.object_name(suffix))
            .collect::<Vec<String>>();
        names.push(self.manifest_name());
        self.store.delete(&names).await?;
        self.finished = true;
        info!(
            "finalised {}: {} bytes consolidated, {} transient objects deleted",
            self.config.filename,
            full.len(),
            names.len()
        );
        Ok(())
    }
}
