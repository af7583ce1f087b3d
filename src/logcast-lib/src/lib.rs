//! Publish the output of a single long-running process to a dumb object
//! store (whole-object PUT and DELETE only) so that a polling reader can
//! follow the stream as it grows.
//!
//! The store never supports append, so a naive implementation either
//! rewrites the whole log on every flush (O(n^2) bytes) or writes one
//! object per flush (O(n) requests for a catching-up reader). Instead the
//! uploader keeps flushed blocks in chunks whose block counts follow a
//! doubling discipline: every new block starts as its own chunk, and
//! whenever the last two chunks hold the same number of blocks they are
//! merged into one. Block counts form a strictly decreasing sequence of
//! powers of two, so there are at most log2(n)+1 chunks at any moment,
//! and a byte is re-uploaded at most log2(n) times.
//!
//! Chunks are immutable objects named by their absolute byte range
//! (`{name}.{start}-{end}`); a mutable manifest (`{name}.chunks`, a JSON
//! array of chunk sizes) describes the current layout and is always
//! written *after* the chunk it references. On finalisation the full
//! stream is written as a single object and every chunk plus the manifest
//! is deleted; a reader that sees the manifest 404 knows the stream is
//! done.

mod attachments;
mod chunk_list;
mod client;
mod indexed_store;
mod local_store;
mod remote_store;
mod storage;
mod uploader;

#[cfg(test)]
mod test_uploader;

pub use attachments::AttachmentScanner;
pub use chunk_list::{ChunkList, ChunkWrite};
pub use client::{Fetch, FetchBody, FollowState, HttpFetcher, LocalFetcher, StreamFollower};
pub use indexed_store::IndexedStore;
pub use local_store::LocalDirStore;
pub use remote_store::HttpBucketStore;
pub use storage::{content_type_for_name, ObjectStorage};
pub use uploader::{ChunkedUploader, UploaderConfig, SIZE_LIMIT, TIME_LIMIT_SECS};

use reqwest::StatusCode;
use thiserror::Error;

#[macro_use]
extern crate log;

#[derive(Error, Debug)]
pub enum CastError {
    #[error("internal error: {0}")]
    Internal(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("remote error: {0}")]
    RemoteError(String),
    #[error("decode error: {0}")]
    DecodeError(String),
    #[error("invalid param: {0}")]
    InvalidParam(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl CastError {
    pub fn from_http_status(code: StatusCode, info: String) -> Self {
        match code {
            StatusCode::NOT_FOUND => CastError::NotFound(info),
            StatusCode::INTERNAL_SERVER_ERROR => CastError::Internal(info),
            _ => CastError::RemoteError(format!("HTTP error: {} for {}", code, info)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CastError::NotFound(_))
    }
}

pub type CastResult<T> = std::result::Result<T, CastError>;

impl From<std::io::Error> for CastError {
    fn from(err: std::io::Error) -> Self {
        CastError::IoError(err.to_string())
    }
}
