use async_trait::async_trait;

use crate::{CastError, CastResult};

/// The capability set the rest of the system is written against: a store
/// that can accept a whole object, forget objects, and (optionally) answer
/// membership. There is no append and no partial overwrite anywhere behind
/// this trait.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Membership test. Adapters that cannot answer cheaply keep the
    /// default, which fails loudly; callers that need `has` wrap the
    /// adapter in an [`IndexedStore`](crate::IndexedStore) instead.
    async fn has(&self, name: &str) -> CastResult<bool> {
        Err(CastError::Unsupported(format!(
            "has() not supported by this adapter (asked for {})",
            name
        )))
    }

    /// Whole-object PUT. Overwrites. Returns only once the store has
    /// accepted the bytes.
    async fn write(&self, name: &str, data: &[u8]) -> CastResult<()>;

    /// Batch delete. Missing objects are not an error.
    async fn delete(&self, names: &[String]) -> CastResult<()>;
}

/// Content type by name suffix, for adapters that publish over HTTP.
/// Chunk objects and the manifest are served as plain text so a browser
/// can be pointed straight at them.
pub fn content_type_for_name(name: &str) -> &'static str {
    match name.rsplit('.').next().unwrap_or("") {
        "html" | "htm" => "text/html; charset=utf-8",
        "json" => "application/json",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "text/plain; charset=utf-8",
    }
}
