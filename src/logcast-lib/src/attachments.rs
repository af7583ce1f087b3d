use std::path::{Path, PathBuf};

use tokio::fs;

use crate::{CastError, CastResult, IndexedStore};

/// Uploads files the child drops into the shared attachments directory.
/// Each file is uploaded once, the first scan that sees it; the child is
/// responsible for making files appear atomically (write elsewhere,
/// rename in). Symlinks and subdirectories are ignored.
pub struct AttachmentScanner {
    dir: PathBuf,
    index: IndexedStore,
}

impl AttachmentScanner {
    pub fn new<P: AsRef<Path>>(dir: P, index: IndexedStore) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            index,
        }
    }

    /// Returns how many new files were uploaded. Re-scanning an unchanged
    /// directory uploads nothing.
    pub async fn scan(&self) -> CastResult<usize> {
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| CastError::IoError(format!("read attachments dir failed: {}", e)))?;
        let mut uploaded = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CastError::IoError(format!("read attachments dir failed: {}", e)))?
        {
            // DirEntry::file_type does not follow symlinks.
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("attachment with non-UTF-8 name skipped: {:?}", raw);
                    continue;
                }
            };
            if self.index.contains(&name) {
                continue;
            }
            let data = fs::read(entry.path())
                .await
                .map_err(|e| CastError::IoError(format!("read attachment {} failed: {}", name, e)))?;
            self.index.write(&name, &data).await?;
            info!("attachment {} uploaded ({} bytes)", name, data.len());
            uploaded += 1;
        }
        Ok(uploaded)
    }
}
