use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::{CastError, CastResult, ObjectStorage};

/// Object store backed by a flat local directory. One object per file,
/// object name = file name. Mostly useful for tests and for serving a
/// bucket off a host that already runs a web server.
pub struct LocalDirStore {
    base_dir: PathBuf,
}

impl LocalDirStore {
    pub async fn open<P: AsRef<Path>>(base_dir: P) -> CastResult<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        if !base_dir.exists() {
            debug!("LocalDirStore: create base dir {}", base_dir.to_string_lossy());
            fs::create_dir_all(&base_dir)
                .await
                .map_err(|e| CastError::IoError(format!("create base dir failed: {}", e)))?;
        }
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Object names are flat; anything that would escape the base
    /// directory is rejected.
    fn object_path(&self, name: &str) -> CastResult<PathBuf> {
        if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\\')
        {
            return Err(CastError::InvalidParam(format!("bad object name: {}", name)));
        }
        Ok(self.base_dir.join(name))
    }
}

#[async_trait]
impl ObjectStorage for LocalDirStore {
    async fn has(&self, name: &str) -> CastResult<bool> {
        let path = self.object_path(name)?;
        Ok(fs::try_exists(&path).await.unwrap_or(false))
    }

    async fn write(&self, name: &str, data: &[u8]) -> CastResult<()> {
        let path = self.object_path(name)?;
        fs::write(&path, data)
            .await
            .map_err(|e| CastError::IoError(format!("write {} failed: {}", name, e)))?;
        debug!("LocalDirStore: wrote {} ({} bytes)", name, data.len());
        Ok(())
    }

    async fn delete(&self, names: &[String]) -> CastResult<()> {
        for name in names {
            let path = self.object_path(name)?;
            match fs::remove_file(&path).await {
                Ok(()) => debug!("LocalDirStore: deleted {}", name),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CastError::IoError(format!("delete {} failed: {}", name, e)));
                }
            }
        }
        Ok(())
    }
}
