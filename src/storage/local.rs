//! Filesystem replay provider.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{info, warn};

use super::{Provider, Reader, StorageError};

pub struct LocalProvider {
    base: PathBuf,
}

impl LocalProvider {
    pub async fn new(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base = base.into();
        fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    fn path(&self, key: &str) -> Result<PathBuf, StorageError> {
        let rel = Path::new(key);
        let clean = rel
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if key.is_empty() || !clean {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(self.base.join(rel))
    }
}

#[async_trait]
impl Provider for LocalProvider {
    async fn upload(&self, key: &str, mut reader: Reader, size: u64) -> Result<(), StorageError> {
        let path = self.path(key)?;
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await?;
        }
        let mut file = fs::File::create(&path).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        if written != size {
            warn!("Replay {key}: expected {size} bytes, wrote {written}");
        }
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Reader, StorageError> {
        let path = self.path(key)?;
        match fs::File::open(&path).await {
            Ok(f) => Ok(Box::new(f)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.path(key)?).await?)
    }

    async fn get_size(&self, key: &str) -> Result<u64, StorageError> {
        match fs::metadata(self.path(key)?).await {
            Ok(m) => Ok(m.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = SystemTime::from(cutoff);
        let mut removed = 0;
        let mut dirs = vec![self.base.clone()];
        while let Some(dir) = dirs.pop() {
            let Ok(mut read_dir) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = read_dir.next_entry().await {
                let path = entry.path();
                let Ok(meta) = entry.metadata().await else {
                    continue;
                };
                if meta.is_dir() {
                    dirs.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("cast") {
                    continue;
                }
                let Ok(modified) = meta.modified() else {
                    continue;
                };
                if modified < cutoff {
                    info!("Removing expired replay: {}", path.display());
                    if let Err(e) = fs::remove_file(&path).await {
                        warn!("Failed to remove {}: {e}", path.display());
                    } else {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    fn kind(&self) -> &'static str {
        "local"
    }

    async fn health_check(&self) -> Result<(), StorageError> {
        let meta = fs::metadata(&self.base).await?;
        if meta.permissions().readonly() {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                format!("{} is read-only", self.base.display()),
            )));
        }
        Ok(())
    }
}
