//! Replay storage: the provider interface and key layout.
//!
//! ```text
//! mod.rs   — Provider trait, PathStrategy, StorageError
//! local.rs — LocalProvider (filesystem)
//! ```

pub mod local;

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use local::LocalProvider;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

pub type Reader = Box<dyn AsyncRead + Send + Unpin>;

/// A blob store for replay files.
#[async_trait]
pub trait Provider: Send + Sync {
    async fn upload(&self, key: &str, reader: Reader, size: u64) -> Result<(), StorageError>;
    async fn download(&self, key: &str) -> Result<Reader, StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
    async fn get_size(&self, key: &str) -> Result<u64, StorageError>;
    /// Remove objects last written before `cutoff`. Returns how many.
    async fn purge_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError>;
    fn kind(&self) -> &'static str;
    async fn health_check(&self) -> Result<(), StorageError>;
}

/// How replay keys are laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PathStrategy {
    Flat,
    #[default]
    DateHierarchy,
}

impl PathStrategy {
    pub fn replay_key(self, session_id: &str, at: DateTime<Utc>) -> String {
        match self {
            Self::Flat => format!("{session_id}.cast"),
            Self::DateHierarchy => format!("{}/{session_id}.cast", at.format("%Y-%m-%d")),
        }
    }
}

impl fmt::Display for PathStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Flat => "flat",
            Self::DateHierarchy => "date-hierarchy",
        })
    }
}
