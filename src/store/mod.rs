//! Collaborator interfaces the connection fabric consumes, and the
//! file-backed implementation the binary ships.
//!
//! ```text
//! mod.rs       — Store / AccessControl traits, StoreError
//! inventory.rs — Inventory: TOML-backed Store + AccessControl
//! journal.rs   — AuditJournal: JSONL session/command audit log
//! ```

pub mod inventory;
pub mod journal;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{
    Account, Asset, Command, CurrentUser, Gateway, GlobalSettings, SessionCmd, SessionRecord,
    Share,
};

pub use inventory::Inventory;
pub use journal::AuditJournal;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("inventory io: {0}")]
    Io(#[from] std::io::Error),
    #[error("inventory parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
}

/// Persistent records the orchestrator reads and writes.
#[async_trait]
pub trait Store: Send + Sync {
    async fn asset(&self, id: u64) -> Result<Asset, StoreError>;
    async fn account(&self, id: u64) -> Result<Account, StoreError>;
    async fn gateway(&self, id: u64) -> Result<Gateway, StoreError>;
    /// Forbidden command rules with the given ids; unknown ids are skipped.
    async fn commands(&self, ids: &[u64]) -> Result<Vec<Command>, StoreError>;
    async fn settings(&self) -> Result<GlobalSettings, StoreError>;
    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError>;
    async fn insert_session_cmd(&self, cmd: &SessionCmd) -> Result<(), StoreError>;
    async fn list_assets(&self) -> Result<Vec<Asset>, StoreError>;
    async fn set_connectable(&self, asset_id: u64, connectable: bool) -> Result<(), StoreError>;
    async fn online_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;
    async fn share(&self, uuid: &str) -> Result<Share, StoreError>;
    /// Spend one use of a share. Returns false when none are left.
    async fn consume_share(&self, uuid: &str) -> Result<bool, StoreError>;
}

/// Identity and authorization decisions.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// API-key flow: `secret` is checked against the request `path` and the
    /// remaining `payload` parameters.
    async fn authenticate_key(
        &self,
        key: &str,
        secret: &str,
        path: &str,
        payload: &BTreeMap<String, String>,
    ) -> Option<CurrentUser>;
    async fn authorized(&self, user: &CurrentUser, asset_id: u64, account_id: u64) -> bool;
    /// Asset ids `user` may open, with the permitted account ids (empty
    /// means any account). Administrators get every asset.
    async fn grants(&self, user: &CurrentUser) -> Vec<(u64, Vec<u64>)>;
    async fn verify_password(&self, user_name: &str, password: &str) -> Option<CurrentUser>;
    /// `key` is an OpenSSH public key line (`ssh-ed25519 AAAA... [comment]`).
    async fn verify_public_key(&self, user_name: &str, key: &str) -> Option<CurrentUser>;
    async fn user(&self, user_name: &str) -> Option<CurrentUser>;
}
