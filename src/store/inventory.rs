//! TOML-file inventory: assets, accounts, gateways, forbidden commands, users,
//! authorizations and share links.
//!
//! The file is read once at startup. Session records live in memory (the
//! online view) and every change is appended to the [`AuditJournal`].

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::journal::{AuditEntry, AuditJournal};
use super::{AccessControl, Store, StoreError};
use crate::auth::constant_time_eq;
use crate::config::ApiKeyConfig;
use crate::model::{
    Account, Asset, Command, CurrentUser, Gateway, GlobalSettings, SessionCmd, SessionRecord,
    Share,
};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct User {
    pub uid: u64,
    pub user_name: String,
    /// Hex SHA-256 of the password used by the SSH front-end.
    #[serde(default)]
    pub password_sha256: String,
    /// OpenSSH public key lines.
    #[serde(default)]
    pub public_keys: Vec<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl User {
    fn current(&self) -> CurrentUser {
        CurrentUser {
            uid: self.uid,
            user_name: self.user_name.clone(),
            roles: self.roles.clone(),
        }
    }
}

/// Grants `uid` access to `asset_id` through the listed accounts (all when
/// empty).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Authorization {
    pub uid: u64,
    pub asset_id: u64,
    #[serde(default)]
    pub account_ids: Vec<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InventoryData {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub assets: Vec<Asset>,
    #[serde(default)]
    pub accounts: Vec<Account>,
    #[serde(default)]
    pub gateways: Vec<Gateway>,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub authorizations: Vec<Authorization>,
    #[serde(default)]
    pub shares: Vec<Share>,
}

impl InventoryData {
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let text = tokio::fs::read_to_string(path).await?;
        Ok(toml::from_str(&text)?)
    }
}

pub struct Inventory {
    data: RwLock<InventoryData>,
    settings: RwLock<GlobalSettings>,
    api_keys: Vec<ApiKeyConfig>,
    sessions: DashMap<String, SessionRecord>,
    journal: Option<AuditJournal>,
}

impl Inventory {
    pub fn new(data: InventoryData, settings: GlobalSettings, api_keys: Vec<ApiKeyConfig>) -> Self {
        Self {
            data: RwLock::new(data),
            settings: RwLock::new(settings),
            api_keys,
            sessions: DashMap::new(),
            journal: None,
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: AuditJournal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn set_settings(&self, settings: GlobalSettings) {
        *self.settings.write() = settings;
    }

    fn not_found(kind: &'static str, id: impl ToString) -> StoreError {
        StoreError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

/// Signature expected as `_secret` for an API key: hex SHA-256 over the
/// request path, the key's secret and the remaining parameter values in key
/// order.
pub fn api_signature(path: &str, secret: &str, payload: &BTreeMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update(secret.as_bytes());
    for value in payload.values() {
        hasher.update(value.as_bytes());
    }
    hex(&hasher.finalize())
}

pub fn password_digest(password: &str) -> String {
    hex(&Sha256::digest(password.as_bytes()))
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Key type and base64 body of an OpenSSH public key line.
fn key_body(line: &str) -> Option<(&str, &str)> {
    let mut parts = line.split_whitespace();
    Some((parts.next()?, parts.next()?))
}

#[async_trait]
impl Store for Inventory {
    async fn asset(&self, id: u64) -> Result<Asset, StoreError> {
        self.data
            .read()
            .assets
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found("asset", id))
    }

    async fn account(&self, id: u64) -> Result<Account, StoreError> {
        self.data
            .read()
            .accounts
            .iter()
            .find(|a| a.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found("account", id))
    }

    async fn gateway(&self, id: u64) -> Result<Gateway, StoreError> {
        self.data
            .read()
            .gateways
            .iter()
            .find(|g| g.id == id)
            .cloned()
            .ok_or_else(|| Self::not_found("gateway", id))
    }

    async fn commands(&self, ids: &[u64]) -> Result<Vec<Command>, StoreError> {
        Ok(self
            .data
            .read()
            .commands
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn settings(&self) -> Result<GlobalSettings, StoreError> {
        Ok(self.settings.read().clone())
    }

    async fn upsert_session(&self, record: &SessionRecord) -> Result<(), StoreError> {
        if record.is_online() {
            self.sessions.insert(record.session_id.clone(), record.clone());
        } else {
            self.sessions.remove(&record.session_id);
        }
        if let Some(journal) = &self.journal {
            journal.append(AuditEntry::Session(record.clone())).await;
        }
        Ok(())
    }

    async fn insert_session_cmd(&self, cmd: &SessionCmd) -> Result<(), StoreError> {
        debug!("Session {} command {:?}", cmd.session_id, cmd.cmd);
        if let Some(journal) = &self.journal {
            journal.append(AuditEntry::Command(cmd.clone())).await;
        }
        Ok(())
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, StoreError> {
        Ok(self.data.read().assets.clone())
    }

    async fn set_connectable(&self, asset_id: u64, connectable: bool) -> Result<(), StoreError> {
        let mut data = self.data.write();
        let asset = data
            .assets
            .iter_mut()
            .find(|a| a.id == asset_id)
            .ok_or_else(|| Self::not_found("asset", asset_id))?;
        asset.connectable = connectable;
        Ok(())
    }

    async fn online_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        Ok(self.sessions.iter().map(|e| e.value().clone()).collect())
    }

    async fn share(&self, uuid: &str) -> Result<Share, StoreError> {
        self.data
            .read()
            .shares
            .iter()
            .find(|s| s.uuid == uuid)
            .cloned()
            .ok_or_else(|| Self::not_found("share", uuid))
    }

    async fn consume_share(&self, uuid: &str) -> Result<bool, StoreError> {
        let mut data = self.data.write();
        let share = data
            .shares
            .iter_mut()
            .find(|s| s.uuid == uuid)
            .ok_or_else(|| Self::not_found("share", uuid))?;
        Ok(match share.times.as_mut() {
            None => true,
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                true
            }
        })
    }
}

#[async_trait]
impl AccessControl for Inventory {
    async fn authenticate_key(
        &self,
        key: &str,
        secret: &str,
        path: &str,
        payload: &BTreeMap<String, String>,
    ) -> Option<CurrentUser> {
        let entry = self
            .api_keys
            .iter()
            .find(|k| constant_time_eq(k.key.as_bytes(), key.as_bytes()))?;
        let expected = api_signature(path, &entry.secret, payload);
        if !constant_time_eq(expected.as_bytes(), secret.as_bytes()) {
            return None;
        }
        let roles = if entry.admin {
            vec!["admin".to_string()]
        } else {
            Vec::new()
        };
        Some(CurrentUser {
            uid: entry.uid,
            user_name: entry.user_name.clone(),
            roles,
        })
    }

    async fn authorized(&self, user: &CurrentUser, asset_id: u64, account_id: u64) -> bool {
        if user.is_admin() {
            return true;
        }
        self.data.read().authorizations.iter().any(|a| {
            a.uid == user.uid
                && a.asset_id == asset_id
                && (a.account_ids.is_empty() || a.account_ids.contains(&account_id))
        })
    }

    async fn grants(&self, user: &CurrentUser) -> Vec<(u64, Vec<u64>)> {
        let data = self.data.read();
        if user.is_admin() {
            return data.assets.iter().map(|a| (a.id, Vec::new())).collect();
        }
        let mut grants: BTreeMap<u64, Vec<u64>> = BTreeMap::new();
        for a in data.authorizations.iter().filter(|a| a.uid == user.uid) {
            grants
                .entry(a.asset_id)
                .or_default()
                .extend(a.account_ids.iter().copied());
        }
        grants.into_iter().collect()
    }

    async fn verify_password(&self, user_name: &str, password: &str) -> Option<CurrentUser> {
        let data = self.data.read();
        let user = data.users.iter().find(|u| u.user_name == user_name)?;
        if user.password_sha256.is_empty() {
            return None;
        }
        let digest = password_digest(password);
        constant_time_eq(user.password_sha256.to_lowercase().as_bytes(), digest.as_bytes())
            .then(|| user.current())
    }

    async fn verify_public_key(&self, user_name: &str, key: &str) -> Option<CurrentUser> {
        let offered = key_body(key)?;
        let data = self.data.read();
        let user = data.users.iter().find(|u| u.user_name == user_name)?;
        user.public_keys
            .iter()
            .any(|k| key_body(k) == Some(offered))
            .then(|| user.current())
    }

    async fn user(&self, user_name: &str) -> Option<CurrentUser> {
        self.data
            .read()
            .users
            .iter()
            .find(|u| u.user_name == user_name)
            .map(User::current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[[users]]
uid = 7
user_name = "bob"
password_sha256 = "5e884898da28047151d0e56f8dc6292773603d0d6aabbdd62a11ef721d1542d8"
public_keys = ["ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKey bob@laptop"]

[[users]]
uid = 1
user_name = "alice"
roles = ["acl_admin"]

[[assets]]
id = 10
name = "web"
ip = "10.0.0.1"
protocols = ["ssh:22"]
access_auth = { cmd_ids = [1, 3] }

[[accounts]]
id = 20
name = "root"
account = "root"
password = "pw"

[[commands]]
id = 1
cmd = "rm -rf /"

[[commands]]
id = 2
cmd = "reboot"

[[authorizations]]
uid = 7
asset_id = 10
account_ids = [20]

[[shares]]
id = 1
uuid = "abc"
uid = 7
user_name = "bob"
asset_id = 10
account_id = 20
protocol = "ssh:22"
end = "2099-01-01T00:00:00Z"
times = 1
"#;

    fn inventory() -> Inventory {
        let data: InventoryData = toml::from_str(SAMPLE).unwrap();
        let keys = vec![ApiKeyConfig {
            key: "k1".into(),
            secret: "s3cret".into(),
            uid: 99,
            user_name: "robot".into(),
            admin: true,
        }];
        Inventory::new(data, GlobalSettings::default(), keys)
    }

    #[tokio::test]
    async fn test_lookups() {
        let inv = inventory();
        let asset = inv.asset(10).await.unwrap();
        assert_eq!(asset.access_auth.cmd_ids, vec![1, 3]);
        assert!(asset.access_auth.allow);
        assert!(matches!(inv.asset(11).await, Err(StoreError::NotFound { .. })));
        let cmds = inv.commands(&asset.access_auth.cmd_ids).await.unwrap();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].enable);
        inv.set_connectable(10, true).await.unwrap();
        assert!(inv.list_assets().await.unwrap()[0].connectable);
    }

    #[tokio::test]
    async fn test_authorization() {
        let inv = inventory();
        let bob = inv.user("bob").await.unwrap();
        assert!(inv.authorized(&bob, 10, 20).await);
        assert!(!inv.authorized(&bob, 10, 21).await);
        assert!(!inv.authorized(&bob, 11, 20).await);
        let alice = inv.user("alice").await.unwrap();
        assert!(inv.authorized(&alice, 11, 99).await);

        assert_eq!(inv.grants(&bob).await, vec![(10, vec![20])]);
        assert_eq!(inv.grants(&alice).await, vec![(10, Vec::new())]);
    }

    #[tokio::test]
    async fn test_password_and_public_key() {
        let inv = inventory();
        assert_eq!(inv.verify_password("bob", "password").await.unwrap().uid, 7);
        assert!(inv.verify_password("bob", "nope").await.is_none());
        assert!(inv.verify_password("alice", "").await.is_none());
        let key = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIKey";
        assert!(inv.verify_public_key("bob", key).await.is_some());
        assert!(inv.verify_public_key("bob", "ssh-ed25519 other").await.is_none());
    }

    #[tokio::test]
    async fn test_api_key() {
        let inv = inventory();
        let mut payload = BTreeMap::new();
        payload.insert("w".to_string(), "80".to_string());
        let sig = api_signature("/connect/10/20/ssh", "s3cret", &payload);
        let user = inv
            .authenticate_key("k1", &sig, "/connect/10/20/ssh", &payload)
            .await
            .unwrap();
        assert_eq!(user.uid, 99);
        assert!(user.is_admin());
        assert!(inv
            .authenticate_key("k1", &sig, "/connect/10/20/rdp", &payload)
            .await
            .is_none());
        assert!(inv.authenticate_key("k2", &sig, "/x", &payload).await.is_none());
    }

    #[tokio::test]
    async fn test_share_uses() {
        let inv = inventory();
        assert_eq!(inv.share("abc").await.unwrap().times, Some(1));
        assert!(inv.consume_share("abc").await.unwrap());
        assert!(!inv.consume_share("abc").await.unwrap());
        assert!(inv.consume_share("zzz").await.is_err());
    }
}
