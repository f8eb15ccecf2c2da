//! Domain records: assets, accounts, gateways, sessions and audit entries.
//!
//! These are plain serde structs. The inventory file deserializes straight
//! into them and the audit journal serializes [`SessionRecord`] and
//! [`SessionCmd`] as JSON lines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How an account or gateway authenticates over SSH.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    PublicKey,
}

/// Weekly access window: `week` is 0 for Monday through 6 for Sunday and
/// `times` holds `"HH:MM~HH:MM"` spans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub week: u32,
    #[serde(default)]
    pub times: Vec<String>,
}

/// Access rules attached to an asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessAuth {
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Ids of forbidden command rules applied to terminal sessions.
    #[serde(default)]
    pub cmd_ids: Vec<u64>,
    #[serde(default)]
    pub ranges: Vec<TimeRange>,
    /// Whether a matching range grants (true) or denies (false) access.
    #[serde(default = "default_allow")]
    pub allow: bool,
}

fn default_allow() -> bool {
    true
}

impl Default for AccessAuth {
    fn default() -> Self {
        Self {
            start: None,
            end: None,
            cmd_ids: Vec::new(),
            ranges: Vec::new(),
            allow: default_allow(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Asset {
    pub id: u64,
    pub name: String,
    /// Host or IP, optionally carrying an explicit port (`10.0.0.1:2222`).
    pub ip: String,
    /// Protocol list such as `["ssh:22", "rdp:3389"]`.
    #[serde(default)]
    pub protocols: Vec<String>,
    /// 0 when the asset is directly routable.
    #[serde(default)]
    pub gateway_id: u64,
    #[serde(default)]
    pub access_auth: AccessAuth,
    #[serde(default)]
    pub connectable: bool,
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub account_type: AuthMethod,
    /// Login name on the target.
    pub account: String,
    #[serde(default)]
    pub password: String,
    /// PEM/OpenSSH private key.
    #[serde(default)]
    pub pk: String,
    /// Passphrase for `pk`.
    #[serde(default)]
    pub phrase: String,
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("account_type", &self.account_type)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct Gateway {
    pub id: u64,
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    #[serde(default)]
    pub account_type: AuthMethod,
    pub account: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub pk: String,
    #[serde(default)]
    pub phrase: String,
}

fn default_ssh_port() -> u16 {
    22
}

impl fmt::Debug for Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

/// SSH credential material, shared by target accounts and jump hosts.
#[derive(Clone)]
pub struct Credential {
    pub user: String,
    pub method: AuthMethod,
    pub password: String,
    pub pk: String,
    pub phrase: String,
}

impl From<&Account> for Credential {
    fn from(a: &Account) -> Self {
        Self {
            user: a.account.clone(),
            method: a.account_type,
            password: a.password.clone(),
            pk: a.pk.clone(),
            phrase: a.phrase.clone(),
        }
    }
}

impl From<&Gateway> for Credential {
    fn from(g: &Gateway) -> Self {
        Self {
            user: g.account.clone(),
            method: g.account_type,
            password: g.password.clone(),
            pk: g.pk.clone(),
            phrase: g.phrase.clone(),
        }
    }
}

/// Forbidden command rule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    #[serde(default)]
    pub name: String,
    pub cmd: String,
    /// `cmd` is a regular expression rather than a literal substring.
    #[serde(default)]
    pub is_re: bool,
    #[serde(default = "default_enable")]
    pub enable: bool,
}

fn default_enable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionType {
    Web,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Online,
    Offline,
}

/// Persisted view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_type: SessionType,
    pub session_id: String,
    pub uid: u64,
    pub user_name: String,
    pub asset_id: u64,
    pub asset_info: String,
    pub account_id: u64,
    pub account_info: String,
    pub gateway_id: u64,
    pub gateway_info: String,
    pub client_ip: String,
    pub protocol: String,
    #[serde(default)]
    pub share_id: u64,
    #[serde(default)]
    pub share_end: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn is_online(&self) -> bool {
        self.status == SessionStatus::Online
    }

    /// Transition to offline. Returns false if the record already was.
    pub fn mark_offline(&mut self, at: DateTime<Utc>) -> bool {
        if self.status == SessionStatus::Offline {
            return false;
        }
        self.status = SessionStatus::Offline;
        self.closed_at = Some(at);
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmdLevel {
    Normal,
    Blocked,
}

/// One audited command and its observed result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCmd {
    pub session_id: String,
    pub cmd: String,
    pub result: String,
    pub level: CmdLevel,
    pub created_at: DateTime<Utc>,
}

/// Time-bounded link that opens a session without the creator present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Share {
    pub id: u64,
    pub uuid: String,
    pub uid: u64,
    pub user_name: String,
    pub asset_id: u64,
    pub account_id: u64,
    pub protocol: String,
    pub end: DateTime<Utc>,
    /// Remaining uses; `None` means unlimited.
    #[serde(default)]
    pub times: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyPaste {
    #[serde(default)]
    pub copy: bool,
    #[serde(default)]
    pub paste: bool,
}

impl Default for CopyPaste {
    fn default() -> Self {
        Self {
            copy: true,
            paste: true,
        }
    }
}

/// Runtime settings snapshot, refreshed periodically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    /// Idle timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub rdp: CopyPaste,
    #[serde(default)]
    pub vnc: CopyPaste,
}

fn default_timeout() -> u64 {
    3600
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            rdp: CopyPaste::default(),
            vnc: CopyPaste::default(),
        }
    }
}

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurrentUser {
    pub uid: u64,
    pub user_name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl CurrentUser {
    pub fn is_admin(&self) -> bool {
        self.roles
            .iter()
            .any(|r| r == "admin" || r == "acl_admin" || r == "jumpgate_admin")
    }
}
