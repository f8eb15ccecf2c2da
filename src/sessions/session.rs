//! The live session aggregate.
//!
//! A [`Session`] owns everything tied to one connection: the audit record,
//! read-only snapshots of asset/account/gateway, the parser and recorder,
//! monitor sinks and the teardown signal. Adapter tasks hold an `Arc` to it;
//! the orchestrator is the only writer of the record.

use std::sync::OnceLock;

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::channels::Away;
use super::task_group::TaskGroup;
use super::transport::ClientSink;
use crate::guacd::tunnel::Viewport;
use crate::model::{Account, Asset, Gateway, SessionRecord};
use crate::protocols::Protocol;
use crate::recorder::Recorder;
use crate::ssh::SshHandle;
use crate::terminal::CommandParser;

pub struct SessionInit {
    pub record: SessionRecord,
    pub asset: Asset,
    pub account: Account,
    pub gateway: Option<Gateway>,
    pub protocol: Protocol,
    pub viewport: Viewport,
    pub lang: String,
    pub parser: Option<CommandParser>,
    pub recorder: Option<Recorder>,
}

pub struct Session {
    pub id: String,
    pub asset: Asset,
    pub account: Account,
    pub gateway: Option<Gateway>,
    pub protocol: Protocol,
    pub viewport: Viewport,
    pub lang: String,
    pub parser: Option<CommandParser>,
    pub recorder: Option<Recorder>,
    pub away: Away,
    pub group: TaskGroup,
    record: Mutex<SessionRecord>,
    monitors: DashMap<String, ClientSink>,
    close_by: mpsc::Sender<String>,
    connection_id: OnceLock<String>,
    ssh_client: Mutex<Option<SshHandle>>,
}

impl Session {
    /// Build a session; the receiver yields administrator close requests.
    pub fn new(init: SessionInit) -> (Self, mpsc::Receiver<String>) {
        let (close_by, close_rx) = mpsc::channel(1);
        let session = Self {
            id: init.record.session_id.clone(),
            asset: init.asset,
            account: init.account,
            gateway: init.gateway,
            protocol: init.protocol,
            viewport: init.viewport,
            lang: init.lang,
            parser: init.parser,
            recorder: init.recorder,
            away: Away::new(),
            group: TaskGroup::new(),
            record: Mutex::new(init.record),
            monitors: DashMap::new(),
            close_by,
            connection_id: OnceLock::new(),
            ssh_client: Mutex::new(None),
        };
        (session, close_rx)
    }

    pub fn record(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    /// Flip to offline. Returns the updated record only on the first call.
    pub fn mark_offline(&self) -> Option<SessionRecord> {
        let mut record = self.record.lock();
        record.mark_offline(Utc::now()).then(|| record.clone())
    }

    /// Ask the control loop to end the session on behalf of `admin`.
    pub fn request_close(&self, admin: &str) -> bool {
        self.close_by.try_send(admin.to_string()).is_ok()
    }

    pub fn add_monitor(&self, key: String, sink: ClientSink) {
        self.monitors.insert(key, sink);
    }

    pub fn remove_monitor(&self, key: &str) {
        self.monitors.remove(key);
    }

    /// Queue `text` on every monitor without waiting. A monitor that is gone
    /// or whose queue is full is detached; returns how many were.
    pub fn fan_out(&self, text: &str) -> usize {
        let mut dropped = 0;
        self.monitors.retain(|key, sink| {
            let kept = sink.try_send_text(text);
            if !kept {
                debug!("Session {} detaching lagging monitor {key}", self.id);
                dropped += 1;
            }
            kept
        });
        dropped
    }

    pub fn has_monitor(&self, key: &str) -> bool {
        self.monitors.contains_key(key)
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Remove and return every monitor.
    pub fn drain_monitors(&self) -> Vec<ClientSink> {
        let keys: Vec<String> = self.monitors.iter().map(|m| m.key().clone()).collect();
        keys.iter()
            .filter_map(|k| self.monitors.remove(k).map(|(_, s)| s))
            .collect()
    }

    /// The guacd connection id, set once the handshake completes.
    pub fn set_connection_id(&self, id: String) {
        let _ = self.connection_id.set(id);
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection_id.get().map(String::as_str)
    }

    pub fn set_ssh_client(&self, handle: SshHandle) {
        *self.ssh_client.lock() = Some(handle);
    }

    pub fn take_ssh_client(&self) -> Option<SshHandle> {
        self.ssh_client.lock().take()
    }
}
