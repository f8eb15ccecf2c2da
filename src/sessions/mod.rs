//! Live sessions and the plumbing between client, orchestrator and adapter.
//!
//! ```text
//! channels.rs   — Away (once-close), in/out pipes, window, readiness
//! task_group.rs — TaskGroup: shared cancellation, first error wins
//! transport.rs  — ClientSink/ClientSource over WebSocket or SSH channel
//! utf8.rs       — rune-boundary pump from the out-pipe
//! session.rs    — Session aggregate
//! ```
//!
//! [`SessionRegistry`] is the online map. Orchestrators insert and remove
//! their own session; monitor, close and listing endpoints only read it.

pub mod channels;
pub mod session;
pub mod task_group;
pub mod transport;
pub mod utf8;

use std::sync::Arc;

use dashmap::DashMap;

use crate::model::SessionRecord;
pub use channels::{Away, WindowSize, MAX_COLS, MAX_ROWS};
pub use session::{Session, SessionInit};
pub use task_group::TaskGroup;
pub use transport::{ClientSink, ClientSource, Inbound, Outbound};

#[derive(Clone, Default)]
pub struct SessionRegistry {
    online: Arc<DashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, session: Arc<Session>) {
        self.online.insert(session.id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        self.online.get(session_id).map(|s| Arc::clone(s.value()))
    }

    pub fn remove(&self, session_id: &str) -> Option<Arc<Session>> {
        self.online.remove(session_id).map(|(_, s)| s)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.online.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.online.len()
    }

    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }

    /// Records of every online session, oldest first.
    pub fn records(&self) -> Vec<SessionRecord> {
        let mut records: Vec<_> = self.online.iter().map(|s| s.record()).collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Signal every session to tear down.
    pub fn close_all(&self) -> usize {
        self.online.iter().filter(|s| s.away.close()).count()
    }
}
