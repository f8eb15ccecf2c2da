//! Append-only audit journal.
//!
//! Session state changes and audited commands go to
//! `$DATA_DIR/audit/audit.jsonl`, one tagged JSON object per line. On
//! startup the journal is scanned to find sessions that were still online
//! when the process last stopped.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::model::{SessionCmd, SessionRecord};

const FILE_NAME: &str = "audit.jsonl";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEntry {
    Session(SessionRecord),
    Command(SessionCmd),
}

/// Handle to the background journal writer.
#[derive(Clone)]
pub struct AuditJournal {
    tx: mpsc::Sender<AuditEntry>,
    alive: Arc<AtomicBool>,
}

impl AuditJournal {
    /// Open (or create) the journal in `dir` and spawn the writer.
    pub async fn open(dir: &Path) -> Result<Self, std::io::Error> {
        fs::create_dir_all(dir).await?;
        let path = dir.join(FILE_NAME);
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let (tx, rx) = mpsc::channel(10_000);
        let alive = Arc::new(AtomicBool::new(true));
        tokio::spawn(journal_writer_task(file, rx, Arc::clone(&alive)));
        Ok(Self { tx, alive })
    }

    pub async fn append(&self, entry: AuditEntry) {
        if self.tx.send(entry).await.is_err() {
            warn!("Audit journal writer is gone, dropping entry");
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }
}

async fn journal_writer_task(
    file: fs::File,
    mut rx: mpsc::Receiver<AuditEntry>,
    alive: Arc<AtomicBool>,
) {
    let mut file = tokio::io::BufWriter::new(file);
    while let Some(entry) = rx.recv().await {
        let mut batch = vec![entry];
        while let Ok(entry) = rx.try_recv() {
            batch.push(entry);
        }
        for entry in batch {
            let mut line = match serde_json::to_vec(&entry) {
                Ok(l) => l,
                Err(e) => {
                    error!("Audit serialize error: {e}");
                    continue;
                }
            };
            line.push(b'\n');
            if let Err(e) = file.write_all(&line).await {
                error!("Audit write error: {e}");
                alive.store(false, Ordering::Relaxed);
                return;
            }
        }
        if let Err(e) = file.flush().await {
            error!("Audit flush error: {e}");
            alive.store(false, Ordering::Relaxed);
            return;
        }
    }
}

/// Replay the journal in `dir` and return the last record of every session
/// whose final state is online.
pub async fn recover_online(dir: &Path) -> Vec<SessionRecord> {
    let path = dir.join(FILE_NAME);
    let Ok(file) = fs::File::open(&path).await else {
        return Vec::new();
    };
    let mut lines = BufReader::new(file).lines();
    let mut latest: HashMap<String, SessionRecord> = HashMap::new();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(AuditEntry::Session(rec)) => {
                latest.insert(rec.session_id.clone(), rec);
            }
            Ok(AuditEntry::Command(_)) => {}
            Err(e) => warn!("Skipping corrupt audit line: {e}"),
        }
    }

    let online: Vec<SessionRecord> = latest.into_values().filter(SessionRecord::is_online).collect();
    if !online.is_empty() {
        info!("Recovered {} sessions left online", online.len());
    }
    online
}
