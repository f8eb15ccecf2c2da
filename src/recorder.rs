//! Asciinema v2 session recorder.
//!
//! Events are serialized on the caller's task and handed to a background
//! writer that appends them to a staging file. [`Recorder::close`] drains the
//! writer and uploads the finished cast through the replay [`Provider`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::storage::{PathStrategy, Provider, StorageError};

#[derive(Serialize)]
struct Header<'a> {
    version: u8,
    width: usize,
    height: usize,
    timestamp: i64,
    title: &'a str,
    env: HeaderEnv,
}

#[derive(Serialize)]
struct HeaderEnv {
    #[serde(rename = "SHELL")]
    shell: &'static str,
    #[serde(rename = "TERM")]
    term: &'static str,
}

pub struct Recorder {
    session_id: String,
    started: Instant,
    started_at: DateTime<Utc>,
    path: PathBuf,
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl Recorder {
    /// Create `{staging}/{session_id}.cast` and write the header line.
    pub async fn create(
        staging: &Path,
        session_id: &str,
        width: usize,
        height: usize,
    ) -> Result<Self, std::io::Error> {
        fs::create_dir_all(staging).await?;
        let path = staging.join(format!("{session_id}.cast"));
        let mut file = fs::File::create(&path).await?;

        let started_at = Utc::now();
        let header = Header {
            version: 2,
            width,
            height,
            timestamp: started_at.timestamp(),
            title: session_id,
            env: HeaderEnv {
                shell: "/bin/bash",
                term: "xterm-256color",
            },
        };
        let mut line = serde_json::to_vec(&header)?;
        line.extend_from_slice(b"\r\n");
        file.write_all(&line).await?;
        file.flush().await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(recorder_writer_task(file, rx, session_id.to_string()));

        Ok(Self {
            session_id: session_id.to_string(),
            started: Instant::now(),
            started_at,
            path,
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record an output event. Invalid UTF-8 is replaced.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(data);
        self.push(&json!([self.elapsed(), "o", text]));
    }

    pub fn resize(&self, width: usize, height: usize) {
        self.push(&json!([self.elapsed(), "r", format!("{width}x{height}")]));
    }

    fn elapsed(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn push(&self, event: &serde_json::Value) {
        if let Some(tx) = self.tx.lock().as_ref() {
            let _ = tx.send(format!("{event}\r\n"));
        }
    }

    /// Stop recording and hand the cast to `provider`. Returns the storage
    /// key, or `None` when already closed.
    pub async fn close(
        &self,
        provider: &Arc<dyn Provider>,
        strategy: PathStrategy,
    ) -> Result<Option<String>, StorageError> {
        drop(self.tx.lock().take());
        let Some(writer) = self.writer.lock().take() else {
            return Ok(None);
        };
        let _ = writer.await;

        let key = strategy.replay_key(&self.session_id, self.started_at);
        let size = fs::metadata(&self.path).await?.len();
        let file = fs::File::open(&self.path).await?;
        provider.upload(&key, Box::new(file), size).await?;
        if let Err(e) = fs::remove_file(&self.path).await {
            debug!("Session {} staging cleanup: {e}", self.session_id);
        }
        Ok(Some(key))
    }
}

async fn recorder_writer_task(
    file: fs::File,
    mut rx: mpsc::UnboundedReceiver<String>,
    session_id: String,
) {
    let mut file = tokio::io::BufWriter::new(file);
    while let Some(line) = rx.recv().await {
        if let Err(e) = file.write_all(line.as_bytes()).await {
            error!("Session {session_id} replay write error: {e}");
            return;
        }
        while let Ok(line) = rx.try_recv() {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                error!("Session {session_id} replay write error: {e}");
                return;
            }
        }
        if let Err(e) = file.flush().await {
            error!("Session {session_id} replay flush error: {e}");
            return;
        }
    }
    let _ = file.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalProvider;

    #[tokio::test]
    async fn test_cast_layout_and_output_concat() {
        let staging = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new(store.path()).await.unwrap());

        let rec = Recorder::create(staging.path(), "s1", 80, 24).await.unwrap();
        let chunks: [&[u8]; 4] = [b"ls\r\n", "caf\u{e9} \"q\"".as_bytes(), b"\x1b[0m", b"$ "];
        rec.write(chunks[0]);
        rec.write(chunks[1]);
        rec.resize(100, 30);
        rec.write(chunks[2]);
        rec.write(b"");
        rec.write(chunks[3]);

        let key = rec
            .close(&provider, PathStrategy::Flat)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "s1.cast");
        assert!(!rec.path().exists());
        assert!(rec.close(&provider, PathStrategy::Flat).await.unwrap().is_none());

        let body = std::fs::read_to_string(store.path().join("s1.cast")).unwrap();
        assert!(body.starts_with("{\"version\":2,\"width\":80,"));
        let lines: Vec<&str> = body.split_terminator("\r\n").collect();
        assert_eq!(lines.len(), 6);

        let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 80);
        assert_eq!(header["env"]["TERM"], "xterm-256color");

        let mut output = Vec::new();
        let mut last = 0.0;
        for line in &lines[1..] {
            let ev: serde_json::Value = serde_json::from_str(line).unwrap();
            let t = ev[0].as_f64().unwrap();
            assert!(t >= last);
            last = t;
            match ev[1].as_str().unwrap() {
                "o" => output.extend_from_slice(ev[2].as_str().unwrap().as_bytes()),
                "r" => assert_eq!(ev[2], "100x30"),
                other => panic!("unexpected event {other}"),
            }
        }
        assert_eq!(output, chunks.concat());
    }

    #[tokio::test]
    async fn test_date_hierarchy_key() {
        let staging = tempfile::tempdir().unwrap();
        let store = tempfile::tempdir().unwrap();
        let provider: Arc<dyn Provider> = Arc::new(LocalProvider::new(store.path()).await.unwrap());
        let rec = Recorder::create(staging.path(), "s2", 80, 24).await.unwrap();
        let key = rec
            .close(&provider, PathStrategy::DateHierarchy)
            .await
            .unwrap()
            .unwrap();
        assert!(key.ends_with("/s2.cast"));
        assert!(store.path().join(&key).exists());
    }
}
