//! JSONL transcript of the protocol traffic of one adapter connection.

use crate::Result;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
    Internal,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Outbound => "outbound",
            Direction::Inbound => "inbound",
            Direction::Internal => "internal",
        }
    }
}

pub struct TrafficLog {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl TrafficLog {
    pub async fn create(dir: &Path, label: &str) -> Result<Self> {
        tokio::fs::create_dir_all(dir).await?;

        let filename = format!("dap_session_{label}_{}.jsonl", timestamp_millis());
        let path = dir.join(filename);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one line; transcript failures never interrupt the session.
    pub async fn record(&self, direction: Direction, payload: &Value) {
        if let Err(e) = self.append(direction, payload).await {
            warn!("Failed to append to DAP transcript {}: {}", self.path.display(), e);
        }
    }

    async fn append(&self, direction: Direction, payload: &Value) -> Result<()> {
        let envelope = json!({
            "ts_ms": timestamp_millis(),
            "direction": direction.as_str(),
            "kind": classify_message(payload),
            "payload": payload,
        });
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

fn classify_message(payload: &Value) -> &'static str {
    match payload.get("type").and_then(Value::as_str) {
        Some("request") => "request",
        Some("response") => "response",
        Some("event") => "event",
        _ => "other",
    }
}

fn timestamp_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
