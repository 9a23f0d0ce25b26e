//! Where finished executions and translations are reported. The engine
//! never waits on a tracker; failures are logged and dropped.

use crate::errors::{EngineError, Result};
use crate::translate::TranslationResult;
use crate::types::ExecutionResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionRecord {
    pub result: ExecutionResult,
    pub requester: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    /// Version of the policy snapshot the request was checked against
    pub policy_version: u64,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranslationRecord {
    pub result: TranslationResult,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TrackerEvent {
    Execution(ExecutionRecord),
    Translation(TranslationRecord),
}

#[async_trait]
pub trait ExecutionTracker: Send + Sync {
    async fn record_execution(&self, record: ExecutionRecord) -> Result<()>;

    async fn record_translation(&self, record: TranslationRecord) -> Result<()>;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTracker;

#[async_trait]
impl ExecutionTracker for NullTracker {
    async fn record_execution(&self, _record: ExecutionRecord) -> Result<()> {
        Ok(())
    }

    async fn record_translation(&self, _record: TranslationRecord) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file
pub struct JsonLinesTracker {
    path: PathBuf,
    file: Mutex<Option<tokio::fs::File>>,
}

impl JsonLinesTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, event: &TrackerEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        if file.is_none() {
            let opened = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            debug!("[TRACKER] Opened {:?}", self.path);
            *file = Some(opened);
        }
        if let Some(f) = file.as_mut() {
            f.write_all(&line).await?;
            f.flush().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionTracker for JsonLinesTracker {
    async fn record_execution(&self, record: ExecutionRecord) -> Result<()> {
        self.append(&TrackerEvent::Execution(record)).await
    }

    async fn record_translation(&self, record: TranslationRecord) -> Result<()> {
        self.append(&TrackerEvent::Translation(record)).await
    }
}

/// Forwards events to a channel
#[derive(Debug, Clone)]
pub struct ChannelTracker {
    sender: mpsc::UnboundedSender<TrackerEvent>,
}

impl ChannelTracker {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, event: TrackerEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| EngineError::Tracker("receiver dropped".to_string()))
    }
}

#[async_trait]
impl ExecutionTracker for ChannelTracker {
    async fn record_execution(&self, record: ExecutionRecord) -> Result<()> {
        self.send(TrackerEvent::Execution(record))
    }

    async fn record_translation(&self, record: TranslationRecord) -> Result<()> {
        self.send(TrackerEvent::Translation(record))
    }
}
