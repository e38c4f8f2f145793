//! Pluggable delivery audit trail.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::delivery::types::DeliveryRecord;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("audit encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Destination for delivery records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record(&self, record: &DeliveryRecord) -> Result<(), AuditError>;

    /// Up to `limit` records for one subscription, newest first.
    async fn history(&self, subscription_id: &str, limit: usize) -> Result<Vec<DeliveryRecord>, AuditError>;
}

/// Bounded in-memory sink; the oldest records are evicted first.
#[derive(Debug)]
pub struct MemoryAuditSink {
    capacity: usize,
    records: Mutex<VecDeque<DeliveryRecord>>,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            records: Mutex::new(VecDeque::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: &DeliveryRecord) -> Result<(), AuditError> {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }

    async fn history(&self, subscription_id: &str, limit: usize) -> Result<Vec<DeliveryRecord>, AuditError> {
        Ok(self
            .records
            .lock()
            .iter()
            .rev()
            .filter(|r| r.subscription_id == subscription_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Append-only JSON-lines file; survives restarts.
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl JsonlAuditSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn record(&self, record: &DeliveryRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn history(&self, subscription_id: &str, limit: usize) -> Result<Vec<DeliveryRecord>, AuditError> {
        // Holding the writer lock keeps a half-written line out of the read.
        let _writer = self.file.lock().await;
        let content = tokio::fs::read_to_string(&self.path).await?;

        let mut matching = Vec::new();
        for line in content.lines().rev() {
            if matching.len() == limit {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<DeliveryRecord>(line) {
                Ok(record) if record.subscription_id == subscription_id => matching.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, path = %self.path.display(), "Skipping corrupt audit line"),
            }
        }
        Ok(matching)
    }
}
