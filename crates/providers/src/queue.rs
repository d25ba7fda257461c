//! Deferred request queue: The last tier of the fallback chain.
//!
//! [`FileRequestQueue`] appends one JSON line per request; corrupted lines
//! are skipped with a warning when the file is read back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use senseloop_core::error::QueueError;
use senseloop_core::tier::TaskComplexity;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A request nobody could answer yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedRequest {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub prompt: String,
    pub complexity: TaskComplexity,
    pub queued_at: DateTime<Utc>,
    /// Why the earlier tiers gave up.
    pub reason: String,
}

impl QueuedRequest {
    pub fn new(
        thread_id: Option<&str>,
        prompt: &str,
        complexity: TaskComplexity,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.map(str::to_owned),
            prompt: prompt.to_string(),
            complexity,
            queued_at: Utc::now(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait RequestQueue: Send + Sync {
    async fn enqueue(&self, request: QueuedRequest) -> Result<(), QueueError>;

    /// Everything queued, oldest first.
    async fn pending(&self) -> Result<Vec<QueuedRequest>, QueueError>;

    /// Remove and return everything queued.
    async fn drain(&self) -> Result<Vec<QueuedRequest>, QueueError>;

    /// Number of requests waiting.
    async fn depth(&self) -> Result<usize, QueueError> {
        Ok(self.pending().await?.len())
    }
}

pub struct FileRequestQueue {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileRequestQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn read_all(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(QueueError::Storage(format!("Failed to read queue: {e}"))),
        };
        Ok(content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<QueuedRequest>(line) {
                Ok(request) => Some(request),
                Err(e) => {
                    warn!(error = %e, "Skipping corrupted queue entry");
                    None
                }
            })
            .collect())
    }
}

#[async_trait]
impl RequestQueue for FileRequestQueue {
    async fn enqueue(&self, request: QueuedRequest) -> Result<(), QueueError> {
        let _guard = self.lock.lock().await;
        let mut line = serde_json::to_string(&request)
            .map_err(|e| QueueError::Serialization(e.to_string()))?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| QueueError::Storage(format!("Failed to create queue dir: {e}")))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to open queue: {e}")))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to append to queue: {e}")))?;
        file.flush()
            .await
            .map_err(|e| QueueError::Storage(format!("Failed to flush queue: {e}")))?;

        debug!(id = %request.id, "Request queued");
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        let _guard = self.lock.lock().await;
        self.read_all().await
    }

    async fn drain(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        let _guard = self.lock.lock().await;
        let requests = self.read_all().await?;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(QueueError::Storage(format!("Failed to clear queue: {e}"))),
        }
        Ok(requests)
    }
}

/// Keeps queued requests in memory only.
#[derive(Default)]
pub struct InMemoryRequestQueue {
    requests: Mutex<Vec<QueuedRequest>>,
}

impl InMemoryRequestQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RequestQueue for InMemoryRequestQueue {
    async fn enqueue(&self, request: QueuedRequest) -> Result<(), QueueError> {
        self.requests.lock().await.push(request);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        Ok(self.requests.lock().await.clone())
    }

    async fn drain(&self) -> Result<Vec<QueuedRequest>, QueueError> {
        Ok(std::mem::take(&mut *self.requests.lock().await))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_queue_appends_and_drains() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileRequestQueue::new(dir.path().join("state").join("queue.jsonl"));

        let first = QueuedRequest::new(Some("chat-1"), "plan my week", TaskComplexity::Complex, "all tiers down");
        let second = QueuedRequest::new(None, "status?", TaskComplexity::StatusQuery, "local unavailable");
        queue.enqueue(first.clone()).await.unwrap();
        queue.enqueue(second.clone()).await.unwrap();

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending, vec![first.clone(), second.clone()]);

        // A fresh handle on the same file sees what is waiting.
        let reopened = FileRequestQueue::new(dir.path().join("state").join("queue.jsonl"));
        assert_eq!(reopened.depth().await.unwrap(), 2);

        let drained = queue.drain().await.unwrap();
        assert_eq!(drained.len(), 2);
        assert!(queue.pending().await.unwrap().is_empty());
        assert_eq!(queue.depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupted_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.jsonl");
        let queue = FileRequestQueue::new(&path);
        queue
            .enqueue(QueuedRequest::new(None, "hi", TaskComplexity::Complex, "x"))
            .await
            .unwrap();
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{garbage\n");
        std::fs::write(&path, content).unwrap();

        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn in_memory_queue() {
        let queue = InMemoryRequestQueue::new();
        queue
            .enqueue(QueuedRequest::new(None, "hi", TaskComplexity::SimpleAck, "x"))
            .await
            .unwrap();
        assert_eq!(queue.pending().await.unwrap().len(), 1);
        assert_eq!(queue.drain().await.unwrap().len(), 1);
        assert!(queue.pending().await.unwrap().is_empty());
    }
}
