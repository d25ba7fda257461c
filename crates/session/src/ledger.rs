//! Session ledger: Append-only per-thread record of goals, decisions and
//! file changes.
//!
//! Entries are timestamped on arrival and never changed afterwards. In file
//! mode every thread gets `<dir>/<thread>.jsonl` for entries and
//! `<dir>/<thread>.handoffs.jsonl` for handoffs. Thread ids are reduced to
//! `[A-Za-z0-9_-]` for file names; the real id lives in each record, so
//! records are grouped by that field when loaded.

use crate::handoff::{Handoff, HandoffReason};
use chrono::{DateTime, Utc};
use senseloop_core::error::LedgerError;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ENTRIES_EXT: &str = ".jsonl";
const HANDOFFS_EXT: &str = ".handoffs.jsonl";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Goal,
    Decision,
    FileChange,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub thread_id: String,
    pub kind: EntryKind,
    pub content: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Default)]
struct ThreadLedger {
    entries: Vec<LedgerEntry>,
    handoffs: Vec<Handoff>,
}

pub struct SessionLedger {
    dir: Option<PathBuf>,
    threads: RwLock<HashMap<String, ThreadLedger>>,
}

impl SessionLedger {
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            threads: RwLock::new(HashMap::new()),
        }
    }

    /// Open (or create) a ledger directory and load everything in it.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to create ledger dir: {e}")))?;

        let mut threads: HashMap<String, ThreadLedger> = HashMap::new();
        let mut files = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to list ledger dir: {e}")))?;

        while let Some(file) = files
            .next_entry()
            .await
            .map_err(|e| LedgerError::Storage(format!("Failed to list ledger dir: {e}")))?
        {
            let path = file.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(HANDOFFS_EXT) {
                for handoff in read_lines::<Handoff>(&path).await? {
                    threads
                        .entry(handoff.thread_id.clone())
                        .or_default()
                        .handoffs
                        .push(handoff);
                }
            } else if name.ends_with(ENTRIES_EXT) {
                for entry in read_lines::<LedgerEntry>(&path).await? {
                    threads
                        .entry(entry.thread_id.clone())
                        .or_default()
                        .entries
                        .push(entry);
                }
            }
        }

        for ledger in threads.values_mut() {
            ledger.entries.sort_by_key(|e| e.recorded_at);
            ledger.handoffs.sort_by_key(|h| h.created_at);
        }

        info!(dir = %dir.display(), threads = threads.len(), "Session ledger opened");
        Ok(Self {
            dir: Some(dir),
            threads: RwLock::new(threads),
        })
    }

    pub async fn record(
        &self,
        thread_id: &str,
        kind: EntryKind,
        content: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        let entry = LedgerEntry {
            thread_id: thread_id.to_string(),
            kind,
            content: content.into(),
            recorded_at: Utc::now(),
        };

        let mut threads = self.threads.write().await;
        if let Some(dir) = &self.dir {
            append_line(&dir.join(file_name(thread_id, ENTRIES_EXT)), &entry).await?;
        }
        threads
            .entry(thread_id.to_string())
            .or_default()
            .entries
            .push(entry.clone());
        debug!(thread_id, kind = ?kind, "Ledger entry recorded");
        Ok(entry)
    }

    pub async fn record_goal(
        &self,
        thread_id: &str,
        content: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.record(thread_id, EntryKind::Goal, content).await
    }

    pub async fn record_decision(
        &self,
        thread_id: &str,
        content: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.record(thread_id, EntryKind::Decision, content).await
    }

    pub async fn record_file_change(
        &self,
        thread_id: &str,
        content: impl Into<String>,
    ) -> Result<LedgerEntry, LedgerError> {
        self.record(thread_id, EntryKind::FileChange, content).await
    }

    pub async fn entries(&self, thread_id: &str) -> Vec<LedgerEntry> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .map(|t| t.entries.clone())
            .unwrap_or_default()
    }

    /// Snapshot the thread's full ledger and keep it as the latest handoff.
    pub async fn create_handoff(
        &self,
        thread_id: &str,
        reason: HandoffReason,
    ) -> Result<Handoff, LedgerError> {
        let mut threads = self.threads.write().await;
        let ledger = threads.entry(thread_id.to_string()).or_default();
        let handoff = Handoff {
            id: Uuid::new_v4().to_string(),
            thread_id: thread_id.to_string(),
            reason,
            entries: ledger.entries.clone(),
            created_at: Utc::now(),
        };

        if let Some(dir) = &self.dir {
            append_line(&dir.join(file_name(thread_id, HANDOFFS_EXT)), &handoff).await?;
        }
        ledger.handoffs.push(handoff.clone());
        info!(thread_id, reason = %handoff.reason, entries = handoff.entries.len(), "Handoff created");
        Ok(handoff)
    }

    pub async fn most_recent_handoff(&self, thread_id: &str) -> Option<Handoff> {
        self.threads
            .read()
            .await
            .get(thread_id)
            .and_then(|t| t.handoffs.last().cloned())
    }
}

/// File name for a thread: anything outside `[A-Za-z0-9_-]` becomes `_`.
fn file_name(thread_id: &str, ext: &str) -> String {
    let mut stem: String = thread_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        stem.push('_');
    }
    stem + ext
}

async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let mut line = serde_json::to_string(value)
        .map_err(|e| LedgerError::Serialization(e.to_string()))?;
    line.push('\n');

    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to open {}: {e}", path.display())))?;
    file.write_all(line.as_bytes())
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to append to {}: {e}", path.display())))?;
    file.flush()
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to flush {}: {e}", path.display())))
}

async fn read_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LedgerError> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| LedgerError::Storage(format!("Failed to read {}: {e}", path.display())))?;
    Ok(content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Skipping corrupt ledger line");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_are_per_thread_and_ordered() {
        let ledger = SessionLedger::in_memory();
        ledger.record_goal("t1", "plan trip").await.unwrap();
        ledger.record_decision("t1", "go in May").await.unwrap();
        ledger.record_goal("t2", "other thread").await.unwrap();

        let entries = ledger.entries("t1").await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, EntryKind::Goal);
        assert_eq!(entries[1].content, "go in May");
        assert!(entries[0].recorded_at <= entries[1].recorded_at);
        assert!(ledger.entries("missing").await.is_empty());
    }

    #[tokio::test]
    async fn handoff_snapshots_the_ledger() {
        let ledger = SessionLedger::in_memory();
        assert!(ledger.most_recent_handoff("t1").await.is_none());

        ledger.record_goal("t1", "first").await.unwrap();
        let first = ledger
            .create_handoff("t1", HandoffReason::ContextExhausted)
            .await
            .unwrap();
        assert_eq!(first.entries.len(), 1);

        ledger.record_file_change("t1", "README.md").await.unwrap();
        let second = ledger
            .create_handoff("t1", HandoffReason::ManualRequest)
            .await
            .unwrap();

        // Earlier snapshot is unaffected by later writes.
        assert_eq!(first.entries.len(), 1);
        assert_eq!(second.entries.len(), 2);
        assert_eq!(ledger.most_recent_handoff("t1").await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn file_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let thread = "chat;+1 (555) 010-9999";
        {
            let ledger = SessionLedger::open(dir.path()).await.unwrap();
            ledger.record_goal(thread, "book flights").await.unwrap();
            ledger.record_decision(thread, "aisle seat").await.unwrap();
            ledger
                .create_handoff(thread, HandoffReason::SessionInvalidated)
                .await
                .unwrap();
        }

        let stem = "chat__1__555__010-9999";
        assert!(dir.path().join(format!("{stem}.jsonl")).exists());
        assert!(dir.path().join(format!("{stem}.handoffs.jsonl")).exists());

        let reopened = SessionLedger::open(dir.path()).await.unwrap();
        let entries = reopened.entries(thread).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].thread_id, thread);
        let handoff = reopened.most_recent_handoff(thread).await.unwrap();
        assert_eq!(handoff.reason, HandoffReason::SessionInvalidated);
        assert_eq!(handoff.entries.len(), 2);
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger = SessionLedger::open(dir.path()).await.unwrap();
            ledger.record_goal("t1", "keep me").await.unwrap();
        }
        let path = dir.path().join("t1.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json\n");
        std::fs::write(&path, content).unwrap();

        let reopened = SessionLedger::open(dir.path()).await.unwrap();
        assert_eq!(reopened.entries("t1").await.len(), 1);
    }

    #[test]
    fn file_names_are_sanitized() {
        assert_eq!(file_name("abc-1_2", ENTRIES_EXT), "abc-1_2.jsonl");
        assert_eq!(file_name("../etc/passwd", ENTRIES_EXT), "___etc_passwd.jsonl");
        assert_eq!(file_name("", HANDOFFS_EXT), "_.handoffs.jsonl");
    }
}
