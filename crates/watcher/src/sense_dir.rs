//! Sense directory source: one JSON [`SenseEvent`] per file.
//!
//! Files are taken in modification-time order (name breaks ties) and given
//! per-process ids above the last cursor. Every file present is pending work,
//! so the tail is always `0`. A delivered file is deleted; a file that fails
//! to decode, or whose handler failed, is renamed with a `.failed` suffix so
//! it is not picked up again.

use crate::signal::ChangeSignal;
use crate::source::{DispatchOutcome, EventSource, SourceRecord};
use async_trait::async_trait;
use senseloop_core::error::SourceError;
use senseloop_core::event::SenseEvent;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::SystemTime;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// A decoded sense file.
#[derive(Debug, Clone)]
pub struct SenseRecord {
    pub id: u64,
    pub path: PathBuf,
    pub event: SenseEvent,
}

impl SourceRecord for SenseRecord {
    fn cursor_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Default)]
struct IdAssignments {
    next_id: u64,
    by_path: HashMap<PathBuf, u64>,
}

pub struct SenseDirectorySource {
    name: String,
    dir: PathBuf,
    ids: Mutex<IdAssignments>,
    signal: Option<ChangeSignal>,
}

impl SenseDirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            name: "sense".into(),
            dir: dir.into(),
            ids: Mutex::new(IdAssignments {
                next_id: 1,
                by_path: HashMap::new(),
            }),
            signal: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Create the directory if needed and watch it for changes.
    pub fn with_change_signal(mut self) -> Result<Self, SourceError> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| SourceError::Io(format!("Failed to create {}: {e}", self.dir.display())))?;
        self.signal = Some(ChangeSignal::watch(&self.dir)?);
        Ok(self)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Pending `*.json` files sorted by modification time, then name.
    async fn pending_files(&self) -> Result<Vec<PathBuf>, SourceError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => {
                return Err(SourceError::Io(format!(
                    "Failed to read {}: {e}",
                    self.dir.display()
                )));
            }
        };

        let mut files: Vec<(SystemTime, PathBuf)> = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SourceError::Io(e.to_string()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                // Removed between listing and stat.
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            files.push((meta.modified().unwrap_or(SystemTime::UNIX_EPOCH), path));
        }
        files.sort();
        Ok(files.into_iter().map(|(_, path)| path).collect())
    }

    fn assign_id(&self, path: &Path, last_id: u64) -> u64 {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if ids.next_id <= last_id {
            ids.next_id = last_id + 1;
        }
        match ids.by_path.get(path) {
            // A file still present after dispatch (acknowledgement failed)
            // is offered again under a fresh id.
            Some(id) if *id > last_id => *id,
            _ => {
                let id = ids.next_id;
                ids.next_id += 1;
                ids.by_path.insert(path.to_path_buf(), id);
                id
            }
        }
    }

    fn forget(&self, path: &Path) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .by_path
            .remove(path);
    }

    async fn quarantine(&self, path: &Path) -> Result<(), SourceError> {
        let mut failed = path.as_os_str().to_owned();
        failed.push(".failed");
        tokio::fs::rename(path, &failed)
            .await
            .map_err(|e| SourceError::Io(format!("Failed to quarantine {}: {e}", path.display())))?;
        self.forget(path);
        Ok(())
    }
}

#[async_trait]
impl EventSource for SenseDirectorySource {
    type Record = SenseRecord;

    fn name(&self) -> &str {
        &self.name
    }

    async fn tail_id(&self) -> Result<u64, SourceError> {
        Ok(0)
    }

    async fn fetch_after(&self, last_id: u64, limit: usize) -> Result<Vec<SenseRecord>, SourceError> {
        let mut records = Vec::new();
        for path in self.pending_files().await? {
            if records.len() >= limit {
                break;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(SourceError::Io(format!("Failed to read {}: {e}", path.display()))),
            };
            let event = match serde_json::from_slice::<SenseEvent>(&bytes) {
                Ok(event) => event,
                Err(e) => {
                    warn!(source = %self.name, path = %path.display(), error = %e, "Undecodable sense file");
                    if let Err(e) = self.quarantine(&path).await {
                        warn!(source = %self.name, error = %e, "Could not move undecodable file aside");
                    }
                    continue;
                }
            };
            let id = self.assign_id(&path, last_id);
            records.push(SenseRecord { id, path, event });
        }
        records.sort_by_key(|r| r.id);
        debug!(source = %self.name, count = records.len(), "Sense files fetched");
        Ok(records)
    }

    async fn acknowledge(&self, record: &SenseRecord, outcome: DispatchOutcome) -> Result<(), SourceError> {
        match outcome {
            DispatchOutcome::Delivered => {
                match tokio::fs::remove_file(&record.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(SourceError::Io(format!(
                            "Failed to remove {}: {e}",
                            record.path.display()
                        )));
                    }
                }
                self.forget(&record.path);
                Ok(())
            }
            DispatchOutcome::Failed => self.quarantine(&record.path).await,
        }
    }

    fn change_signal(&self) -> Option<Arc<Notify>> {
        self.signal.as_ref().map(ChangeSignal::notify)
    }
}
