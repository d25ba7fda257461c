//! Persisted watcher cursors.
//!
//! Stored as `{"lastId": 42, "lastSaveTime": "..."}` and replaced atomically
//! (temporary file + rename), so a crash mid-write leaves the previous cursor.

use chrono::{DateTime, Utc};
use senseloop_core::session::write_atomic;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("Cursor file I/O failed at {path}: {reason}")]
    Io { path: PathBuf, reason: String },

    #[error("Cursor file at {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CursorFile {
    last_id: u64,
    last_save_time: DateTime<Utc>,
}

/// Reads and writes one source's cursor file.
#[derive(Debug, Clone)]
pub struct CursorStore {
    path: PathBuf,
}

impl CursorStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted cursor, or `None` when no file exists yet.
    pub fn load(&self) -> Result<Option<u64>, CursorError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CursorError::Io {
                    path: self.path.clone(),
                    reason: e.to_string(),
                });
            }
        };
        let file: CursorFile =
            serde_json::from_str(&content).map_err(|e| CursorError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        Ok(Some(file.last_id))
    }

    pub fn save(&self, last_id: u64) -> Result<(), CursorError> {
        let file = CursorFile {
            last_id,
            last_save_time: Utc::now(),
        };
        let json = serde_json::to_vec(&file).map_err(|e| CursorError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;
        write_atomic(&self.path, &json).map_err(|e| CursorError::Io {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}
