//! Conversation sessions: Per-thread backend continuity state.
//!
//! A [`ConversationSession`] is created implicitly the first time a thread is
//! invoked. Its backend session token is cleared, never retried, whenever the
//! backend reports it invalid or the prompt no longer fits.

use crate::error::SessionError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Backend continuity state for one conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSession {
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_session_token: Option<String>,
    #[serde(default)]
    pub context_percentage: f64,
    pub updated_at: DateTime<Utc>,
}

impl ConversationSession {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            backend_session_token: None,
            context_percentage: 0.0,
            updated_at: Utc::now(),
        }
    }
}

/// Thread-keyed session map, optionally persisted as one JSON document.
pub struct SessionStore {
    path: Option<PathBuf>,
    sessions: Mutex<HashMap<String, ConversationSession>>,
}

impl SessionStore {
    /// A store that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Load a store from `path`. A missing file starts empty; an unreadable
    /// one is logged and also starts empty so a corrupt file cannot block
    /// startup.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let sessions = match std::fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str::<Vec<ConversationSession>>(&content) {
                Ok(list) => list.into_iter().map(|s| (s.thread_id.clone(), s)).collect(),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Ignoring unreadable session file");
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        debug!(path = %path.display(), count = sessions.len(), "Session store loaded");
        Self {
            path: Some(path),
            sessions: Mutex::new(sessions),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, ConversationSession>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session for `thread_id`, created on first use.
    pub fn get_or_create(&self, thread_id: &str) -> ConversationSession {
        self.lock()
            .entry(thread_id.to_string())
            .or_insert_with(|| ConversationSession::new(thread_id))
            .clone()
    }

    /// The session for `thread_id`, if one exists.
    pub fn get(&self, thread_id: &str) -> Option<ConversationSession> {
        self.lock().get(thread_id).cloned()
    }

    /// Store the token the backend issued for this thread.
    pub fn set_token(&self, thread_id: &str, token: Option<String>) {
        self.update(thread_id, |s| s.backend_session_token = token);
    }

    /// Forget the thread's token so the next invocation starts fresh.
    pub fn clear_token(&self, thread_id: &str) {
        self.update(thread_id, |s| s.backend_session_token = None);
    }

    pub fn set_context_percentage(&self, thread_id: &str, percentage: f64) {
        self.update(thread_id, |s| s.context_percentage = percentage.clamp(0.0, 1.0));
    }

    /// Drop a thread the caller no longer references.
    pub fn remove(&self, thread_id: &str) -> Option<ConversationSession> {
        self.lock().remove(thread_id)
    }

    /// All sessions, sorted by thread id.
    pub fn snapshot(&self) -> Vec<ConversationSession> {
        let mut list: Vec<_> = self.lock().values().cloned().collect();
        list.sort_by(|a, b| a.thread_id.cmp(&b.thread_id));
        list
    }

    fn update(&self, thread_id: &str, f: impl FnOnce(&mut ConversationSession)) {
        let mut sessions = self.lock();
        let session = sessions
            .entry(thread_id.to_string())
            .or_insert_with(|| ConversationSession::new(thread_id));
        f(session);
        session.updated_at = Utc::now();
    }

    /// Persist to disk (no-op for in-memory stores). Written to a temporary
    /// file and renamed into place.
    pub fn save(&self) -> Result<(), SessionError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.snapshot())
            .map_err(|e| SessionError::Storage(format!("Failed to serialize sessions: {e}")))?;
        write_atomic(path, json.as_bytes())
            .map_err(|e| SessionError::Storage(format!("Failed to write session file: {e}")))
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// Write `bytes` to `path` via a sibling temporary file and rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}
