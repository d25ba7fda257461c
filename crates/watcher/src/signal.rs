//! Filesystem change signals.

use notify::{RecommendedWatcher, RecursiveMode, Watcher as _};
use senseloop_core::error::SourceError;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Pokes a [`Notify`] whenever anything changes under a path.
///
/// The underlying OS watcher stops when this value is dropped, so the owning
/// source keeps it alive.
pub struct ChangeSignal {
    notify: Arc<Notify>,
    _watcher: RecommendedWatcher,
}

impl ChangeSignal {
    pub fn watch(path: &Path) -> Result<Self, SourceError> {
        let notify = Arc::new(Notify::new());
        let target = Arc::clone(&notify);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    debug!(kind = ?event.kind, "Change notification");
                    target.notify_one();
                }
                Err(e) => debug!(error = %e, "Change notification error"),
            }
        })
        .map_err(|e| SourceError::Unavailable(format!("Failed to create change watcher: {e}")))?;

        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| {
                SourceError::Unavailable(format!("Failed to watch {}: {e}", path.display()))
            })?;

        Ok(Self {
            notify,
            _watcher: watcher,
        })
    }

    pub fn notify(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }
}
