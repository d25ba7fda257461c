//! Operator alerts raised by watchers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};

/// A source has failed too many times in a row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherAlert {
    pub source: String,
    pub consecutive_failures: u32,
    pub last_error: String,
    pub raised_at: DateTime<Utc>,
}

/// Where alerts go.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: &WatcherAlert);
}

/// Logs alerts at error level.
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn raise(&self, alert: &WatcherAlert) {
        tracing::error!(
            source = %alert.source,
            consecutive_failures = alert.consecutive_failures,
            last_error = %alert.last_error,
            "ALERT: watcher source keeps failing"
        );
    }
}

/// Keeps every alert in memory.
#[derive(Default)]
pub struct CollectingAlertSink {
    alerts: Mutex<Vec<WatcherAlert>>,
}

impl CollectingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<WatcherAlert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertSink for CollectingAlertSink {
    fn raise(&self, alert: &WatcherAlert) {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(alert.clone());
    }
}
