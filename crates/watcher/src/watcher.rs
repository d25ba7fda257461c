//! The cursor-following watcher.
//!
//! A scan fetches records after the cursor (through the database backoff
//! profile), then for each record in ascending order: marks it recently seen,
//! hands it to the handler outside any lock, acknowledges the outcome to the
//! source, advances the cursor and persists it. A handler failure still
//! advances the cursor.
//!
//! Read failures are counted. Each one pauses scanning for a period that grows
//! with the count; at the alert threshold an alert is raised, at most once per
//! cooldown. The first successful read resets the count.

use crate::alert::{AlertSink, TracingAlertSink, WatcherAlert};
use crate::cursor::CursorStore;
use crate::recent::RecentlySeen;
use crate::source::{DispatchOutcome, EventHandler, EventSource, SourceRecord};
use chrono::Utc;
use senseloop_config::WatcherConfig;
use senseloop_core::backoff::{Backoff, BackoffConfig};
use senseloop_core::error::SourceError;
use senseloop_core::event::{DomainEvent, EventBus};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one call to [`Watcher::scan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Another scan was in flight.
    Skipped,
    /// Scanning is paused after recent read failures.
    Paused,
    /// The fetch succeeded; `dispatched` records were handed to the handler.
    Completed { dispatched: usize, cursor: u64 },
    /// The fetch failed.
    Failed { consecutive_failures: u32 },
}

#[derive(Debug)]
struct ScanState {
    cursor: Option<u64>,
    recent: RecentlySeen,
    consecutive_failures: u32,
    paused_until: Option<Instant>,
    last_alert: Option<Instant>,
}

/// Follows one source and dispatches its new records.
pub struct Watcher<S: EventSource> {
    source: Arc<S>,
    handler: Arc<dyn EventHandler<S::Record>>,
    config: WatcherConfig,
    backoff: Backoff,
    cursor_store: Option<CursorStore>,
    start_after: Option<u64>,
    alerts: Arc<dyn AlertSink>,
    events: Option<Arc<EventBus>>,
    scanning: AtomicBool,
    state: Mutex<ScanState>,
}

/// Clears the single-flight flag when a scan ends, however it ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: EventSource> Watcher<S> {
    pub fn new(
        source: Arc<S>,
        handler: Arc<dyn EventHandler<S::Record>>,
        config: WatcherConfig,
    ) -> Self {
        let recent = RecentlySeen::new(config.recently_seen_capacity);
        Self {
            source,
            handler,
            config,
            backoff: Backoff::new(BackoffConfig::database()),
            cursor_store: None,
            start_after: None,
            alerts: Arc::new(TracingAlertSink),
            events: None,
            scanning: AtomicBool::new(false),
            state: Mutex::new(ScanState {
                cursor: None,
                recent,
                consecutive_failures: 0,
                paused_until: None,
                last_alert: None,
            }),
        }
    }

    /// Persist the cursor to this file.
    pub fn with_cursor_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.cursor_store = Some(CursorStore::new(path));
        self
    }

    /// Start after this id, ignoring any persisted cursor.
    pub fn with_start_after(mut self, id: u64) -> Self {
        self.start_after = Some(id);
        self
    }

    /// Retry policy for source reads.
    pub fn with_backoff(mut self, config: BackoffConfig) -> Self {
        self.backoff = Backoff::new(config);
        self
    }

    pub fn with_alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.alerts = sink;
        self
    }

    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    /// The current cursor, once resolved.
    pub fn cursor(&self) -> Option<u64> {
        self.lock_state().cursor
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock_state().consecutive_failures
    }

    fn lock_state(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the starting cursor: explicit override, then the persisted
    /// file, then the source tail. A cursor taken from the tail is written
    /// immediately. Calling this again returns the already resolved cursor.
    pub async fn start(&self) -> Result<u64, SourceError> {
        let resolved = self.lock_state().cursor;
        if let Some(cursor) = resolved {
            return Ok(cursor);
        }

        let name = self.source.name();
        let cursor = if let Some(id) = self.start_after {
            info!(source = %name, cursor = id, "Starting from override cursor");
            id
        } else if let Some(id) = self.load_persisted() {
            info!(source = %name, cursor = id, "Resuming from persisted cursor");
            id
        } else {
            let tail = self.source.tail_id().await?;
            info!(source = %name, cursor = tail, "Starting from source tail");
            self.persist(tail);
            tail
        };

        self.lock_state().cursor.get_or_insert(cursor);
        Ok(cursor)
    }

    fn load_persisted(&self) -> Option<u64> {
        let store = self.cursor_store.as_ref()?;
        match store.load() {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(source = %self.source.name(), error = %e, "Ignoring unreadable cursor file");
                None
            }
        }
    }

    fn persist(&self, cursor: u64) {
        if let Some(store) = &self.cursor_store {
            if let Err(e) = store.save(cursor) {
                warn!(source = %self.source.name(), error = %e, "Failed to persist cursor");
            }
        }
    }

    /// Run one scan. Concurrent calls return [`ScanOutcome::Skipped`].
    pub async fn scan(&self) -> ScanOutcome {
        if self
            .scanning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(source = %self.source.name(), "Scan already in flight");
            return ScanOutcome::Skipped;
        }
        let _guard = ScanGuard(&self.scanning);

        let paused = self
            .lock_state()
            .paused_until
            .is_some_and(|until| Instant::now() < until);
        if paused {
            return ScanOutcome::Paused;
        }

        let cursor = match self.start().await {
            Ok(cursor) => cursor,
            Err(e) => return self.record_failure(&e),
        };

        let name = self.source.name();
        let limit = self.config.batch_limit;
        let fetched = self
            .backoff
            .execute_with(
                || self.source.fetch_after(cursor, limit),
                |retry, err: &SourceError, delay| {
                    debug!(source = %name, retry, error = %err, delay_ms = delay.as_millis() as u64, "Retrying source read");
                },
            )
            .await;

        let records = match fetched {
            Ok(records) => records,
            Err(e) => return self.record_failure(&e),
        };
        self.record_success();

        let mut dispatched = 0;
        for record in records {
            let id = record.cursor_id();
            {
                let mut state = self.lock_state();
                let current = state.cursor.unwrap_or(cursor);
                if id <= current || !state.recent.insert(id) {
                    continue;
                }
            }

            let outcome = match self.handler.handle(record.clone()).await {
                Ok(()) => DispatchOutcome::Delivered,
                Err(e) => {
                    error!(source = %name, cursor_id = id, error = %e, "Handler failed; advancing past record");
                    DispatchOutcome::Failed
                }
            };
            if let Err(e) = self.source.acknowledge(&record, outcome).await {
                warn!(source = %name, cursor_id = id, error = %e, "Failed to acknowledge record");
            }

            {
                let mut state = self.lock_state();
                state.cursor = Some(state.cursor.map_or(id, |c| c.max(id)));
            }
            self.persist(id);
            dispatched += 1;

            if let Some(bus) = &self.events {
                bus.publish(DomainEvent::EventDispatched {
                    source: name.to_string(),
                    cursor_id: id,
                    timestamp: Utc::now(),
                });
            }
        }

        let cursor = self.cursor().unwrap_or(cursor);
        if dispatched > 0 {
            debug!(source = %name, dispatched, cursor, "Scan complete");
        }
        ScanOutcome::Completed { dispatched, cursor }
    }

    fn record_success(&self) {
        let mut state = self.lock_state();
        if state.consecutive_failures > 0 {
            info!(
                source = %self.source.name(),
                after = state.consecutive_failures,
                "Source recovered"
            );
        }
        state.consecutive_failures = 0;
        state.paused_until = None;
    }

    fn record_failure(&self, err: &SourceError) -> ScanOutcome {
        let name = self.source.name();
        let now = Instant::now();
        let (failures, alert_due) = {
            let mut state = self.lock_state();
            state.consecutive_failures += 1;
            let failures = state.consecutive_failures;
            state.paused_until = Some(now + self.config.failure_sleep(failures));

            let cooled_down = state
                .last_alert
                .is_none_or(|last| now.duration_since(last) >= self.config.alert_cooldown());
            let alert_due = failures >= self.config.alert_threshold && cooled_down;
            if alert_due {
                state.last_alert = Some(now);
            }
            (failures, alert_due)
        };

        if failures <= 3 {
            warn!(source = %name, consecutive_failures = failures, error = %err, "Source read failed");
        } else {
            error!(source = %name, consecutive_failures = failures, error = %err, "Source read keeps failing");
        }

        if alert_due {
            let alert = WatcherAlert {
                source: name.to_string(),
                consecutive_failures: failures,
                last_error: err.to_string(),
                raised_at: Utc::now(),
            };
            self.alerts.raise(&alert);
            if let Some(bus) = &self.events {
                bus.publish(DomainEvent::WatcherAlert {
                    source: alert.source,
                    consecutive_failures: failures,
                    timestamp: alert.raised_at,
                });
            }
        }

        ScanOutcome::Failed {
            consecutive_failures: failures,
        }
    }

    /// Scan on every timer tick and change signal until `shutdown` fires.
    ///
    /// Each trigger spawns its own scan task; in-flight scans are awaited
    /// before returning so the last cursor is persisted.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<(), SourceError> {
        self.start().await?;

        let signal = self.source.change_signal();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut scans = JoinSet::new();

        info!(
            source = %self.source.name(),
            poll_secs = self.config.poll_interval_secs,
            change_signal = signal.is_some(),
            "Watcher running"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = changed(signal.as_deref()) => {
                    debug!(source = %self.source.name(), "Change signal");
                }
            }

            while scans.try_join_next().is_some() {}
            let this = Arc::clone(&self);
            scans.spawn(async move {
                this.scan().await;
            });
        }

        while scans.join_next().await.is_some() {}
        info!(source = %self.source.name(), cursor = ?self.cursor(), "Watcher stopped");
        Ok(())
    }
}

async fn changed(signal: Option<&Notify>) {
    match signal {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}
