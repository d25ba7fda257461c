//! Source and handler seams.

use async_trait::async_trait;
use senseloop_core::error::{HandlerError, SourceError};
use senseloop_core::event::InboundEvent;
use std::sync::Arc;
use tokio::sync::Notify;

/// A record addressable by a strictly increasing per-source id.
pub trait SourceRecord: Clone + Send + Sync + 'static {
    fn cursor_id(&self) -> u64;
}

impl SourceRecord for InboundEvent {
    fn cursor_id(&self) -> u64 {
        self.cursor_id
    }
}

/// What happened to a record after it was handed to the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    Failed,
}

/// A cursor-addressable store of new records.
#[async_trait]
pub trait EventSource: Send + Sync + 'static {
    type Record: SourceRecord;

    /// Short name used in logs, alerts and cursor file names.
    fn name(&self) -> &str;

    /// The id of the newest record currently in the source.
    ///
    /// Used as the starting cursor when nothing was persisted, so a first run
    /// does not replay history.
    async fn tail_id(&self) -> Result<u64, SourceError>;

    /// Records with an id greater than `last_id`, ascending, at most `limit`.
    async fn fetch_after(&self, last_id: u64, limit: usize)
    -> Result<Vec<Self::Record>, SourceError>;

    /// Called once per dispatched record.
    async fn acknowledge(
        &self,
        _record: &Self::Record,
        _outcome: DispatchOutcome,
    ) -> Result<(), SourceError> {
        Ok(())
    }

    /// Notified whenever the underlying store may have changed.
    fn change_signal(&self) -> Option<Arc<Notify>> {
        None
    }
}

/// Consumer of dispatched records.
#[async_trait]
pub trait EventHandler<R: Send + 'static>: Send + Sync {
    async fn handle(&self, record: R) -> Result<(), HandlerError>;
}
