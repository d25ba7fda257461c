use senseloop_core::error::{HandlerError, LedgerError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Delivery to thread {thread_id} failed: {reason}")]
    Delivery { thread_id: String, reason: String },
}

impl From<PipelineError> for HandlerError {
    fn from(e: PipelineError) -> Self {
        HandlerError::Failed(e.to_string())
    }
}
