//! Delivery seam. Actually sending a message to a person is platform
//! automation that lives outside this crate.

use crate::error::PipelineError;
use async_trait::async_trait;
use tracing::info;

#[async_trait]
pub trait Responder: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver already-sanitized text to a thread.
    async fn deliver(&self, thread_id: &str, text: &str) -> Result<(), PipelineError>;
}

/// Logs responses instead of sending them.
pub struct TracingResponder;

#[async_trait]
impl Responder for TracingResponder {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn deliver(&self, thread_id: &str, text: &str) -> Result<(), PipelineError> {
        info!(thread_id, chars = text.chars().count(), response = %text, "Response ready");
        Ok(())
    }
}
