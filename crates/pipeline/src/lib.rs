//! The sense → invoke → respond glue.
//!
//! A [`Pipeline`] turns one watched record into a prompt, runs it through the
//! fallback chain while holding the system-wide [`InvocationLock`], keeps the
//! thread's session token and context budget up to date, and hands the
//! sanitized answer to a [`Responder`].

pub mod error;
pub mod lock;
pub mod pipeline;
pub mod prompt;
pub mod respond;

pub use error::PipelineError;
pub use lock::InvocationLock;
pub use pipeline::{Pipeline, PipelineOutcome};
pub use prompt::{DefaultPromptBuilder, PromptBuilder, PromptInput};
pub use respond::{Responder, TracingResponder};
