//! Backends and the fallback chain for senseloop.
//!
//! Remote tiers run a command-line backend through [`InvocationEngine`]. The
//! local tier talks to an Ollama-compatible server through
//! [`LocalModelClient`]. [`FallbackChain`] walks the tiers in order and
//! queues the request when nothing answers.

pub mod classifier;
pub mod fallback;
pub mod invocation;
pub mod local;
pub mod queue;
pub mod response;
pub mod sanitize;

pub use classifier::TaskClassifier;
pub use fallback::{ChainError, ChainOutcome, ChainResponse, FallbackChain, TierError, classify_error};
pub use invocation::{InvocationConfig, InvocationEngine, InvocationResult, RemoteBackend};
pub use local::{LocalBackend, LocalModelClient};
pub use queue::{FileRequestQueue, InMemoryRequestQueue, QueuedRequest, RequestQueue};
pub use sanitize::{MESSAGE_NOT_DELIVERED, Sanitized, Sanitizer};
