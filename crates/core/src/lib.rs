//! # senseloop core
//!
//! Domain types, error definitions and the retry policy shared by every
//! senseloop crate. Watchers, the invocation engine, the fallback chain and
//! the session ledger all depend inward on this crate.
//!
//! ## Design Philosophy
//!
//! Collaborators are defined as traits next to the code that consumes them;
//! this crate only carries the vocabulary they exchange:
//! - inbound events and sense events ([`event`])
//! - conversation sessions ([`session`])
//! - fallback tiers, error classes and task complexity ([`tier`])
//! - the exponential backoff policy ([`backoff`])

pub mod backoff;
pub mod error;
pub mod event;
pub mod session;
pub mod tier;

// Re-export key types at crate root for ergonomics
pub use backoff::{Backoff, BackoffConfig, BackoffError};
pub use error::{InvocationError, RESPONSE_UNAVAILABLE};
pub use event::{DomainEvent, EventBus, InboundEvent, Payload, SenseEvent, SensePriority};
pub use session::{ConversationSession, SessionStore};
pub use tier::{ErrorClass, FallbackTier, TaskComplexity};
