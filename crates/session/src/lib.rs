//! Per-conversation bookkeeping for senseloop.
//!
//! [`ContextTracker`] estimates how full each thread's context window is.
//! [`SessionLedger`] records goals, decisions and file changes per thread and
//! produces [`Handoff`] snapshots when a session has to be replaced.

pub mod budget;
pub mod handoff;
pub mod ledger;

pub use budget::{ContextLevel, ContextMetrics, ContextTracker};
pub use handoff::{Handoff, HandoffReason};
pub use ledger::{EntryKind, LedgerEntry, SessionLedger};
