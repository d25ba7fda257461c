//! Change watchers for senseloop.
//!
//! A [`Watcher`] follows one [`EventSource`] by cursor, dispatching every new
//! record to an [`EventHandler`] in ascending cursor order. Two trigger paths
//! feed it: a periodic timer and an optional change signal from the source.
//! Scans are single-flight, so the two paths can overlap freely.
//!
//! Sources shipped here:
//! - [`SenseDirectorySource`]: one JSON sense event per file in a directory
//! - [`MessageDatabaseSource`]: a Messages-style SQLite database (feature `sqlite`)

pub mod alert;
pub mod cursor;
#[cfg(feature = "sqlite")]
pub mod messages_db;
pub mod recent;
pub mod sense_dir;
pub mod signal;
pub mod source;
pub mod watcher;

pub use alert::{AlertSink, CollectingAlertSink, TracingAlertSink, WatcherAlert};
pub use cursor::{CursorError, CursorStore};
#[cfg(feature = "sqlite")]
pub use messages_db::MessageDatabaseSource;
pub use recent::RecentlySeen;
pub use sense_dir::{SenseDirectorySource, SenseRecord};
pub use signal::ChangeSignal;
pub use source::{DispatchOutcome, EventHandler, EventSource, SourceRecord};
pub use watcher::{ScanOutcome, Watcher};
