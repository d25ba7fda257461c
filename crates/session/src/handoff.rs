//! Continuation handoffs.

use crate::ledger::{EntryKind, LedgerEntry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum HandoffReason {
    ContextExhausted,
    ManualRequest,
    SessionInvalidated,
    Other(String),
}

impl fmt::Display for HandoffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContextExhausted => f.write_str("context exhausted"),
            Self::ManualRequest => f.write_str("manual request"),
            Self::SessionInvalidated => f.write_str("session invalidated"),
            Self::Other(reason) => f.write_str(reason),
        }
    }
}

/// A thread's full ledger at the moment its session was replaced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Handoff {
    pub id: String,
    pub thread_id: String,
    pub reason: HandoffReason,
    pub entries: Vec<LedgerEntry>,
    pub created_at: DateTime<Utc>,
}

impl Handoff {
    pub fn entries_of(&self, kind: EntryKind) -> impl Iterator<Item = &LedgerEntry> {
        self.entries.iter().filter(move |e| e.kind == kind)
    }

    /// Render as Markdown continuation context for a fresh session.
    pub fn render(&self) -> String {
        let mut out = format!(
            "## Continuation handoff\n\nThread: {}\nReason: {}\nCreated: {}\n",
            self.thread_id,
            self.reason,
            self.created_at.to_rfc3339()
        );

        if self.entries.is_empty() {
            out.push_str("\n_No ledger entries were recorded._\n");
            return out;
        }

        for (kind, title) in [
            (EntryKind::Goal, "Goals"),
            (EntryKind::Decision, "Decisions"),
            (EntryKind::FileChange, "File changes"),
        ] {
            let mut section = self.entries_of(kind).peekable();
            if section.peek().is_none() {
                continue;
            }
            out.push_str(&format!("\n### {title}\n"));
            for entry in section {
                out.push_str(&format!("- {}\n", entry.content));
            }
        }
        out
    }
}
