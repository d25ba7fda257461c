//! Messages-style SQLite database source.
//!
//! Reads the `message` table (joined with `handle`, `chat` and the first
//! attachment) read-only, using `ROWID` as the cursor. Own messages are
//! skipped. Tapback rows (`associated_message_type` 2000..=2005) become
//! reactions; removals and other associated types are not fetched at all.

use crate::signal::ChangeSignal;
use crate::source::EventSource;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use senseloop_core::error::SourceError;
use senseloop_core::event::{InboundEvent, Payload};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Seconds between the Unix epoch and 2001-01-01T00:00:00Z.
const APPLE_EPOCH_OFFSET: i64 = 978_307_200;

const FETCH_SQL: &str = r#"
    SELECT
        m.ROWID                    AS rowid,
        m.text                     AS text,
        m.date                     AS date,
        m.associated_message_type  AS assoc_type,
        m.associated_message_guid  AS assoc_guid,
        h.id                       AS sender,
        c.chat_identifier          AS chat_identifier,
        a.filename                 AS att_filename,
        a.mime_type                AS att_mime
    FROM message m
    LEFT JOIN handle h ON h.ROWID = m.handle_id
    LEFT JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
    LEFT JOIN chat c ON c.ROWID = cmj.chat_id
    LEFT JOIN message_attachment_join maj ON maj.message_id = m.ROWID
    LEFT JOIN attachment a ON a.ROWID = maj.attachment_id
    WHERE m.ROWID > ?1
      AND m.is_from_me = 0
      AND (m.associated_message_type = 0
           OR m.associated_message_type BETWEEN 2000 AND 2005)
    GROUP BY m.ROWID
    ORDER BY m.ROWID ASC
    LIMIT ?2
"#;

pub struct MessageDatabaseSource {
    name: String,
    path: PathBuf,
    pool: SqlitePool,
    signal: Option<ChangeSignal>,
}

impl MessageDatabaseSource {
    /// Open the database read-only.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let path = path.into();
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .read_only(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| {
                SourceError::Unavailable(format!("Failed to open {}: {e}", path.display()))
            })?;
        info!(path = %path.display(), "Message database opened");
        Ok(Self {
            name: "messages".into(),
            path,
            pool,
            signal: None,
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Watch the database directory (the WAL file changes on every write).
    pub fn with_change_signal(mut self) -> Result<Self, SourceError> {
        let dir = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        self.signal = Some(ChangeSignal::watch(dir)?);
        Ok(self)
    }

    fn row_to_event(row: &sqlx::sqlite::SqliteRow) -> Result<InboundEvent, sqlx::Error> {
        let rowid: i64 = row.try_get("rowid")?;
        let text: Option<String> = row.try_get("text")?;
        let date: Option<i64> = row.try_get("date")?;
        let assoc_type: Option<i64> = row.try_get("assoc_type")?;
        let assoc_guid: Option<String> = row.try_get("assoc_guid")?;
        let sender: Option<String> = row.try_get("sender")?;
        let chat: Option<String> = row.try_get("chat_identifier")?;
        let att_filename: Option<String> = row.try_get("att_filename")?;
        let att_mime: Option<String> = row.try_get("att_mime")?;

        let payload = match (assoc_type.unwrap_or(0), att_filename, att_mime) {
            (kind @ 2000..=2005, _, _) => Payload::Reaction {
                kind: reaction_kind(kind).into(),
                target: assoc_guid,
            },
            (_, filename, mime_type) if filename.is_some() || mime_type.is_some() => {
                Payload::Attachment {
                    filename: filename.map(|f| display_name(&f)),
                    mime_type,
                    caption: text.filter(|t| !is_placeholder_only(t)),
                }
            }
            _ => Payload::text(text.unwrap_or_default()),
        };

        let sender_id = sender.unwrap_or_else(|| "unknown".into());
        Ok(InboundEvent {
            cursor_id: u64::try_from(rowid).unwrap_or(0),
            thread_id: chat.unwrap_or_else(|| sender_id.clone()),
            sender_id,
            payload,
            timestamp: apple_time_to_utc(date.unwrap_or(0)),
        })
    }
}

#[async_trait]
impl EventSource for MessageDatabaseSource {
    type Record = InboundEvent;

    fn name(&self) -> &str {
        &self.name
    }

    async fn tail_id(&self) -> Result<u64, SourceError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(ROWID) FROM message")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| SourceError::Query(format!("Failed to read tail: {e}")))?;
        Ok(max.and_then(|m| u64::try_from(m).ok()).unwrap_or(0))
    }

    async fn fetch_after(&self, last_id: u64, limit: usize) -> Result<Vec<InboundEvent>, SourceError> {
        let last = i64::try_from(last_id).unwrap_or(i64::MAX);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(FETCH_SQL)
            .bind(last)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SourceError::Query(format!("Failed to fetch messages: {e}")))?;

        let events = rows
            .iter()
            .map(Self::row_to_event)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SourceError::Query(format!("Failed to decode message row: {e}")))?;
        debug!(source = %self.name, count = events.len(), after = last_id, "Messages fetched");
        Ok(events)
    }

    fn change_signal(&self) -> Option<Arc<Notify>> {
        self.signal.as_ref().map(ChangeSignal::notify)
    }
}

fn reaction_kind(code: i64) -> &'static str {
    match code {
        2000 => "loved",
        2001 => "liked",
        2002 => "disliked",
        2003 => "laughed",
        2004 => "emphasized",
        _ => "questioned",
    }
}

/// Message dates are seconds since 2001 on old databases and nanoseconds on
/// newer ones.
fn apple_time_to_utc(raw: i64) -> DateTime<Utc> {
    let (secs, nanos) = if raw.abs() > 1_000_000_000_000 {
        (
            raw.div_euclid(1_000_000_000),
            raw.rem_euclid(1_000_000_000) as u32,
        )
    } else {
        (raw, 0)
    };
    Utc.timestamp_opt(secs + APPLE_EPOCH_OFFSET, nanos)
        .single()
        .unwrap_or_else(Utc::now)
}

fn display_name(path: &str) -> String {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
        .to_string()
}

/// Attachment rows carry U+FFFC as their text.
fn is_placeholder_only(text: &str) -> bool {
    text.chars().all(|c| c == '\u{FFFC}' || c.is_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seed(path: &Path) {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();

        for stmt in [
            "CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT)",
            "CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, chat_identifier TEXT)",
            "CREATE TABLE message (ROWID INTEGER PRIMARY KEY, text TEXT, handle_id INTEGER, \
             date INTEGER, is_from_me INTEGER DEFAULT 0, associated_message_type INTEGER DEFAULT 0, \
             associated_message_guid TEXT)",
            "CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER)",
            "CREATE TABLE attachment (ROWID INTEGER PRIMARY KEY, filename TEXT, mime_type TEXT)",
            "CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER)",
            "INSERT INTO handle VALUES (1, '+15551234567')",
            "INSERT INTO chat VALUES (1, 'chat-family')",
            // 2026-01-01T00:00:00Z in Apple nanoseconds
            "INSERT INTO message VALUES (10, 'hello there', 1, 788918400000000000, 0, 0, NULL)",
            "INSERT INTO message VALUES (11, 'my own message', 1, 788918401000000000, 1, 0, NULL)",
            "INSERT INTO message VALUES (12, NULL, 1, 788918402000000000, 0, 2000, 'p:0/GUID-10')",
            "INSERT INTO message VALUES (13, '\u{FFFC}', 1, 788918403000000000, 0, 0, NULL)",
            "INSERT INTO message VALUES (14, 'Removed a heart', 1, 788918404000000000, 0, 3000, 'p:0/GUID-10')",
            "INSERT INTO chat_message_join VALUES (1, 10), (1, 11), (1, 12), (1, 13), (1, 14)",
            "INSERT INTO attachment VALUES (1, '~/Library/Messages/Attachments/ab/IMG_0001.HEIC', 'image/heic')",
            "INSERT INTO message_attachment_join VALUES (13, 1)",
        ] {
            sqlx::query(stmt).execute(&pool).await.unwrap();
        }
        pool.close().await;
    }

    #[tokio::test]
    async fn reads_messages_after_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("chat.db");
        seed(&db).await;

        let source = MessageDatabaseSource::open(&db).await.unwrap();
        assert_eq!(source.tail_id().await.unwrap(), 14);

        let events = source.fetch_after(0, 100).await.unwrap();
        let ids: Vec<u64> = events.iter().map(|e| e.cursor_id).collect();
        assert_eq!(ids, vec![10, 12, 13]);

        assert_eq!(events[0].thread_id, "chat-family");
        assert_eq!(events[0].sender_id, "+15551234567");
        assert_eq!(events[0].payload, Payload::text("hello there"));
        assert_eq!(events[0].timestamp.to_rfc3339(), "2026-01-01T00:00:00+00:00");

        assert_eq!(
            events[1].payload,
            Payload::Reaction {
                kind: "loved".into(),
                target: Some("p:0/GUID-10".into()),
            }
        );
        assert_eq!(
            events[2].payload,
            Payload::Attachment {
                filename: Some("IMG_0001.HEIC".into()),
                mime_type: Some("image/heic".into()),
                caption: None,
            }
        );

        let after = source.fetch_after(12, 100).await.unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].cursor_id, 13);
    }

    #[tokio::test]
    async fn missing_database_is_unavailable() {
        let result = MessageDatabaseSource::open("/nonexistent/chat.db").await;
        assert!(matches!(result, Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn apple_seconds_and_nanoseconds_agree() {
        let from_secs = apple_time_to_utc(788_918_400);
        let from_nanos = apple_time_to_utc(788_918_400_000_000_000);
        assert_eq!(from_secs, from_nanos);
    }
}
