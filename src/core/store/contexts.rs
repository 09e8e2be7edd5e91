use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params, params_from_iter};

use super::{Store, parse_ts, ts};
use crate::core::error::{CoreError, CoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    Inbound,
    Outbound,
}

impl MessageDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
        }
    }

    fn parse(s: &str) -> CoreResult<Self> {
        match s {
            "inbound" => Ok(MessageDirection::Inbound),
            "outbound" => Ok(MessageDirection::Outbound),
            other => Err(CoreError::Corrupt {
                field: "context_messages.direction",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextMessage {
    pub id: i64,
    pub context_id: String,
    pub direction: MessageDirection,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Append a message to a context's live window. Inbound messages count
    /// as turns.
    pub async fn append_context_message(
        &self,
        context_id: &str,
        direction: MessageDirection,
        content: &str,
    ) -> CoreResult<ContextMessage> {
        let mut db = self.db.lock().await;
        let now = Utc::now();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO context_messages (context_id, direction, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![context_id, direction.as_str(), content, ts(now)],
        )?;
        let id = tx.last_insert_rowid();
        let turns = i64::from(direction == MessageDirection::Inbound);
        tx.execute(
            "INSERT INTO contexts (context_id, turn_count, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(context_id) DO UPDATE SET
                 turn_count = turn_count + excluded.turn_count,
                 updated_at = excluded.updated_at",
            params![context_id, turns, ts(now)],
        )?;
        tx.commit()?;
        Ok(ContextMessage {
            id,
            context_id: context_id.to_string(),
            direction,
            content: content.to_string(),
            created_at: now,
        })
    }

    pub async fn context_turn_count(&self, context_id: &str) -> CoreResult<i64> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT turn_count FROM contexts WHERE context_id = ?1",
                params![context_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0))
    }

    pub async fn context_summary(&self, context_id: &str) -> CoreResult<Option<String>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT summary FROM contexts WHERE context_id = ?1",
                params![context_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    /// Ordered snapshot of a context's live window.
    pub async fn context_messages(&self, context_id: &str) -> CoreResult<Vec<ContextMessage>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT id, context_id, direction, content, created_at FROM context_messages
             WHERE context_id = ?1 ORDER BY id ASC",
        )?;
        let mut rows = stmt.query(params![context_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let direction: String = row.get(2)?;
            let created_at: String = row.get(4)?;
            out.push(ContextMessage {
                id: row.get(0)?,
                context_id: row.get(1)?,
                direction: MessageDirection::parse(&direction)?,
                content: row.get(3)?,
                created_at: parse_ts("context_messages.created_at", &created_at)?,
            });
        }
        Ok(out)
    }

    /// Drop the given messages from the live window, store the summary and
    /// recompute the turn count from the inbound messages that remain.
    /// Messages inserted after the caller's snapshot are untouched.
    pub async fn compact_context(
        &self,
        context_id: &str,
        removed_ids: &[i64],
        summary: &str,
    ) -> CoreResult<i64> {
        let mut db = self.db.lock().await;
        let tx = db.transaction()?;
        if !removed_ids.is_empty() {
            let marks = vec!["?"; removed_ids.len()].join(", ");
            let sql = format!(
                "DELETE FROM context_messages WHERE context_id = ? AND id IN ({marks})"
            );
            let mut values: Vec<rusqlite::types::Value> =
                vec![rusqlite::types::Value::Text(context_id.to_string())];
            values.extend(removed_ids.iter().map(|id| rusqlite::types::Value::Integer(*id)));
            tx.execute(&sql, params_from_iter(values.iter()))?;
        }
        let turns: i64 = tx.query_row(
            "SELECT COUNT(*) FROM context_messages WHERE context_id = ?1 AND direction = 'inbound'",
            params![context_id],
            |row| row.get(0),
        )?;
        tx.execute(
            "INSERT INTO contexts (context_id, turn_count, summary, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(context_id) DO UPDATE SET
                 turn_count = excluded.turn_count,
                 summary = excluded.summary,
                 updated_at = excluded.updated_at",
            params![context_id, turns, summary, ts(Utc::now())],
        )?;
        tx.commit()?;
        Ok(turns)
    }
}
