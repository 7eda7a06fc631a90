//! Append-only call audit log. Rows are never updated or deleted except by
//! the cascade from an administrative call delete.

use super::{CallEventRecord, Database};
use anyhow::Result;
use serde_json::Value;
use uuid::Uuid;

impl Database {
    pub async fn insert_call_event(
        &self,
        call_id: Uuid,
        event_type: &str,
        payload: &Value,
        user_id: Option<&str>,
    ) -> Result<CallEventRecord> {
        let row = sqlx::query_as::<_, CallEventRecord>(
            "INSERT INTO call_events (call_id, event_type, payload, user_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id, call_id, event_type, payload, user_id, created_at",
        )
        .bind(call_id)
        .bind(event_type)
        .bind(payload)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    /// Events for a call in insertion order.
    pub async fn get_call_events(&self, call_id: Uuid) -> Result<Vec<CallEventRecord>> {
        let rows = sqlx::query_as::<_, CallEventRecord>(
            "SELECT id, call_id, event_type, payload, user_id, created_at
             FROM call_events WHERE call_id = $1 ORDER BY id",
        )
        .bind(call_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}
