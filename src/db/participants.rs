//! Participant legs. Rows are created when a leg joins and only stamped on leave.

use super::{Database, NewParticipant, ParticipantRecord};
use anyhow::Result;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const PARTICIPANT_COLUMNS: &str = "id, call_id, provider_leg_id, phone_number, display_name, role,
    joined_at, left_at, muted, on_hold";

impl Database {
    pub async fn insert_participant(&self, p: &NewParticipant) -> Result<ParticipantRecord> {
        let sql = format!(
            "INSERT INTO call_participants
                (call_id, provider_leg_id, phone_number, display_name, role, joined_at, muted, on_hold)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING {}",
            PARTICIPANT_COLUMNS
        );
        let row = sqlx::query_as::<_, ParticipantRecord>(&sql)
            .bind(p.call_id)
            .bind(&p.provider_leg_id)
            .bind(&p.phone_number)
            .bind(&p.display_name)
            .bind(p.role.as_str())
            .bind(p.joined_at)
            .bind(p.muted)
            .bind(p.on_hold)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    /// The open (not yet left) participant row for a provider leg.
    pub async fn get_participant_by_leg(
        &self,
        call_id: Uuid,
        provider_leg_id: &str,
    ) -> Result<Option<ParticipantRecord>> {
        let sql = format!(
            "SELECT {} FROM call_participants
             WHERE call_id = $1 AND provider_leg_id = $2
             ORDER BY left_at IS NULL DESC, joined_at DESC
             LIMIT 1",
            PARTICIPANT_COLUMNS
        );
        let row = sqlx::query_as::<_, ParticipantRecord>(&sql)
            .bind(call_id)
            .bind(provider_leg_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Stamp `left_at` once. A second leave for the same row is a no-op.
    pub async fn stamp_participant_left(&self, id: i64, left_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE call_participants SET left_at = $2 WHERE id = $1 AND left_at IS NULL",
        )
        .bind(id)
        .bind(left_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_participant_flags(
        &self,
        id: i64,
        muted: Option<bool>,
        on_hold: Option<bool>,
    ) -> Result<Option<ParticipantRecord>> {
        let sql = format!(
            "UPDATE call_participants SET
                muted = COALESCE($2, muted),
                on_hold = COALESCE($3, on_hold)
             WHERE id = $1
             RETURNING {}",
            PARTICIPANT_COLUMNS
        );
        let row = sqlx::query_as::<_, ParticipantRecord>(&sql)
            .bind(id)
            .bind(muted)
            .bind(on_hold)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_participants(&self, call_id: Uuid) -> Result<Vec<ParticipantRecord>> {
        let sql = format!(
            "SELECT {} FROM call_participants WHERE call_id = $1 ORDER BY joined_at, id",
            PARTICIPANT_COLUMNS
        );
        let rows = sqlx::query_as::<_, ParticipantRecord>(&sql)
            .bind(call_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
