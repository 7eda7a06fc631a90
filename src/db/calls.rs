//! Call rows: creation, provider-id lookup, status CAS, soft delete, stats.
//!
//! The webhook hot path is `get_call_by_provider_id` (unique index) followed
//! by `update_call_status`. Status writes are guarded by `version`: the update
//! only matches when the row still carries the version the caller read.

use super::{
    sort_by_status, CallDetails, CallFilter, CallPage, CallRecord, CallStats, Database, NewCall,
    Page, StatsRange, StatusCount, StatusPatch,
};
use crate::call::CallStatus;
use anyhow::Result;
use sqlx::Row;
use uuid::Uuid;

const CALL_COLUMNS: &str = "id, provider_call_id, provider_account_id, direction, status,
    from_number, to_number, started_at, answered_at, ended_at, duration_secs,
    ring_duration_secs, user_id, contact_id, deal_id, lead_id, disposition, notes, summary,
    queue_name, assigned_agent_id, conference_sid, status_changed_at, version, deleted_at,
    created_at, updated_at";

impl Database {
    /// Insert a call row and return it with its generated id.
    pub async fn insert_call(&self, call: &NewCall) -> Result<CallRecord> {
        let sql = format!(
            "INSERT INTO calls (id, provider_call_id, provider_account_id, direction, status,
                from_number, to_number, user_id, contact_id, deal_id, lead_id, queue_name,
                started_at, status_changed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             RETURNING {}",
            CALL_COLUMNS
        );
        let row = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(&call.provider_call_id)
            .bind(&call.provider_account_id)
            .bind(call.direction.as_str())
            .bind(call.status.as_str())
            .bind(&call.from_number)
            .bind(&call.to_number)
            .bind(&call.user_id)
            .bind(call.contact_id)
            .bind(call.deal_id)
            .bind(call.lead_id)
            .bind(&call.queue_name)
            .bind(call.started_at)
            .bind(call.status_changed_at)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    /// Lookup by internal id. Soft-deleted rows are included.
    pub async fn get_call(&self, id: Uuid) -> Result<Option<CallRecord>> {
        let sql = format!("SELECT {} FROM calls WHERE id = $1", CALL_COLUMNS);
        let row = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_call_by_provider_id(&self, provider_call_id: &str) -> Result<Option<CallRecord>> {
        let sql = format!(
            "SELECT {} FROM calls WHERE provider_call_id = $1",
            CALL_COLUMNS
        );
        let row = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(provider_call_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Atomic get-or-insert keyed on the provider call id.
    ///
    /// `ON CONFLICT DO NOTHING` leaves the first writer's row untouched; the
    /// loser re-reads it. Returns `true` when this call inserted the row.
    pub async fn get_or_insert_call(&self, call: &NewCall) -> Result<(CallRecord, bool)> {
        let Some(provider_call_id) = call.provider_call_id.as_deref() else {
            return Ok((self.insert_call(call).await?, true));
        };
        let sql = format!(
            "INSERT INTO calls (id, provider_call_id, provider_account_id, direction, status,
                from_number, to_number, user_id, contact_id, deal_id, lead_id, queue_name,
                started_at, status_changed_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (provider_call_id) DO NOTHING
             RETURNING {}",
            CALL_COLUMNS
        );
        let inserted = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(provider_call_id)
            .bind(&call.provider_account_id)
            .bind(call.direction.as_str())
            .bind(call.status.as_str())
            .bind(&call.from_number)
            .bind(&call.to_number)
            .bind(&call.user_id)
            .bind(call.contact_id)
            .bind(call.deal_id)
            .bind(call.lead_id)
            .bind(&call.queue_name)
            .bind(call.started_at)
            .bind(call.status_changed_at)
            .fetch_optional(&self.pool)
            .await?;
        if let Some(row) = inserted {
            return Ok((row, true));
        }
        let existing = self
            .get_call_by_provider_id(provider_call_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("call {} vanished after conflict", provider_call_id))?;
        Ok((existing, false))
    }

    /// Set the provider id on a call that does not have one yet. A row that
    /// already carries this same id also counts as linked.
    pub async fn attach_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET provider_call_id = $2, version = version + 1, updated_at = NOW()
             WHERE id = $1 AND provider_call_id IS NULL",
        )
        .bind(id)
        .bind(provider_call_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }
        let linked: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM calls WHERE id = $1 AND provider_call_id = $2)",
        )
        .bind(id)
        .bind(provider_call_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(linked)
    }

    /// Paginated, filtered listing of one user's calls, newest first.
    ///
    /// Every filter is a nullable parameter so the statement text is fixed.
    pub async fn get_calls_for_user(
        &self,
        user_id: &str,
        filter: &CallFilter,
        page: Page,
    ) -> Result<CallPage> {
        const WHERE: &str = "WHERE user_id = $1
               AND ($2::text IS NULL OR direction = $2)
               AND ($3::text IS NULL OR status = $3)
               AND ($4::bigint IS NULL OR contact_id = $4)
               AND ($5::bigint IS NULL OR deal_id = $5)
               AND ($6::timestamptz IS NULL OR started_at >= $6)
               AND ($7::timestamptz IS NULL OR started_at <= $7)
               AND ($8::text IS NULL OR from_number ILIKE $8 OR to_number ILIKE $8
                    OR notes ILIKE $8 OR summary ILIKE $8)
               AND ($9::boolean OR deleted_at IS NULL)";

        let pattern = filter.search_pattern();
        let direction = filter.direction.map(|d| d.as_str());
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM calls {}", WHERE))
            .bind(user_id)
            .bind(direction)
            .bind(status)
            .bind(filter.contact_id)
            .bind(filter.deal_id)
            .bind(filter.from)
            .bind(filter.to)
            .bind(&pattern)
            .bind(filter.include_deleted)
            .fetch_one(&self.pool)
            .await?;

        let sql = format!(
            "SELECT {} FROM calls {} ORDER BY started_at DESC, id LIMIT $10 OFFSET $11",
            CALL_COLUMNS, WHERE
        );
        let calls = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(user_id)
            .bind(direction)
            .bind(status)
            .bind(filter.contact_id)
            .bind(filter.deal_id)
            .bind(filter.from)
            .bind(filter.to)
            .bind(&pattern)
            .bind(filter.include_deleted)
            .bind(page.limit())
            .bind(page.offset())
            .fetch_all(&self.pool)
            .await?;

        Ok(CallPage {
            calls,
            total,
            page: page.page.max(1),
            per_page: page.limit(),
        })
    }

    /// Compare-and-swap status update. All timing fields land in the same row
    /// update; `NULL` patch fields keep the stored value.
    pub async fn update_call_status(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &StatusPatch,
    ) -> Result<Option<CallRecord>> {
        let sql = format!(
            "UPDATE calls SET
                status = $3,
                answered_at = COALESCE($4, answered_at),
                ended_at = COALESCE($5, ended_at),
                duration_secs = COALESCE($6, duration_secs),
                ring_duration_secs = COALESCE($7, ring_duration_secs),
                status_changed_at = $8,
                version = version + 1,
                updated_at = NOW()
             WHERE id = $1 AND version = $2
             RETURNING {}",
            CALL_COLUMNS
        );
        let row = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(id)
            .bind(expected_version)
            .bind(patch.status.as_str())
            .bind(patch.answered_at)
            .bind(patch.ended_at)
            .bind(patch.duration_secs)
            .bind(patch.ring_duration_secs)
            .bind(patch.status_changed_at)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    /// Notes, disposition and summary, scoped to the owning user.
    pub async fn update_call_details(
        &self,
        id: Uuid,
        user_id: &str,
        details: &CallDetails,
    ) -> Result<Option<CallRecord>> {
        let sql = format!(
            "UPDATE calls SET
                notes = COALESCE($3, notes),
                disposition = COALESCE($4, disposition),
                summary = COALESCE($5, summary),
                version = version + 1,
                updated_at = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL
             RETURNING {}",
            CALL_COLUMNS
        );
        let row = sqlx::query_as::<_, CallRecord>(&sql)
            .bind(id)
            .bind(user_id)
            .bind(&details.notes)
            .bind(details.disposition.map(|d| d.as_str()))
            .bind(&details.summary)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn set_assigned_agent(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET assigned_agent_id = $2, version = version + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(agent_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_call_conference(&self, id: Uuid, conference_sid: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET conference_sid = $2, version = version + 1, updated_at = NOW()
             WHERE id = $1",
        )
        .bind(id)
        .bind(conference_sid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn soft_delete_call(&self, id: Uuid, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET deleted_at = NOW(), version = version + 1, updated_at = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn restore_call(&self, id: Uuid, user_id: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE calls SET deleted_at = NULL, version = version + 1, updated_at = NOW()
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NOT NULL",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Administrative delete. Participants, recordings and events cascade.
    pub async fn delete_call(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM calls WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Aggregate counts and durations over non-deleted calls in a date range.
    pub async fn get_call_stats(&self, user_id: Option<&str>, range: StatsRange) -> Result<CallStats> {
        const WHERE: &str = "WHERE deleted_at IS NULL
               AND ($1::text IS NULL OR user_id = $1)
               AND ($2::timestamptz IS NULL OR started_at >= $2)
               AND ($3::timestamptz IS NULL OR started_at <= $3)";

        let totals = sqlx::query(&format!(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE direction = 'inbound') AS inbound,
                    COUNT(*) FILTER (WHERE direction = 'outbound') AS outbound,
                    COALESCE(SUM(duration_secs), 0)::BIGINT AS total_duration,
                    COALESCE(AVG(duration_secs), 0)::FLOAT8 AS average_duration
             FROM calls {}",
            WHERE
        ))
        .bind(user_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_one(&self.pool)
        .await?;

        let rows = sqlx::query(&format!(
            "SELECT status, COUNT(*) AS count FROM calls {} GROUP BY status ORDER BY status",
            WHERE
        ))
        .bind(user_id)
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status")?;
            let status: CallStatus = status.parse()?;
            by_status.push(StatusCount {
                status,
                count: row.try_get("count")?,
            });
        }

        sort_by_status(&mut by_status);

        Ok(CallStats {
            total: totals.try_get("total")?,
            inbound: totals.try_get("inbound")?,
            outbound: totals.try_get("outbound")?,
            by_status,
            total_duration_secs: totals.try_get("total_duration")?,
            average_duration_secs: totals.try_get("average_duration")?,
        })
    }
}
