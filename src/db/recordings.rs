//! Recordings and their transcription sub-lifecycle.
//!
//! The provider retries recording callbacks, so inserts are upserts keyed on
//! `provider_recording_id`. A replay refreshes url, duration and status but
//! never touches transcription state.

use super::{Database, NewRecording, RecordingRecord};
use crate::call::{RecordingStatus, TranscriptionStatus};
use anyhow::Result;
use uuid::Uuid;

const RECORDING_COLUMNS: &str = "id, call_id, provider_recording_id, url, duration_secs, channels,
    status, transcription_status, transcript, created_at, updated_at";

impl Database {
    pub async fn upsert_call_recording(&self, r: &NewRecording) -> Result<RecordingRecord> {
        let sql = format!(
            "INSERT INTO call_recordings
                (call_id, provider_recording_id, url, duration_secs, channels, status)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (provider_recording_id) DO UPDATE SET
               url = EXCLUDED.url,
               duration_secs = COALESCE(EXCLUDED.duration_secs, call_recordings.duration_secs),
               channels = EXCLUDED.channels,
               status = EXCLUDED.status,
               updated_at = NOW()
             RETURNING {}",
            RECORDING_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordingRecord>(&sql)
            .bind(r.call_id)
            .bind(&r.provider_recording_id)
            .bind(&r.url)
            .bind(r.duration_secs)
            .bind(r.channels)
            .bind(r.status.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn set_recording_status(
        &self,
        provider_recording_id: &str,
        status: RecordingStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE call_recordings SET status = $2, updated_at = NOW()
             WHERE provider_recording_id = $1",
        )
        .bind(provider_recording_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Transcript text is only overwritten when a new one is supplied.
    pub async fn set_transcription(
        &self,
        provider_recording_id: &str,
        status: TranscriptionStatus,
        transcript: Option<&str>,
    ) -> Result<Option<RecordingRecord>> {
        let sql = format!(
            "UPDATE call_recordings SET
                transcription_status = $2,
                transcript = COALESCE($3, transcript),
                updated_at = NOW()
             WHERE provider_recording_id = $1
             RETURNING {}",
            RECORDING_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordingRecord>(&sql)
            .bind(provider_recording_id)
            .bind(status.as_str())
            .bind(transcript)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn get_recordings(&self, call_id: Uuid) -> Result<Vec<RecordingRecord>> {
        let sql = format!(
            "SELECT {} FROM call_recordings WHERE call_id = $1 ORDER BY created_at, id",
            RECORDING_COLUMNS
        );
        let rows = sqlx::query_as::<_, RecordingRecord>(&sql)
            .bind(call_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn get_latest_recording(&self, call_id: Uuid) -> Result<Option<RecordingRecord>> {
        let sql = format!(
            "SELECT {} FROM call_recordings
             WHERE call_id = $1 AND status <> 'deleted'
             ORDER BY created_at DESC, id DESC LIMIT 1",
            RECORDING_COLUMNS
        );
        let row = sqlx::query_as::<_, RecordingRecord>(&sql)
            .bind(call_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }
}
