//! # Database: Call Registry Storage Layer
//!
//! Durable storage for calls and the entities they own: participants,
//! recordings and the append-only event log. Production uses `sqlx::PgPool`;
//! development mode and most tests use [`memory::MemoryRegistry`]. Both sit
//! behind the [`CallRegistry`] trait consumed by the orchestrator.
//!
//! ## Schema
//!
//! - `calls`: one row per telephony session, unique index on `provider_call_id`
//! - `call_participants`: one row per leg, stamped on leave, never deleted
//! - `call_recordings`: recording + transcription sub-lifecycle
//! - `call_events`: audit log, insert-only
//! - `contact_phone_index`: CRM-maintained lookup from E.164 number to contact
//!
//! ## Module Structure
//!
//! - [`calls`]: Call CRUD, status CAS update, soft delete, stats
//! - [`participants`]: Participant legs
//! - [`recordings`]: Recordings and transcriptions
//! - [`call_events`]: Audit log
//! - [`contacts`]: Contact lookup by phone number
//! - [`memory`]: In-process registry with the same semantics
//!
//! ## Serialization point
//!
//! Every status change goes through [`CallRegistry::update_status`], which is
//! a compare-and-swap on the row's `version`. Callers read, decide, and write
//! with the version they read; a concurrent writer makes the write return
//! `None` and the caller re-reads.

mod call_events;
mod calls;
mod contacts;
pub mod memory;
mod participants;
mod recordings;

use crate::call::{
    CallDirection, CallStatus, Disposition, ParticipantRole, RecordingStatus, TranscriptionStatus,
    UnknownVariant,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use uuid::Uuid;

// ── Call types ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub id: Uuid,
    pub provider_call_id: Option<String>,
    pub provider_account_id: Option<String>,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub from_number: String,
    pub to_number: String,
    pub started_at: DateTime<Utc>,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i32>,
    pub ring_duration_secs: Option<i32>,
    pub user_id: String,
    pub contact_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub lead_id: Option<i64>,
    pub disposition: Option<Disposition>,
    pub notes: Option<String>,
    pub summary: Option<String>,
    pub queue_name: Option<String>,
    pub assigned_agent_id: Option<String>,
    pub conference_sid: Option<String>,
    /// Provider timestamp of the last applied status; the ordering key for replays.
    pub status_changed_at: DateTime<Utc>,
    #[serde(skip)]
    pub version: i64,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallRecord {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields for a new call row. The registry assigns id, version and audit stamps.
#[derive(Debug, Clone)]
pub struct NewCall {
    pub provider_call_id: Option<String>,
    pub provider_account_id: Option<String>,
    pub direction: CallDirection,
    pub status: CallStatus,
    pub from_number: String,
    pub to_number: String,
    pub user_id: String,
    pub contact_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub lead_id: Option<i64>,
    pub queue_name: Option<String>,
    pub started_at: DateTime<Utc>,
    pub status_changed_at: DateTime<Utc>,
}

/// A status change merged into a call row in one update.
///
/// `None` timing fields keep the stored value.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPatch {
    pub status: CallStatus,
    pub answered_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i32>,
    pub ring_duration_secs: Option<i32>,
    pub status_changed_at: DateTime<Utc>,
}

/// Agent-editable fields. `None` keeps the stored value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallDetails {
    pub notes: Option<String>,
    pub disposition: Option<Disposition>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallFilter {
    pub direction: Option<CallDirection>,
    pub status: Option<CallStatus>,
    pub contact_id: Option<i64>,
    pub deal_id: Option<i64>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Free text matched against numbers, notes and summary.
    pub search: Option<String>,
    #[serde(default)]
    pub include_deleted: bool,
}

impl CallFilter {
    /// `%term%` pattern for `ILIKE`, with LIKE metacharacters escaped.
    pub(crate) fn search_pattern(&self) -> Option<String> {
        let term = self.search.as_deref()?.trim();
        if term.is_empty() {
            return None;
        }
        let escaped = term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        Some(format!("%{}%", escaped))
    }

    pub(crate) fn matches(&self, call: &CallRecord) -> bool {
        if !self.include_deleted && call.is_deleted() {
            return false;
        }
        if self.direction.is_some_and(|d| d != call.direction)
            || self.status.is_some_and(|s| s != call.status)
            || self.contact_id.is_some_and(|c| Some(c) != call.contact_id)
            || self.deal_id.is_some_and(|d| Some(d) != call.deal_id)
            || self.from.is_some_and(|f| call.started_at < f)
            || self.to.is_some_and(|t| call.started_at > t)
        {
            return false;
        }
        match self.search.as_deref().map(str::trim) {
            Some(term) if !term.is_empty() => {
                let term = term.to_lowercase();
                [
                    Some(call.from_number.as_str()),
                    Some(call.to_number.as_str()),
                    call.notes.as_deref(),
                    call.summary.as_deref(),
                ]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&term))
            }
            _ => true,
        }
    }
}

pub const DEFAULT_PER_PAGE: i64 = 25;
pub const MAX_PER_PAGE: i64 = 100;

/// One-based page request, clamped to sane bounds.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Page {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_per_page")]
    pub per_page: i64,
}

fn default_page() -> i64 {
    1
}

fn default_per_page() -> i64 {
    DEFAULT_PER_PAGE
}

impl Default for Page {
    fn default() -> Self {
        Page {
            page: 1,
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

impl Page {
    pub fn limit(&self) -> i64 {
        self.per_page.clamp(1, MAX_PER_PAGE)
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1).saturating_mul(self.limit())
    }
}

#[derive(Debug, Serialize)]
pub struct CallPage {
    pub calls: Vec<CallRecord>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
}

// ── Participant types ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantRecord {
    pub id: i64,
    pub call_id: Uuid,
    pub provider_leg_id: Option<String>,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub muted: bool,
    pub on_hold: bool,
}

#[derive(Debug, Clone)]
pub struct NewParticipant {
    pub call_id: Uuid,
    pub provider_leg_id: Option<String>,
    pub phone_number: String,
    pub display_name: Option<String>,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub muted: bool,
    pub on_hold: bool,
}

// ── Recording types ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct RecordingRecord {
    pub id: i64,
    pub call_id: Uuid,
    pub provider_recording_id: String,
    pub url: String,
    pub duration_secs: Option<i32>,
    pub channels: i32,
    pub status: RecordingStatus,
    pub transcription_status: TranscriptionStatus,
    pub transcript: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewRecording {
    pub call_id: Uuid,
    pub provider_recording_id: String,
    pub url: String,
    pub duration_secs: Option<i32>,
    pub channels: i32,
    pub status: RecordingStatus,
}

// ── Event types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CallEventRecord {
    pub id: i64,
    pub call_id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ── Stats types ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusCount {
    pub status: CallStatus,
    pub count: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallStats {
    pub total: i64,
    pub inbound: i64,
    pub outbound: i64,
    pub by_status: Vec<StatusCount>,
    pub total_duration_secs: i64,
    /// Mean over calls that have a duration.
    pub average_duration_secs: f64,
}

/// Order status counts along the state machine rather than alphabetically.
pub(crate) fn sort_by_status(counts: &mut [StatusCount]) {
    counts.sort_by_key(|c| CallStatus::ALL.iter().position(|s| *s == c.status));
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct StatsRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl StatsRange {
    pub(crate) fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |f| at >= f) && self.to.map_or(true, |t| at <= t)
    }
}

/// A contact matched by phone number in the CRM.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactMatch {
    pub contact_id: i64,
    pub deal_id: Option<i64>,
    pub lead_id: Option<i64>,
    pub display_name: Option<String>,
}

// ── Registry contract ───────────────────────────────────────────

/// Data access for calls and their children. No business rules beyond
/// referential consistency; the state machine lives in the orchestrator.
#[async_trait]
pub trait CallRegistry: Send + Sync {
    async fn create_call(&self, call: NewCall) -> Result<CallRecord>;
    async fn find_by_id(&self, id: Uuid) -> Result<Option<CallRecord>>;
    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> Result<Option<CallRecord>>;
    /// Atomic get-or-insert on `provider_call_id`. The first writer's metadata
    /// wins; returns `true` when this call created the row.
    async fn find_or_create_by_provider_call_id(&self, call: NewCall) -> Result<(CallRecord, bool)>;
    /// Sets the provider id only while it is still unset. `true` when the row
    /// now carries `provider_call_id`, including when it already did.
    async fn set_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> Result<bool>;
    async fn find_by_user(&self, user_id: &str, filter: &CallFilter, page: Page) -> Result<CallPage>;
    /// Compare-and-swap on `version`. `None` means another writer got there first.
    async fn update_status(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &StatusPatch,
    ) -> Result<Option<CallRecord>>;
    async fn update_details(
        &self,
        id: Uuid,
        user_id: &str,
        details: &CallDetails,
    ) -> Result<Option<CallRecord>>;
    async fn assign_agent(&self, id: Uuid, agent_id: &str) -> Result<bool>;
    async fn set_conference(&self, id: Uuid, conference_sid: &str) -> Result<bool>;
    async fn soft_delete(&self, id: Uuid, user_id: &str) -> Result<bool>;
    async fn restore(&self, id: Uuid, user_id: &str) -> Result<bool>;
    async fn hard_delete(&self, id: Uuid) -> Result<bool>;
    async fn get_stats(&self, user_id: Option<&str>, range: StatsRange) -> Result<CallStats>;

    async fn add_participant(&self, participant: NewParticipant) -> Result<ParticipantRecord>;
    async fn find_participant_by_leg(
        &self,
        call_id: Uuid,
        provider_leg_id: &str,
    ) -> Result<Option<ParticipantRecord>>;
    async fn mark_participant_left(&self, participant_id: i64, left_at: DateTime<Utc>) -> Result<bool>;
    async fn set_participant_flags(
        &self,
        participant_id: i64,
        muted: Option<bool>,
        on_hold: Option<bool>,
    ) -> Result<Option<ParticipantRecord>>;
    async fn list_participants(&self, call_id: Uuid) -> Result<Vec<ParticipantRecord>>;

    /// Idempotent on `provider_recording_id`: a replayed callback refreshes
    /// url, duration and status of the existing row.
    async fn upsert_recording(&self, recording: NewRecording) -> Result<RecordingRecord>;
    async fn update_recording_status(
        &self,
        provider_recording_id: &str,
        status: RecordingStatus,
    ) -> Result<bool>;
    async fn update_transcription(
        &self,
        provider_recording_id: &str,
        status: TranscriptionStatus,
        transcript: Option<&str>,
    ) -> Result<Option<RecordingRecord>>;
    async fn list_recordings(&self, call_id: Uuid) -> Result<Vec<RecordingRecord>>;
    async fn latest_recording(&self, call_id: Uuid) -> Result<Option<RecordingRecord>>;

    async fn append_event(
        &self,
        call_id: Uuid,
        event_type: &str,
        payload: Value,
        user_id: Option<&str>,
    ) -> Result<CallEventRecord>;
    async fn list_events(&self, call_id: Uuid) -> Result<Vec<CallEventRecord>>;
}

// ── Row decoding ────────────────────────────────────────────────

/// Decode a `TEXT` column into one of the closed string enums.
fn text_enum<T>(row: &PgRow, column: &str) -> sqlx::Result<T>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(|e: UnknownVariant| sqlx::Error::ColumnDecode {
        index: column.to_string(),
        source: Box::new(e),
    })
}

fn opt_text_enum<T>(row: &PgRow, column: &str) -> sqlx::Result<Option<T>>
where
    T: std::str::FromStr<Err = UnknownVariant>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|s| s.parse())
        .transpose()
        .map_err(|e: UnknownVariant| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: Box::new(e),
        })
}

impl<'r> sqlx::FromRow<'r, PgRow> for CallRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(CallRecord {
            id: row.try_get("id")?,
            provider_call_id: row.try_get("provider_call_id")?,
            provider_account_id: row.try_get("provider_account_id")?,
            direction: text_enum(row, "direction")?,
            status: text_enum(row, "status")?,
            from_number: row.try_get("from_number")?,
            to_number: row.try_get("to_number")?,
            started_at: row.try_get("started_at")?,
            answered_at: row.try_get("answered_at")?,
            ended_at: row.try_get("ended_at")?,
            duration_secs: row.try_get("duration_secs")?,
            ring_duration_secs: row.try_get("ring_duration_secs")?,
            user_id: row.try_get("user_id")?,
            contact_id: row.try_get("contact_id")?,
            deal_id: row.try_get("deal_id")?,
            lead_id: row.try_get("lead_id")?,
            disposition: opt_text_enum(row, "disposition")?,
            notes: row.try_get("notes")?,
            summary: row.try_get("summary")?,
            queue_name: row.try_get("queue_name")?,
            assigned_agent_id: row.try_get("assigned_agent_id")?,
            conference_sid: row.try_get("conference_sid")?,
            status_changed_at: row.try_get("status_changed_at")?,
            version: row.try_get("version")?,
            deleted_at: row.try_get("deleted_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for ParticipantRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(ParticipantRecord {
            id: row.try_get("id")?,
            call_id: row.try_get("call_id")?,
            provider_leg_id: row.try_get("provider_leg_id")?,
            phone_number: row.try_get("phone_number")?,
            display_name: row.try_get("display_name")?,
            role: text_enum(row, "role")?,
            joined_at: row.try_get("joined_at")?,
            left_at: row.try_get("left_at")?,
            muted: row.try_get("muted")?,
            on_hold: row.try_get("on_hold")?,
        })
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for RecordingRecord {
    fn from_row(row: &'r PgRow) -> sqlx::Result<Self> {
        Ok(RecordingRecord {
            id: row.try_get("id")?,
            call_id: row.try_get("call_id")?,
            provider_recording_id: row.try_get("provider_recording_id")?,
            url: row.try_get("url")?,
            duration_secs: row.try_get("duration_secs")?,
            channels: row.try_get("channels")?,
            status: text_enum(row, "status")?,
            transcription_status: text_enum(row, "transcription_status")?,
            transcript: row.try_get("transcript")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

// ── Database struct and connection ──────────────────────────────

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to PostgreSQL using the provided database URL.
    ///
    /// Manually parses the URL so pooler usernames with a `.project-ref`
    /// suffix survive intact.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = url::Url::parse(database_url)?;
        let username = urlencoding::decode(url.username())?.into_owned();
        let password = url
            .password()
            .map(|p| urlencoding::decode(p).map(|s| s.into_owned()))
            .transpose()?;
        let mut opts = PgConnectOptions::new()
            .host(url.host_str().unwrap_or("localhost"))
            .port(url.port().unwrap_or(5432))
            .database(url.path().trim_start_matches('/'))
            .username(&username)
            .statement_cache_capacity(0);
        if let Some(ref pw) = password {
            opts = opts.password(pw);
        }
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect_with(opts)
            .await?;
        Ok(Database { pool })
    }

    /// Get a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply `migrations/*.sql` in order. Every statement is idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_calls.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Health check: execute `SELECT 1` to verify database connectivity.
    ///
    /// Used by the `/readyz` readiness probe.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl CallRegistry for Database {
    async fn create_call(&self, call: NewCall) -> Result<CallRecord> {
        self.insert_call(&call).await
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<CallRecord>> {
        self.get_call(id).await
    }

    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> Result<Option<CallRecord>> {
        self.get_call_by_provider_id(provider_call_id).await
    }

    async fn find_or_create_by_provider_call_id(&self, call: NewCall) -> Result<(CallRecord, bool)> {
        self.get_or_insert_call(&call).await
    }

    async fn set_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> Result<bool> {
        self.attach_provider_call_id(id, provider_call_id).await
    }

    async fn find_by_user(&self, user_id: &str, filter: &CallFilter, page: Page) -> Result<CallPage> {
        self.get_calls_for_user(user_id, filter, page).await
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &StatusPatch,
    ) -> Result<Option<CallRecord>> {
        self.update_call_status(id, expected_version, patch).await
    }

    async fn update_details(
        &self,
        id: Uuid,
        user_id: &str,
        details: &CallDetails,
    ) -> Result<Option<CallRecord>> {
        self.update_call_details(id, user_id, details).await
    }

    async fn assign_agent(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        self.set_assigned_agent(id, agent_id).await
    }

    async fn set_conference(&self, id: Uuid, conference_sid: &str) -> Result<bool> {
        self.set_call_conference(id, conference_sid).await
    }

    async fn soft_delete(&self, id: Uuid, user_id: &str) -> Result<bool> {
        self.soft_delete_call(id, user_id).await
    }

    async fn restore(&self, id: Uuid, user_id: &str) -> Result<bool> {
        self.restore_call(id, user_id).await
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        self.delete_call(id).await
    }

    async fn get_stats(&self, user_id: Option<&str>, range: StatsRange) -> Result<CallStats> {
        self.get_call_stats(user_id, range).await
    }

    async fn add_participant(&self, participant: NewParticipant) -> Result<ParticipantRecord> {
        self.insert_participant(&participant).await
    }

    async fn find_participant_by_leg(
        &self,
        call_id: Uuid,
        provider_leg_id: &str,
    ) -> Result<Option<ParticipantRecord>> {
        self.get_participant_by_leg(call_id, provider_leg_id).await
    }

    async fn mark_participant_left(&self, participant_id: i64, left_at: DateTime<Utc>) -> Result<bool> {
        self.stamp_participant_left(participant_id, left_at).await
    }

    async fn set_participant_flags(
        &self,
        participant_id: i64,
        muted: Option<bool>,
        on_hold: Option<bool>,
    ) -> Result<Option<ParticipantRecord>> {
        self.update_participant_flags(participant_id, muted, on_hold).await
    }

    async fn list_participants(&self, call_id: Uuid) -> Result<Vec<ParticipantRecord>> {
        self.get_participants(call_id).await
    }

    async fn upsert_recording(&self, recording: NewRecording) -> Result<RecordingRecord> {
        self.upsert_call_recording(&recording).await
    }

    async fn update_recording_status(
        &self,
        provider_recording_id: &str,
        status: RecordingStatus,
    ) -> Result<bool> {
        self.set_recording_status(provider_recording_id, status).await
    }

    async fn update_transcription(
        &self,
        provider_recording_id: &str,
        status: TranscriptionStatus,
        transcript: Option<&str>,
    ) -> Result<Option<RecordingRecord>> {
        self.set_transcription(provider_recording_id, status, transcript)
            .await
    }

    async fn list_recordings(&self, call_id: Uuid) -> Result<Vec<RecordingRecord>> {
        self.get_recordings(call_id).await
    }

    async fn latest_recording(&self, call_id: Uuid) -> Result<Option<RecordingRecord>> {
        self.get_latest_recording(call_id).await
    }

    async fn append_event(
        &self,
        call_id: Uuid,
        event_type: &str,
        payload: Value,
        user_id: Option<&str>,
    ) -> Result<CallEventRecord> {
        self.insert_call_event(call_id, event_type, &payload, user_id)
            .await
    }

    async fn list_events(&self, call_id: Uuid) -> Result<Vec<CallEventRecord>> {
        self.get_call_events(call_id).await
    }
}

// ── Tests ───────────────────────────────────────────────────────
