//! In-process registry with the same semantics as the PostgreSQL one.
//!
//! Used in development mode (no `DATABASE_URL`) and by the API and scenario
//! tests. All tables sit behind one mutex, so every trait method is a single
//! atomic step just like the single-statement SQL it mirrors.

use super::{
    sort_by_status, CallDetails, CallEventRecord, CallFilter, CallPage, CallRecord, CallRegistry,
    CallStats, ContactMatch, NewCall, NewParticipant, NewRecording, Page, ParticipantRecord,
    RecordingRecord, StatsRange, StatusCount, StatusPatch,
};
use crate::call::{CallDirection, RecordingStatus, TranscriptionStatus};
use crate::lock_or_recover;
use crate::orchestrator::ContactLookup;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    calls: HashMap<Uuid, CallRecord>,
    by_provider_id: HashMap<String, Uuid>,
    participants: Vec<ParticipantRecord>,
    recordings: Vec<RecordingRecord>,
    events: Vec<CallEventRecord>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    fn insert_call(&mut self, call: NewCall) -> CallRecord {
        let now = Utc::now();
        let record = CallRecord {
            id: Uuid::new_v4(),
            provider_call_id: call.provider_call_id,
            provider_account_id: call.provider_account_id,
            direction: call.direction,
            status: call.status,
            from_number: call.from_number,
            to_number: call.to_number,
            started_at: call.started_at,
            answered_at: None,
            ended_at: None,
            duration_secs: None,
            ring_duration_secs: None,
            user_id: call.user_id,
            contact_id: call.contact_id,
            deal_id: call.deal_id,
            lead_id: call.lead_id,
            disposition: None,
            notes: None,
            summary: None,
            queue_name: call.queue_name,
            assigned_agent_id: None,
            conference_sid: None,
            status_changed_at: call.status_changed_at,
            version: 1,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        };
        if let Some(ref sid) = record.provider_call_id {
            self.by_provider_id.insert(sid.clone(), record.id);
        }
        self.calls.insert(record.id, record.clone());
        record
    }

    /// Apply `f` to a call row and bump its version.
    fn touch<F>(&mut self, id: Uuid, f: F) -> Option<CallRecord>
    where
        F: FnOnce(&mut CallRecord) -> bool,
    {
        let call = self.calls.get_mut(&id)?;
        if !f(call) {
            return None;
        }
        call.version += 1;
        call.updated_at = Utc::now();
        Some(call.clone())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    tables: Mutex<Tables>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of call rows, including soft-deleted ones.
    pub fn call_count(&self) -> usize {
        lock_or_recover(&self.tables).calls.len()
    }
}

#[async_trait]
impl CallRegistry for MemoryRegistry {
    async fn create_call(&self, call: NewCall) -> Result<CallRecord> {
        let mut t = lock_or_recover(&self.tables);
        if let Some(ref sid) = call.provider_call_id {
            if t.by_provider_id.contains_key(sid) {
                anyhow::bail!("duplicate provider_call_id {}", sid);
            }
        }
        Ok(t.insert_call(call))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<CallRecord>> {
        Ok(lock_or_recover(&self.tables).calls.get(&id).cloned())
    }

    async fn find_by_provider_call_id(&self, provider_call_id: &str) -> Result<Option<CallRecord>> {
        let t = lock_or_recover(&self.tables);
        Ok(t
            .by_provider_id
            .get(provider_call_id)
            .and_then(|id| t.calls.get(id))
            .cloned())
    }

    async fn find_or_create_by_provider_call_id(&self, call: NewCall) -> Result<(CallRecord, bool)> {
        let mut t = lock_or_recover(&self.tables);
        if let Some(existing) = call
            .provider_call_id
            .as_ref()
            .and_then(|sid| t.by_provider_id.get(sid))
            .and_then(|id| t.calls.get(id))
        {
            return Ok((existing.clone(), false));
        }
        Ok((t.insert_call(call), true))
    }

    async fn set_provider_call_id(&self, id: Uuid, provider_call_id: &str) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        match t.by_provider_id.get(provider_call_id) {
            Some(owner) if *owner == id => return Ok(true),
            Some(_) => anyhow::bail!("duplicate provider_call_id {}", provider_call_id),
            None => {}
        }
        let updated = t.touch(id, |c| {
            if c.provider_call_id.is_some() {
                return false;
            }
            c.provider_call_id = Some(provider_call_id.to_string());
            true
        });
        if updated.is_some() {
            t.by_provider_id.insert(provider_call_id.to_string(), id);
        }
        Ok(updated.is_some())
    }

    async fn find_by_user(&self, user_id: &str, filter: &CallFilter, page: Page) -> Result<CallPage> {
        let t = lock_or_recover(&self.tables);
        let mut calls: Vec<CallRecord> = t
            .calls
            .values()
            .filter(|c| c.user_id == user_id && filter.matches(c))
            .cloned()
            .collect();
        calls.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(a.id.cmp(&b.id)));
        let total = calls.len() as i64;
        let calls = calls
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit() as usize)
            .collect();
        Ok(CallPage {
            calls,
            total,
            page: page.page.max(1),
            per_page: page.limit(),
        })
    }

    async fn update_status(
        &self,
        id: Uuid,
        expected_version: i64,
        patch: &StatusPatch,
    ) -> Result<Option<CallRecord>> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t.touch(id, |c| {
            if c.version != expected_version {
                return false;
            }
            c.status = patch.status;
            c.answered_at = patch.answered_at.or(c.answered_at);
            c.ended_at = patch.ended_at.or(c.ended_at);
            c.duration_secs = patch.duration_secs.or(c.duration_secs);
            c.ring_duration_secs = patch.ring_duration_secs.or(c.ring_duration_secs);
            c.status_changed_at = patch.status_changed_at;
            true
        }))
    }

    async fn update_details(
        &self,
        id: Uuid,
        user_id: &str,
        details: &CallDetails,
    ) -> Result<Option<CallRecord>> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t.touch(id, |c| {
            if c.user_id != user_id || c.is_deleted() {
                return false;
            }
            if let Some(ref notes) = details.notes {
                c.notes = Some(notes.clone());
            }
            if let Some(disposition) = details.disposition {
                c.disposition = Some(disposition);
            }
            if let Some(ref summary) = details.summary {
                c.summary = Some(summary.clone());
            }
            true
        }))
    }

    async fn assign_agent(&self, id: Uuid, agent_id: &str) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t
            .touch(id, |c| {
                c.assigned_agent_id = Some(agent_id.to_string());
                true
            })
            .is_some())
    }

    async fn set_conference(&self, id: Uuid, conference_sid: &str) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t
            .touch(id, |c| {
                c.conference_sid = Some(conference_sid.to_string());
                true
            })
            .is_some())
    }

    async fn soft_delete(&self, id: Uuid, user_id: &str) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t
            .touch(id, |c| {
                if c.user_id != user_id || c.is_deleted() {
                    return false;
                }
                c.deleted_at = Some(Utc::now());
                true
            })
            .is_some())
    }

    async fn restore(&self, id: Uuid, user_id: &str) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t
            .touch(id, |c| {
                if c.user_id != user_id || !c.is_deleted() {
                    return false;
                }
                c.deleted_at = None;
                true
            })
            .is_some())
    }

    async fn hard_delete(&self, id: Uuid) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        let Some(call) = t.calls.remove(&id) else {
            return Ok(false);
        };
        if let Some(sid) = call.provider_call_id {
            t.by_provider_id.remove(&sid);
        }
        t.participants.retain(|p| p.call_id != id);
        t.recordings.retain(|r| r.call_id != id);
        t.events.retain(|e| e.call_id != id);
        Ok(true)
    }

    async fn get_stats(&self, user_id: Option<&str>, range: StatsRange) -> Result<CallStats> {
        let t = lock_or_recover(&self.tables);
        let mut stats = CallStats::default();
        let mut with_duration = 0i64;
        let mut by_status: HashMap<_, i64> = HashMap::new();
        for call in t.calls.values().filter(|c| {
            !c.is_deleted()
                && user_id.map_or(true, |u| c.user_id == u)
                && range.contains(c.started_at)
        }) {
            stats.total += 1;
            match call.direction {
                CallDirection::Inbound => stats.inbound += 1,
                CallDirection::Outbound => stats.outbound += 1,
            }
            *by_status.entry(call.status).or_default() += 1;
            if let Some(d) = call.duration_secs {
                stats.total_duration_secs += i64::from(d);
                with_duration += 1;
            }
        }
        if with_duration > 0 {
            stats.average_duration_secs = stats.total_duration_secs as f64 / with_duration as f64;
        }
        stats.by_status = by_status
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect();
        sort_by_status(&mut stats.by_status);
        Ok(stats)
    }

    async fn add_participant(&self, p: NewParticipant) -> Result<ParticipantRecord> {
        let mut t = lock_or_recover(&self.tables);
        if !t.calls.contains_key(&p.call_id) {
            anyhow::bail!("call {} does not exist", p.call_id);
        }
        let record = ParticipantRecord {
            id: t.next_id(),
            call_id: p.call_id,
            provider_leg_id: p.provider_leg_id,
            phone_number: p.phone_number,
            display_name: p.display_name,
            role: p.role,
            joined_at: p.joined_at,
            left_at: None,
            muted: p.muted,
            on_hold: p.on_hold,
        };
        t.participants.push(record.clone());
        Ok(record)
    }

    async fn find_participant_by_leg(
        &self,
        call_id: Uuid,
        provider_leg_id: &str,
    ) -> Result<Option<ParticipantRecord>> {
        let t = lock_or_recover(&self.tables);
        let mut legs: Vec<_> = t
            .participants
            .iter()
            .filter(|p| p.call_id == call_id && p.provider_leg_id.as_deref() == Some(provider_leg_id))
            .collect();
        legs.sort_by_key(|p| (p.left_at.is_none(), p.joined_at));
        Ok(legs.last().map(|p| (*p).clone()))
    }

    async fn mark_participant_left(&self, participant_id: i64, left_at: DateTime<Utc>) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        match t
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id && p.left_at.is_none())
        {
            Some(p) => {
                p.left_at = Some(left_at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn set_participant_flags(
        &self,
        participant_id: i64,
        muted: Option<bool>,
        on_hold: Option<bool>,
    ) -> Result<Option<ParticipantRecord>> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t
            .participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .map(|p| {
                p.muted = muted.unwrap_or(p.muted);
                p.on_hold = on_hold.unwrap_or(p.on_hold);
                p.clone()
            }))
    }

    async fn list_participants(&self, call_id: Uuid) -> Result<Vec<ParticipantRecord>> {
        let t = lock_or_recover(&self.tables);
        let mut rows: Vec<_> = t
            .participants
            .iter()
            .filter(|p| p.call_id == call_id)
            .cloned()
            .collect();
        rows.sort_by_key(|p| (p.joined_at, p.id));
        Ok(rows)
    }

    async fn upsert_recording(&self, r: NewRecording) -> Result<RecordingRecord> {
        let mut t = lock_or_recover(&self.tables);
        let now = Utc::now();
        if let Some(existing) = t
            .recordings
            .iter_mut()
            .find(|x| x.provider_recording_id == r.provider_recording_id)
        {
            existing.url = r.url;
            existing.duration_secs = r.duration_secs.or(existing.duration_secs);
            existing.channels = r.channels;
            existing.status = r.status;
            existing.updated_at = now;
            return Ok(existing.clone());
        }
        if !t.calls.contains_key(&r.call_id) {
            anyhow::bail!("call {} does not exist", r.call_id);
        }
        let record = RecordingRecord {
            id: t.next_id(),
            call_id: r.call_id,
            provider_recording_id: r.provider_recording_id,
            url: r.url,
            duration_secs: r.duration_secs,
            channels: r.channels,
            status: r.status,
            transcription_status: TranscriptionStatus::Pending,
            transcript: None,
            created_at: now,
            updated_at: now,
        };
        t.recordings.push(record.clone());
        Ok(record)
    }

    async fn update_recording_status(
        &self,
        provider_recording_id: &str,
        status: RecordingStatus,
    ) -> Result<bool> {
        let mut t = lock_or_recover(&self.tables);
        match t
            .recordings
            .iter_mut()
            .find(|r| r.provider_recording_id == provider_recording_id)
        {
            Some(r) => {
                r.status = status;
                r.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_transcription(
        &self,
        provider_recording_id: &str,
        status: TranscriptionStatus,
        transcript: Option<&str>,
    ) -> Result<Option<RecordingRecord>> {
        let mut t = lock_or_recover(&self.tables);
        Ok(t
            .recordings
            .iter_mut()
            .find(|r| r.provider_recording_id == provider_recording_id)
            .map(|r| {
                r.transcription_status = status;
                if let Some(text) = transcript {
                    r.transcript = Some(text.to_string());
                }
                r.updated_at = Utc::now();
                r.clone()
            }))
    }

    async fn list_recordings(&self, call_id: Uuid) -> Result<Vec<RecordingRecord>> {
        let t = lock_or_recover(&self.tables);
        Ok(t
            .recordings
            .iter()
            .filter(|r| r.call_id == call_id)
            .cloned()
            .collect())
    }

    async fn latest_recording(&self, call_id: Uuid) -> Result<Option<RecordingRecord>> {
        let t = lock_or_recover(&self.tables);
        Ok(t
            .recordings
            .iter()
            .rev()
            .find(|r| r.call_id == call_id && r.status != RecordingStatus::Deleted)
            .cloned())
    }

    async fn append_event(
        &self,
        call_id: Uuid,
        event_type: &str,
        payload: Value,
        user_id: Option<&str>,
    ) -> Result<CallEventRecord> {
        let mut t = lock_or_recover(&self.tables);
        if !t.calls.contains_key(&call_id) {
            anyhow::bail!("call {} does not exist", call_id);
        }
        let record = CallEventRecord {
            id: t.next_id(),
            call_id,
            event_type: event_type.to_string(),
            payload,
            user_id: user_id.map(str::to_string),
            created_at: Utc::now(),
        };
        t.events.push(record.clone());
        Ok(record)
    }

    async fn list_events(&self, call_id: Uuid) -> Result<Vec<CallEventRecord>> {
        let t = lock_or_recover(&self.tables);
        Ok(t
            .events
            .iter()
            .filter(|e| e.call_id == call_id)
            .cloned()
            .collect())
    }
}

/// Fixed phone → contact table for development mode and tests.
#[derive(Default)]
pub struct MemoryContacts {
    entries: Mutex<HashMap<String, ContactMatch>>,
}

impl MemoryContacts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, e164: &str, contact: ContactMatch) {
        lock_or_recover(&self.entries).insert(e164.to_string(), contact);
    }
}

#[async_trait]
impl ContactLookup for MemoryContacts {
    async fn find_by_phone(&self, e164: &str) -> Result<Option<ContactMatch>> {
        Ok(lock_or_recover(&self.entries).get(e164).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::{CallStatus, ParticipantRole};

    fn new_call(sid: Option<&str>) -> NewCall {
        let now = Utc::now();
        NewCall {
            provider_call_id: sid.map(str::to_string),
            provider_account_id: None,
            direction: CallDirection::Inbound,
            status: CallStatus::Ringing,
            from_number: "+15550001111".into(),
            to_number: "+15550002222".into(),
            user_id: "owner".into(),
            contact_id: None,
            deal_id: None,
            lead_id: None,
            queue_name: None,
            started_at: now,
            status_changed_at: now,
        }
    }

    fn patch(status: CallStatus) -> StatusPatch {
        StatusPatch {
            status,
            answered_at: None,
            ended_at: None,
            duration_secs: Some(42),
            ring_duration_secs: None,
            status_changed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn find_or_create_is_first_seen_wins() {
        let reg = MemoryRegistry::new();
        let (first, created) = reg
            .find_or_create_by_provider_call_id(new_call(Some("CA1")))
            .await
            .unwrap();
        assert!(created);
        let mut other = new_call(Some("CA1"));
        other.from_number = "+19999999999".into();
        let (second, created) = reg.find_or_create_by_provider_call_id(other).await.unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        assert_eq!(second.from_number, "+15550001111");
        assert_eq!(reg.call_count(), 1);
    }

    #[tokio::test]
    async fn update_status_rejects_stale_version() {
        let reg = MemoryRegistry::new();
        let call = reg.create_call(new_call(Some("CA2"))).await.unwrap();
        let updated = reg
            .update_status(call.id, call.version, &patch(CallStatus::Completed))
            .await
            .unwrap()
            .expect("version matches");
        assert_eq!(updated.version, call.version + 1);
        assert_eq!(updated.duration_secs, Some(42));

        let conflict = reg
            .update_status(call.id, call.version, &patch(CallStatus::Failed))
            .await
            .unwrap();
        assert!(conflict.is_none());
        let stored = reg.find_by_id(call.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CallStatus::Completed);
    }

    #[tokio::test]
    async fn provider_id_is_immutable_once_set() {
        let reg = MemoryRegistry::new();
        let call = reg.create_call(new_call(None)).await.unwrap();
        assert!(reg.set_provider_call_id(call.id, "CA3").await.unwrap());
        assert!(reg.set_provider_call_id(call.id, "CA3").await.unwrap());
        assert!(!reg.set_provider_call_id(call.id, "CA4").await.unwrap());
        let other = reg.create_call(new_call(None)).await.unwrap();
        assert!(reg.set_provider_call_id(other.id, "CA3").await.is_err());
        let found = reg.find_by_provider_call_id("CA3").await.unwrap().unwrap();
        assert_eq!(found.id, call.id);
        assert!(reg.find_by_provider_call_id("CA4").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn soft_delete_is_owner_scoped_and_restorable() {
        let reg = MemoryRegistry::new();
        let call = reg.create_call(new_call(Some("CA5"))).await.unwrap();
        assert!(!reg.soft_delete(call.id, "intruder").await.unwrap());
        assert!(reg.soft_delete(call.id, "owner").await.unwrap());
        let page = reg
            .find_by_user("owner", &CallFilter::default(), Page::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
        assert!(reg.restore(call.id, "owner").await.unwrap());
        assert!(!reg.restore(call.id, "owner").await.unwrap());
    }

    #[tokio::test]
    async fn hard_delete_cascades_children() {
        let reg = MemoryRegistry::new();
        let call = reg.create_call(new_call(Some("CA6"))).await.unwrap();
        reg.add_participant(NewParticipant {
            call_id: call.id,
            provider_leg_id: Some("CA6".into()),
            phone_number: "+15550001111".into(),
            display_name: None,
            role: ParticipantRole::Caller,
            joined_at: Utc::now(),
            muted: false,
            on_hold: false,
        })
        .await
        .unwrap();
        reg.append_event(call.id, "created", Value::Null, None)
            .await
            .unwrap();
        assert!(reg.hard_delete(call.id).await.unwrap());
        assert!(reg.list_participants(call.id).await.unwrap().is_empty());
        assert!(reg.list_events(call.id).await.unwrap().is_empty());
        assert!(reg.find_by_provider_call_id("CA6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recording_upsert_is_idempotent() {
        let reg = MemoryRegistry::new();
        let call = reg.create_call(new_call(Some("CA7"))).await.unwrap();
        let rec = NewRecording {
            call_id: call.id,
            provider_recording_id: "RE1".into(),
            url: "https://example.test/RE1".into(),
            duration_secs: Some(10),
            channels: 1,
            status: RecordingStatus::Completed,
        };
        let a = reg.upsert_recording(rec.clone()).await.unwrap();
        let b = reg.upsert_recording(rec).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(reg.list_recordings(call.id).await.unwrap().len(), 1);

        let t = reg
            .update_transcription("RE1", TranscriptionStatus::Completed, Some("hello"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(t.transcript.as_deref(), Some("hello"));
        assert_eq!(t.status, RecordingStatus::Completed);
    }

    #[tokio::test]
    async fn stats_average_only_counts_calls_with_duration() {
        let reg = MemoryRegistry::new();
        let a = reg.create_call(new_call(Some("CA8"))).await.unwrap();
        reg.create_call(new_call(Some("CA9"))).await.unwrap();
        reg.update_status(a.id, a.version, &patch(CallStatus::Completed))
            .await
            .unwrap();
        let stats = reg.get_stats(Some("owner"), StatsRange::default()).await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.inbound, 2);
        assert_eq!(stats.total_duration_secs, 42);
        assert!((stats.average_duration_secs - 42.0).abs() < f64::EPSILON);
        assert_eq!(stats.by_status[0].status, CallStatus::Ringing);
        assert_eq!(stats.by_status[1].status, CallStatus::Completed);
    }
}
