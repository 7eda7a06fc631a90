//! Call lifecycle scenarios driven straight through the orchestrator.
//!
//! These tests skip HTTP entirely and feed the orchestrator the same typed
//! inputs the webhook handlers build. Timestamps are explicit wherever
//! ordering matters, so out-of-order delivery is reproducible.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test orchestrator_scenarios
//! ```

mod common;

use chrono::{DateTime, Duration, Utc};
use common::{orchestrator, GatewayCall};
use switchboard::call::{CallDirection, CallStatus, ParticipantRole, TranscriptionStatus};
use switchboard::db::{CallFilter, CallRegistry, Page};
use switchboard::events::CallNotification;
use switchboard::orchestrator::{
    AgentAction, CallError, IgnoreReason, IncomingCall, InitiateCall, ParticipantEvent,
    ParticipantEventKind, RecordingCallback, StatusUpdate,
};

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn update(sid: &str, status: CallStatus, secs: i64) -> StatusUpdate {
    StatusUpdate {
        provider_call_id: sid.to_string(),
        call_id: None,
        status,
        at: Some(t0() + Duration::seconds(secs)),
        duration_secs: None,
        direction: Some(CallDirection::Inbound),
        from_number: Some("+15557654321".into()),
        to_number: Some("+15550001111".into()),
        provider_account_id: Some("ACtest".into()),
    }
}

fn incoming(sid: &str) -> IncomingCall {
    IncomingCall {
        provider_call_id: sid.to_string(),
        provider_account_id: Some("ACtest".into()),
        from_number: "+15557654321".into(),
        to_number: "+15550001111".into(),
        status: None,
        at: Some(t0()),
    }
}

fn participant(call_ref: &str, leg: &str, kind: ParticipantEventKind, secs: i64) -> ParticipantEvent {
    ParticipantEvent {
        friendly_name: call_ref.to_string(),
        conference_sid: "CF1".into(),
        provider_call_id: leg.to_string(),
        kind,
        phone_number: None,
        muted: None,
        on_hold: None,
        at: Some(t0() + Duration::seconds(secs)),
    }
}

// ── Ordering and idempotency ───────────────────────────────────

#[tokio::test]
async fn older_report_is_stale() {
    let t = orchestrator();
    t.orchestrator
        .update_call_status(update("CA1", CallStatus::Ringing, 5))
        .await
        .unwrap();
    let outcome = t
        .orchestrator
        .update_call_status(update("CA1", CallStatus::InProgress, 3))
        .await
        .unwrap();
    assert_eq!(outcome.ignored, Some(IgnoreReason::Stale));
    assert_eq!(outcome.call.status, CallStatus::Ringing);
}

#[tokio::test]
async fn late_ringing_after_completion_changes_nothing() {
    let t = orchestrator();
    let mut done = update("CA1", CallStatus::Completed, 30);
    done.duration_secs = Some(25);
    t.orchestrator.update_call_status(done).await.unwrap();
    let outcome = t
        .orchestrator
        .update_call_status(update("CA1", CallStatus::Ringing, 40))
        .await
        .unwrap();
    assert_eq!(outcome.ignored, Some(IgnoreReason::AfterTerminal));
    assert_eq!(outcome.call.duration_secs, Some(25));
    assert_eq!(t.registry.call_count(), 1);
}

#[tokio::test]
async fn answer_stamps_ring_duration() {
    let t = orchestrator();
    t.orchestrator
        .update_call_status(update("CA1", CallStatus::Ringing, 0))
        .await
        .unwrap();
    let answered = t
        .orchestrator
        .update_call_status(update("CA1", CallStatus::InProgress, 12))
        .await
        .unwrap()
        .call;
    assert_eq!(answered.answered_at, Some(t0() + Duration::seconds(12)));
    assert_eq!(answered.ring_duration_secs, Some(12));

    let ended = t
        .orchestrator
        .update_call_status(update("CA1", CallStatus::Completed, 72))
        .await
        .unwrap()
        .call;
    // No provider duration: computed from answer to end.
    assert_eq!(ended.duration_secs, Some(60));
    assert_eq!(ended.ended_at, Some(t0() + Duration::seconds(72)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callbacks_converge_on_one_row() {
    let t = orchestrator();
    let statuses = [
        (CallStatus::Ringing, 1),
        (CallStatus::InProgress, 2),
        (CallStatus::Completed, 3),
    ];
    let mut tasks = Vec::new();
    for round in 0..8 {
        for (status, secs) in statuses {
            let orch = t.orchestrator.clone();
            tasks.push(tokio::spawn(async move {
                let mut u = update("CA42", status, secs);
                if status == CallStatus::Completed {
                    u.duration_secs = Some(50);
                }
                // Vary arrival order between rounds.
                if round % 2 == 0 {
                    tokio::task::yield_now().await;
                }
                orch.update_call_status(u).await
            }));
        }
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(t.registry.call_count(), 1);
    let call = t
        .registry
        .find_by_provider_call_id("CA42")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(call.status, CallStatus::Completed);
    assert_eq!(call.duration_secs, Some(50));
    let ended = t
        .notifier
        .all()
        .into_iter()
        .filter(|n| matches!(n, CallNotification::Ended { .. }))
        .count();
    assert_eq!(ended, 1);
}

// ── Inbound routing ────────────────────────────────────────────

#[tokio::test]
async fn incoming_replay_keeps_original_owner() {
    let t = orchestrator();
    let first = t.orchestrator.handle_incoming_call(incoming("CA9")).await.unwrap();
    assert_eq!(first.agent_id, "admin");
    assert_eq!(first.call.status, CallStatus::Ringing);
    assert!(first.twiml.contains("<Client>user_admin</Client>"));

    let replay = t.orchestrator.handle_incoming_call(incoming("CA9")).await.unwrap();
    assert_eq!(replay.call.id, first.call.id);
    assert_eq!(replay.agent_id, first.call.user_id);
    assert_eq!(t.registry.call_count(), 1);
    let incoming_count = t
        .notifier
        .kinds()
        .into_iter()
        .filter(|k| *k == "incoming")
        .count();
    assert_eq!(incoming_count, 1);
}

#[tokio::test]
async fn voicemail_then_provider_completion_keeps_voicemail() {
    let t = orchestrator();
    t.orchestrator.handle_incoming_call(incoming("CA9")).await.unwrap();
    t.orchestrator
        .handle_voicemail("CA9", Some("no-answer"), Some(t0() + Duration::seconds(20)))
        .await
        .unwrap();
    let mut done = update("CA9", CallStatus::Completed, 80);
    done.duration_secs = Some(80);
    let outcome = t.orchestrator.update_call_status(done).await.unwrap();
    assert_eq!(outcome.ignored, None);
    assert_eq!(outcome.call.status, CallStatus::Voicemail);
    assert_eq!(outcome.call.duration_secs, Some(80));
}

// ── Outbound calls ─────────────────────────────────────────────

#[tokio::test]
async fn initiate_call_stays_initiated_until_the_provider_reports() {
    let t = orchestrator();
    let placed = t
        .orchestrator
        .initiate_call(
            "7",
            Some("seven@example.com"),
            InitiateCall {
                to_number: "+44 20 7183 8750".into(),
                deal_id: Some(3),
                ..InitiateCall::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(placed.call.status, CallStatus::Initiated);
    assert_eq!(placed.call.provider_call_id.as_deref(), Some("CA999"));
    assert_eq!(placed.call.to_number, "+442071838750");
    assert_eq!(placed.call.deal_id, Some(3));
    assert_eq!(t.notifier.kinds(), vec!["started"]);

    let mut u = update("CA999", CallStatus::InProgress, 0);
    u.at = Some(Utc::now());
    let outcome = t.orchestrator.update_call_status(u).await.unwrap();
    assert!(!outcome.created);
    assert_eq!(outcome.call.id, placed.call.id);
    assert_eq!(outcome.call.status, CallStatus::InProgress);
}

#[tokio::test]
async fn initiated_callback_before_create_response_links_the_placed_call() {
    let t = orchestrator();
    *t.gateway.early_status.lock().unwrap() = Some(t.orchestrator.clone());
    let placed = t
        .orchestrator
        .initiate_call(
            "u1",
            None,
            InitiateCall {
                to_number: "+15557654321".into(),
                ..InitiateCall::default()
            },
        )
        .await;
    // Break the gateway -> orchestrator cycle before asserting.
    t.gateway.early_status.lock().unwrap().take();
    let placed = placed.unwrap();

    assert_eq!(t.gateway.early_outcome.lock().unwrap().clone(), Some(Ok(false)));
    assert_eq!(t.registry.call_count(), 1);
    assert_eq!(placed.call.user_id, "u1");
    assert_eq!(placed.call.provider_call_id.as_deref(), Some("CA999"));
    assert_eq!(placed.call.status, CallStatus::Initiated);

    let mut u = update("CA999", CallStatus::Ringing, 0);
    u.at = Some(Utc::now());
    let outcome = t.orchestrator.update_call_status(u).await.unwrap();
    assert!(!outcome.created);
    assert_eq!(outcome.call.id, placed.call.id);
    assert_eq!(outcome.call.status, CallStatus::Ringing);
}

#[tokio::test]
async fn recording_callback_falls_back_to_the_url_call_id() {
    let t = orchestrator();
    let call = t.orchestrator.handle_incoming_call(incoming("CA77")).await.unwrap().call;
    let cb = RecordingCallback {
        provider_call_id: "CA-unlinked".into(),
        call_id: Some(call.id),
        recording_sid: "RE77".into(),
        url: "https://api.twilio.com/rec/RE77".into(),
        duration_secs: Some(5),
        channels: None,
        status: Some("completed".into()),
    };
    let rec = t.orchestrator.handle_recording_ready(cb.clone()).await.unwrap();
    assert_eq!(rec.call_id, call.id);

    let orphan = RecordingCallback {
        call_id: None,
        recording_sid: "RE78".into(),
        ..cb
    };
    let err = t.orchestrator.handle_recording_ready(orphan).await.unwrap_err();
    assert!(matches!(err, CallError::NotFound(_)));
}

#[tokio::test]
async fn unknown_browser_leg_is_owned_by_its_agent() {
    let t = orchestrator();
    let mut u = update("CA404", CallStatus::Ringing, 0);
    u.direction = Some(CallDirection::Outbound);
    u.from_number = Some("+15550001111".into());
    u.to_number = Some("client:user_42".into());
    let outcome = t.orchestrator.update_call_status(u).await.unwrap();
    assert!(outcome.created);
    assert_eq!(outcome.call.user_id, "42");

    // A plain PSTN caller falls back to the configured owner.
    let outcome = t
        .orchestrator
        .update_call_status(update("CA405", CallStatus::Ringing, 0))
        .await
        .unwrap();
    assert_eq!(outcome.call.user_id, "admin");
}

#[tokio::test]
async fn provider_failure_fails_the_call_and_logs_the_error() {
    let t = orchestrator();
    *t.gateway.fail_initiate.lock().unwrap() = true;
    let err = t
        .orchestrator
        .initiate_call(
            "7",
            None,
            InitiateCall {
                to_number: "+15557654321".into(),
                ..InitiateCall::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Provider(_)));

    let page = t
        .registry
        .find_by_user("7", &CallFilter::default(), Page::default())
        .await
        .unwrap();
    let call = &page.calls[0];
    assert_eq!(call.status, CallStatus::Failed);
    let events = t.registry.list_events(call.id).await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "provider-error"));
    assert!(t.notifier.kinds().contains(&"ended"));
}

#[tokio::test]
async fn end_call_completes_an_answered_call() {
    let t = orchestrator();
    let placed = t
        .orchestrator
        .initiate_call(
            "7",
            None,
            InitiateCall {
                to_number: "+15557654321".into(),
                ..InitiateCall::default()
            },
        )
        .await
        .unwrap();
    let mut u = update("CA999", CallStatus::InProgress, 0);
    u.at = Some(Utc::now());
    t.orchestrator.update_call_status(u).await.unwrap();

    let ended = t.orchestrator.end_call(placed.call.id, "7").await.unwrap();
    assert_eq!(ended.status, CallStatus::Completed);
    assert!(t.gateway.recorded().contains(&GatewayCall::End("CA999".into())));

    let other = t.orchestrator.end_call(placed.call.id, "8").await.unwrap_err();
    assert!(matches!(other, CallError::NotFound(_)));
}

// ── Recordings and transcriptions ──────────────────────────────

#[tokio::test]
async fn recording_replay_keeps_one_row_and_transcript_lands() {
    let t = orchestrator();
    let call = t.orchestrator.handle_incoming_call(incoming("CA5")).await.unwrap().call;
    let cb = RecordingCallback {
        provider_call_id: "CA5".into(),
        call_id: None,
        recording_sid: "RE1".into(),
        url: "https://api.twilio.com/rec/RE1".into(),
        duration_secs: Some(31),
        channels: Some(2),
        status: Some("completed".into()),
    };
    t.orchestrator.handle_recording_ready(cb.clone()).await.unwrap();
    t.orchestrator.handle_recording_ready(cb).await.unwrap();
    assert_eq!(t.registry.list_recordings(call.id).await.unwrap().len(), 1);
    assert!(t.notifier.kinds().contains(&"recording-ready"));

    let rec = t
        .orchestrator
        .handle_transcription("RE1", "completed", Some("please call me back"))
        .await
        .unwrap();
    assert_eq!(rec.transcription_status, TranscriptionStatus::Completed);
    assert_eq!(rec.transcript.as_deref(), Some("please call me back"));

    let missing = t
        .orchestrator
        .handle_transcription("RE404", "completed", None)
        .await
        .unwrap_err();
    assert!(matches!(missing, CallError::NotFound(_)));
}

// ── Conference participants ────────────────────────────────────

#[tokio::test]
async fn participant_lifecycle_and_controls() {
    let t = orchestrator();
    let call = t.orchestrator.handle_incoming_call(incoming("CA1")).await.unwrap().call;
    let call_ref = call.id.to_string();

    let caller = t
        .orchestrator
        .handle_participant_event(participant(&call_ref, "CA1", ParticipantEventKind::Join, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(caller.role, ParticipantRole::Caller);
    assert_eq!(caller.phone_number, "+15557654321");

    let extra = t
        .orchestrator
        .handle_participant_event(participant(&call_ref, "CA2", ParticipantEventKind::Join, 2))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(extra.role, ParticipantRole::Conference);

    // A repeated join is the same participant.
    let again = t
        .orchestrator
        .handle_participant_event(participant(&call_ref, "CA2", ParticipantEventKind::Join, 3))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(again.id, extra.id);

    let muted = t
        .orchestrator
        .handle_participant_event(participant(&call_ref, "CA2", ParticipantEventKind::Mute, 4))
        .await
        .unwrap()
        .unwrap();
    assert!(muted.muted);

    let held = t
        .orchestrator
        .set_participant_hold(call.id, "admin", caller.id, true)
        .await
        .unwrap();
    assert!(held.on_hold);
    assert!(t
        .gateway
        .recorded()
        .contains(&GatewayCall::Hold("CF1".into(), "CA1".into(), true)));

    let left = t
        .orchestrator
        .handle_participant_event(participant("CA1", "CA2", ParticipantEventKind::Leave, 5))
        .await
        .unwrap()
        .unwrap();
    assert!(left.left_at.is_some());

    let stored = t.registry.find_by_id(call.id).await.unwrap().unwrap();
    assert_eq!(stored.conference_sid.as_deref(), Some("CF1"));
    let participants = t.registry.list_participants(call.id).await.unwrap();
    assert_eq!(participants.len(), 2);

    let gone = t
        .orchestrator
        .set_participant_mute(call.id, "admin", extra.id, true)
        .await
        .unwrap_err();
    assert!(matches!(gone, CallError::NotFound(_)));
}

#[tokio::test]
async fn participant_event_for_unknown_conference_is_not_found() {
    let t = orchestrator();
    let err = t
        .orchestrator
        .handle_participant_event(participant("nobody", "CAx", ParticipantEventKind::Join, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::NotFound(_)));
}

// ── Agent actions ──────────────────────────────────────────────

#[tokio::test]
async fn accepted_call_is_visible_to_the_agent() {
    let t = orchestrator();
    let call = t.orchestrator.handle_incoming_call(incoming("CA3")).await.unwrap().call;
    assert!(t.orchestrator.get_call(call.id, "bob").await.is_err());

    t.orchestrator
        .handle_agent_action(AgentAction::Accepted {
            call_id: call.id,
            agent_id: "bob".into(),
        })
        .await;
    t.orchestrator
        .handle_agent_action(AgentAction::Note {
            call_id: call.id,
            agent_id: "bob".into(),
            note: "wants a quote".into(),
        })
        .await;

    let seen = t.orchestrator.get_call(call.id, "bob").await.unwrap();
    assert_eq!(seen.call.assigned_agent_id.as_deref(), Some("bob"));
    let events = t.orchestrator.list_call_events(call.id, "bob").await.unwrap();
    assert!(events.iter().any(|e| e.event_type == "agent-accepted"));
    assert!(events
        .iter()
        .any(|e| e.event_type == "note" && e.payload["note"] == "wants a quote"));
}

#[tokio::test]
async fn actions_for_unknown_calls_are_ignored() {
    let t = orchestrator();
    t.orchestrator
        .handle_agent_action(AgentAction::Rejected {
            call_id: uuid::Uuid::new_v4(),
            agent_id: "bob".into(),
        })
        .await;
    assert_eq!(t.registry.call_count(), 0);
}

// ── Listing ────────────────────────────────────────────────────

#[tokio::test]
async fn list_calls_filters_and_enriches() {
    let t = orchestrator();
    t.orchestrator.handle_incoming_call(incoming("CA1")).await.unwrap();
    t.orchestrator.handle_incoming_call(incoming("CA2")).await.unwrap();
    let mut done = update("CA2", CallStatus::Completed, 60);
    done.duration_secs = Some(55);
    t.orchestrator.update_call_status(done).await.unwrap();

    let all = t
        .orchestrator
        .list_calls("admin", &CallFilter::default(), Page::default())
        .await
        .unwrap();
    assert_eq!(all.total, 2);

    let completed = t
        .orchestrator
        .list_calls(
            "admin",
            &CallFilter {
                status: Some(CallStatus::Completed),
                ..CallFilter::default()
            },
            Page::default(),
        )
        .await
        .unwrap();
    assert_eq!(completed.total, 1);
    assert_eq!(completed.calls[0].call.provider_call_id.as_deref(), Some("CA2"));

    let searched = t
        .orchestrator
        .list_calls(
            "admin",
            &CallFilter {
                search: Some("765".into()),
                ..CallFilter::default()
            },
            Page { page: 1, per_page: 1 },
        )
        .await
        .unwrap();
    assert_eq!(searched.total, 2);
    assert_eq!(searched.calls.len(), 1);
}
