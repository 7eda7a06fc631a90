//! Property-based tests for the call state machine and provider helpers.
//!
//! These tests use `proptest` to check invariants over randomly generated
//! statuses, timestamps and inputs. No database or network access is needed.
//!
//! # How to run
//!
//! ```bash
//! cargo test --test property_tests
//!
//! # More cases:
//! PROPTEST_CASES=10000 cargo test --test property_tests
//! ```
//!
//! Each property is named `prop_<function>_<invariant>`.

use chrono::{DateTime, Duration, Utc};
use proptest::prelude::*;
use switchboard::call::{CallDirection, CallStatus};
use switchboard::db::{CallRecord, StatusPatch};
use switchboard::orchestrator::transition::{decide, Decision, StatusObservation};
use switchboard::orchestrator::normalize_e164;
use switchboard::telephony::signature::{compute_signature, validate_signature};
use switchboard::telephony::twiml::escape_xml;
use switchboard::telephony::{map_twilio_status, ProviderCallStatus};
use uuid::Uuid;

fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

fn call(status: CallStatus, changed_secs: i64) -> CallRecord {
    let changed = t0() + Duration::seconds(changed_secs);
    CallRecord {
        id: Uuid::nil(),
        provider_call_id: Some("CA1".into()),
        provider_account_id: None,
        direction: CallDirection::Inbound,
        status,
        from_number: "+15557654321".into(),
        to_number: "+15550001111".into(),
        started_at: t0(),
        answered_at: None,
        ended_at: status.is_terminal().then_some(changed),
        duration_secs: None,
        ring_duration_secs: None,
        user_id: "admin".into(),
        contact_id: None,
        deal_id: None,
        lead_id: None,
        disposition: None,
        notes: None,
        summary: None,
        queue_name: None,
        assigned_agent_id: None,
        conference_sid: None,
        status_changed_at: changed,
        version: 0,
        deleted_at: None,
        created_at: t0(),
        updated_at: changed,
    }
}

/// What the registry does with a patch.
fn merge(mut call: CallRecord, patch: &StatusPatch) -> CallRecord {
    call.status = patch.status;
    call.answered_at = patch.answered_at.or(call.answered_at);
    call.ended_at = patch.ended_at.or(call.ended_at);
    call.duration_secs = patch.duration_secs.or(call.duration_secs);
    call.ring_duration_secs = patch.ring_duration_secs.or(call.ring_duration_secs);
    call.status_changed_at = patch.status_changed_at;
    call.version += 1;
    call
}

fn any_status() -> impl Strategy<Value = CallStatus> {
    prop::sample::select(CallStatus::ALL.to_vec())
}

fn observation() -> impl Strategy<Value = StatusObservation> {
    (any_status(), 0i64..600, prop::option::of(0i32..3600)).prop_map(|(status, secs, duration)| {
        StatusObservation {
            status,
            at: t0() + Duration::seconds(secs),
            duration_secs: duration,
        }
    })
}

proptest! {
    #[test]
    fn prop_map_twilio_status_is_total(raw in "\\PC{0,24}") {
        let status = map_twilio_status(&raw);
        prop_assert!(CallStatus::ALL.contains(&status));
    }

    #[test]
    fn prop_map_twilio_status_ignores_case_and_padding(
        raw in prop::sample::select(vec![
            "queued", "initiated", "ringing", "in-progress", "answered",
            "completed", "busy", "no-answer", "failed", "canceled",
        ]),
        upper in any::<bool>(),
    ) {
        let variant = if upper { raw.to_uppercase() } else { format!("  {} ", raw) };
        prop_assert_eq!(map_twilio_status(&variant), map_twilio_status(raw));
        prop_assert!(!matches!(ProviderCallStatus::parse(&variant), ProviderCallStatus::Unknown(_)));
    }

    #[test]
    fn prop_decide_terminal_never_reverts(
        current in any_status(),
        changed in 0i64..600,
        obs in observation(),
    ) {
        prop_assume!(current.is_terminal());
        if let Decision::Apply(patch) = decide(&call(current, changed), &obs) {
            prop_assert!(patch.status.is_terminal());
        }
    }

    #[test]
    fn prop_decide_transient_rank_never_decreases(
        current in any_status(),
        changed in 0i64..600,
        obs in observation(),
    ) {
        let before = call(current, changed);
        if let Decision::Apply(patch) = decide(&before, &obs) {
            prop_assert!(patch.status.rank() >= current.rank());
            prop_assert!(patch.status_changed_at >= before.status_changed_at || current.is_terminal());
        }
    }

    #[test]
    fn prop_decide_replay_is_ignored(
        current in any_status(),
        changed in 0i64..600,
        obs in observation(),
    ) {
        let before = call(current, changed);
        if let Decision::Apply(patch) = decide(&before, &obs) {
            let after = merge(before, &patch);
            prop_assert!(matches!(decide(&after, &obs), Decision::Ignore(_)));
        }
    }

    #[test]
    fn prop_decide_older_than_current_is_ignored(
        current in any_status(),
        obs in observation(),
    ) {
        let before = call(current, 601);
        prop_assert!(matches!(decide(&before, &obs), Decision::Ignore(_)));
    }

    #[test]
    fn prop_normalize_e164_shape(raw in "[+0-9 ()\\-.]{0,24}") {
        if let Some(e164) = normalize_e164(&raw) {
            prop_assert!(e164.starts_with('+'));
            prop_assert!(e164[1..].chars().all(|c| c.is_ascii_digit()));
            prop_assert!(e164.len() <= 16);
        }
    }

    #[test]
    fn prop_normalize_e164_idempotent(raw in "[+0-9 ()\\-.]{0,24}") {
        if let Some(e164) = normalize_e164(&raw) {
            prop_assert_eq!(normalize_e164(&e164), Some(e164.clone()));
        }
    }

    #[test]
    fn prop_signature_rejects_tampered_params(
        token in "[a-f0-9]{32}",
        sid in "CA[a-f0-9]{8}",
        status in "[a-z\\-]{1,12}",
    ) {
        let url = "https://crm.example.com/api/webhooks/telephony/status";
        let params = vec![
            ("CallSid".to_string(), sid.clone()),
            ("CallStatus".to_string(), status.clone()),
        ];
        let signature = compute_signature(&token, url, &params);
        prop_assert!(validate_signature(&token, &signature, url, &params));

        let tampered = vec![
            ("CallSid".to_string(), sid),
            ("CallStatus".to_string(), format!("{}x", status)),
        ];
        prop_assert!(!validate_signature(&token, &signature, url, &tampered));
    }

    #[test]
    fn prop_escape_xml_leaves_no_markup(raw in "\\PC{0,40}") {
        let escaped = escape_xml(&raw);
        prop_assert!(!escaped.contains('<'));
        prop_assert!(!escaped.contains('>'));
        prop_assert!(!escaped.contains('"'));
    }
}
