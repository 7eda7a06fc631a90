//! The call state machine as a pure function.
//!
//! [`decide`] looks at the stored call and one status observation and either
//! produces the [`StatusPatch`] to write or says why the observation changes
//! nothing. It never reads the clock: every observation carries its own
//! timestamp, so replaying the same observation yields the same answer.

use crate::call::CallStatus;
use crate::db::{CallRecord, StatusPatch};
use chrono::{DateTime, Utc};

/// One status report for a call, from a webhook or a local action.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusObservation {
    pub status: CallStatus,
    pub at: DateTime<Utc>,
    /// Provider-reported call duration, preferred over a computed one.
    pub duration_secs: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Same status already applied, nothing new to merge.
    Duplicate,
    /// Older than the last applied status.
    Stale,
    /// A transient status behind the current one.
    Backward,
    /// Transient status for a call that has already ended.
    AfterTerminal,
}

impl IgnoreReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            IgnoreReason::Duplicate => "duplicate",
            IgnoreReason::Stale => "stale",
            IgnoreReason::Backward => "backward",
            IgnoreReason::AfterTerminal => "after-terminal",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Apply(StatusPatch),
    Ignore(IgnoreReason),
}

fn secs_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i32 {
    i32::try_from((to - from).num_seconds().max(0)).unwrap_or(i32::MAX)
}

/// Timing fields for entering `obs.status`.
fn stamped_patch(call: &CallRecord, obs: &StatusObservation) -> StatusPatch {
    let mut patch = StatusPatch {
        status: obs.status,
        answered_at: None,
        ended_at: None,
        duration_secs: None,
        ring_duration_secs: None,
        status_changed_at: obs.at,
    };
    if obs.status == CallStatus::InProgress && call.answered_at.is_none() {
        patch.answered_at = Some(obs.at);
        patch.ring_duration_secs = Some(secs_between(call.started_at, obs.at));
    }
    if obs.status.is_terminal() {
        patch.ended_at = Some(obs.at);
        patch.duration_secs = Some(obs.duration_secs.unwrap_or_else(|| {
            secs_between(call.answered_at.unwrap_or(call.started_at), obs.at)
        }));
    }
    patch
}

/// Merge timing into an already-terminal call without changing its status.
/// Returns `None` when the observation adds nothing.
fn merge_terminal_timing(call: &CallRecord, obs: &StatusObservation) -> Option<StatusPatch> {
    let ended_at = call.ended_at.is_none().then_some(obs.at);
    let duration_secs = match obs.duration_secs {
        Some(d) if call.duration_secs != Some(d) => Some(d),
        _ => None,
    };
    if ended_at.is_none() && duration_secs.is_none() {
        return None;
    }
    Some(StatusPatch {
        status: call.status,
        answered_at: None,
        ended_at,
        duration_secs,
        ring_duration_secs: None,
        status_changed_at: obs.at,
    })
}

pub fn decide(call: &CallRecord, obs: &StatusObservation) -> Decision {
    let current = call.status;

    if current.is_terminal() {
        if !obs.status.is_terminal() {
            return Decision::Ignore(IgnoreReason::AfterTerminal);
        }
        if obs.at <= call.status_changed_at {
            return if obs.status == current {
                Decision::Ignore(IgnoreReason::Duplicate)
            } else {
                Decision::Ignore(IgnoreReason::Stale)
            };
        }
        // Same outcome re-reported, or the provider's own `completed` for a
        // call we routed to voicemail: keep the status, fill in timing.
        if obs.status == current
            || (current == CallStatus::Voicemail && obs.status == CallStatus::Completed)
        {
            return match merge_terminal_timing(call, obs) {
                Some(patch) => Decision::Apply(patch),
                None => Decision::Ignore(IgnoreReason::Duplicate),
            };
        }
        return Decision::Apply(stamped_patch(call, obs));
    }

    if obs.at < call.status_changed_at {
        return Decision::Ignore(IgnoreReason::Stale);
    }
    if obs.status == current {
        return Decision::Ignore(IgnoreReason::Duplicate);
    }
    if !obs.status.is_terminal() && obs.status.rank() < current.rank() {
        return Decision::Ignore(IgnoreReason::Backward);
    }
    Decision::Apply(stamped_patch(call, obs))
}

/// Status a local hang-up moves the call to.
pub fn local_end_status(current: CallStatus) -> CallStatus {
    if current == CallStatus::InProgress {
        CallStatus::Completed
    } else {
        CallStatus::Canceled
    }
}
