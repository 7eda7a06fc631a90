//! TwiML call-control documents.
//!
//! Documents are small and fixed-shape, so they are built with `format!` and
//! every interpolated value goes through [`escape_xml`].

const XML_HEADER: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

/// Seconds an incoming dial rings the agent before falling through to voicemail.
pub const DEFAULT_DIAL_TIMEOUT_SECS: u32 = 20;

/// Escape the five XML special characters for text and attribute content.
pub fn escape_xml(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Browser-originated call: dial the PSTN number, record both legs.
pub fn outbound(to_number: &str, caller_id: &str, recording_callback: &str) -> String {
    format!(
        r#"{header}
<Response>
  <Dial callerId="{caller_id}" record="record-from-answer-dual" recordingStatusCallback="{callback}" recordingStatusCallbackMethod="POST">
    <Number>{to}</Number>
  </Dial>
</Response>"#,
        header = XML_HEADER,
        caller_id = escape_xml(caller_id),
        callback = escape_xml(recording_callback),
        to = escape_xml(to_number),
    )
}

/// Inbound call: ring one browser client; an unanswered dial requests `action`.
pub fn incoming(
    client_identity: &str,
    voicemail_action: &str,
    recording_callback: &str,
    timeout_secs: u32,
) -> String {
    format!(
        r#"{header}
<Response>
  <Dial timeout="{timeout}" action="{action}" method="POST" record="record-from-answer-dual" recordingStatusCallback="{callback}" recordingStatusCallbackMethod="POST">
    <Client>{identity}</Client>
  </Dial>
</Response>"#,
        header = XML_HEADER,
        timeout = timeout_secs,
        action = escape_xml(voicemail_action),
        callback = escape_xml(recording_callback),
        identity = escape_xml(client_identity),
    )
}

/// Voicemail prompt followed by a single-channel recording with transcription.
pub fn voicemail(
    greeting: &str,
    recording_callback: &str,
    transcription_callback: &str,
    max_length_secs: u32,
) -> String {
    format!(
        r#"{header}
<Response>
  <Say>{greeting}</Say>
  <Record maxLength="{max}" playBeep="true" recordingStatusCallback="{rec}" recordingStatusCallbackMethod="POST" transcribe="true" transcribeCallback="{tr}"/>
  <Hangup/>
</Response>"#,
        header = XML_HEADER,
        greeting = escape_xml(greeting),
        max = max_length_secs,
        rec = escape_xml(recording_callback),
        tr = escape_xml(transcription_callback),
    )
}

/// Reason attribute for `<Reject>`. Twilio accepts only these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Rejected,
    Busy,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Rejected => "rejected",
            RejectReason::Busy => "busy",
        }
    }
}

pub fn reject(reason: RejectReason) -> String {
    format!(
        r#"{header}
<Response>
  <Reject reason="{reason}"/>
</Response>"#,
        header = XML_HEADER,
        reason = reason.as_str(),
    )
}

/// End the call with nothing further, e.g. after a completed dial.
pub fn hangup() -> String {
    format!("{}\n<Response>\n  <Hangup/>\n</Response>", XML_HEADER)
}
