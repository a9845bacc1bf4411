use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::Error as DeError;
use serde::ser::Error as SerError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

// ─── Terminal + tool statuses ─────────────────────────────────────────────

/// Terminal status carried by a `done` event. Exactly one `done` ends every
/// session stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Success,
    Error,
    Interrupted,
    MaxTurns,
    MaxBudget,
}

impl SessionStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Success => "success",
            SessionStatus::Error => "error",
            SessionStatus::Interrupted => "interrupted",
            SessionStatus::MaxTurns => "max_turns",
            SessionStatus::MaxBudget => "max_budget",
        }
    }
}

/// Outcome of a single tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success,
    Error,
    Denied,
}

impl ToolOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            ToolOutcome::Success => "success",
            ToolOutcome::Error => "error",
            ToolOutcome::Denied => "denied",
        }
    }
}

/// Token/tool accounting reported on `done`. `Default` is the zeroed usage
/// attached to synthesized terminals.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageTotals {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub tool_uses: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

// ─── Payloads ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextDeltaPayload {
    pub delta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingPayload {
    pub summary: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUsePayload {
    pub tool_name: String,
    /// Unique within the session; correlates a later `tool_result`.
    pub tool_use_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultPayload {
    pub tool_use_id: String,
    pub tool_name: String,
    pub status: ToolOutcome,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequestPayload {
    pub tool_name: String,
    pub tool_use_id: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    pub recoverable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DonePayload {
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(default)]
    pub usage: UsageTotals,
    pub duration_ms: u64,
}

/// Payload of an [`AgentEvent`], discriminated by the wire `type` field.
///
/// The nine canonical variants are closed: drivers only ever synthesize
/// `init`, `error`, and `done`. Backend-specific data travels as
/// [`EventPayload::Extension`] under a `<backend-id>:<name>` type and is
/// never terminal.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Init(InitPayload),
    Text(TextPayload),
    TextDelta(TextDeltaPayload),
    Thinking(ThinkingPayload),
    ToolUse(ToolUsePayload),
    ToolResult(ToolResultPayload),
    PermissionRequest(PermissionRequestPayload),
    Error(ErrorPayload),
    Done(DonePayload),
    Extension { kind: String, payload: Value },
}

impl EventPayload {
    /// The wire `type` tag for this payload.
    pub fn type_name(&self) -> &str {
        match self {
            EventPayload::Init(_) => "init",
            EventPayload::Text(_) => "text",
            EventPayload::TextDelta(_) => "text_delta",
            EventPayload::Thinking(_) => "thinking",
            EventPayload::ToolUse(_) => "tool_use",
            EventPayload::ToolResult(_) => "tool_result",
            EventPayload::PermissionRequest(_) => "permission_request",
            EventPayload::Error(_) => "error",
            EventPayload::Done(_) => "done",
            EventPayload::Extension { kind, .. } => kind,
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, EventPayload::Done(_))
    }
}

// ─── Envelope ─────────────────────────────────────────────────────────────

/// One event in a session stream.
///
/// `timestamp_ms` is wall-clock epoch millis; per session, timestamps are
/// nondecreasing. `session_id` is stable across every event of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentEvent {
    pub agent: String,
    pub timestamp_ms: u64,
    pub session_id: String,
    pub metadata: Option<Map<String, Value>>,
    pub payload: EventPayload,
}

impl AgentEvent {
    /// Constructs an event stamped with the current wall-clock time.
    pub fn new(
        agent: impl Into<String>,
        session_id: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            agent: agent.into(),
            timestamp_ms: now_ms(),
            session_id: session_id.into(),
            metadata: None,
            payload,
        }
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn kind(&self) -> &str {
        self.payload.type_name()
    }

    pub const fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }

    pub fn as_done(&self) -> Option<&DonePayload> {
        if let EventPayload::Done(done) = &self.payload {
            Some(done)
        } else {
            None
        }
    }

    pub fn as_error(&self) -> Option<&ErrorPayload> {
        if let EventPayload::Error(err) = &self.payload {
            Some(err)
        } else {
            None
        }
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Supplies a globally unique opaque session id.
pub fn new_session_id() -> String {
    format!("sess-{}", uuid::Uuid::new_v4())
}

/// Runtime shape check: does `value` look like a serialized [`AgentEvent`]?
///
/// Requires `type: string`, `agent: string`, `timestamp: number`,
/// `sessionId: string`, and a present `payload`.
pub fn is_event_value(value: &Value) -> bool {
    let Some(obj) = value.as_object() else {
        return false;
    };
    obj.get("type").map_or(false, Value::is_string)
        && obj.get("agent").map_or(false, Value::is_string)
        && obj.get("timestamp").map_or(false, Value::is_number)
        && obj.get("sessionId").map_or(false, Value::is_string)
        && obj.contains_key("payload")
}

// ─── Wire serde ───────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    agent: String,
    timestamp: u64,
    #[serde(rename = "sessionId")]
    session_id: String,
    payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metadata: Option<Map<String, Value>>,
}

impl Serialize for AgentEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let payload = match &self.payload {
            EventPayload::Init(p) => serde_json::to_value(p),
            EventPayload::Text(p) => serde_json::to_value(p),
            EventPayload::TextDelta(p) => serde_json::to_value(p),
            EventPayload::Thinking(p) => serde_json::to_value(p),
            EventPayload::ToolUse(p) => serde_json::to_value(p),
            EventPayload::ToolResult(p) => serde_json::to_value(p),
            EventPayload::PermissionRequest(p) => serde_json::to_value(p),
            EventPayload::Error(p) => serde_json::to_value(p),
            EventPayload::Done(p) => serde_json::to_value(p),
            EventPayload::Extension { payload, .. } => Ok(payload.clone()),
        }
        .map_err(S::Error::custom)?;

        Envelope {
            kind: self.payload.type_name().to_string(),
            agent: self.agent.clone(),
            timestamp: self.timestamp_ms,
            session_id: self.session_id.clone(),
            payload,
            metadata: self.metadata.clone(),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AgentEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let envelope = Envelope::deserialize(deserializer)?;
        let payload = parse_payload(&envelope.kind, envelope.payload).map_err(D::Error::custom)?;
        Ok(AgentEvent {
            agent: envelope.agent,
            timestamp_ms: envelope.timestamp,
            session_id: envelope.session_id,
            metadata: envelope.metadata,
            payload,
        })
    }
}

fn parse_payload(kind: &str, payload: Value) -> Result<EventPayload, String> {
    fn typed<T: serde::de::DeserializeOwned>(
        kind: &str,
        payload: Value,
        wrap: impl FnOnce(T) -> EventPayload,
    ) -> Result<EventPayload, String> {
        serde_json::from_value(payload)
            .map(wrap)
            .map_err(|err| format!("invalid `{kind}` payload: {err}"))
    }

    match kind {
        "init" => typed(kind, payload, EventPayload::Init),
        "text" => typed(kind, payload, EventPayload::Text),
        "text_delta" => typed(kind, payload, EventPayload::TextDelta),
        "thinking" => typed(kind, payload, EventPayload::Thinking),
        "tool_use" => typed(kind, payload, EventPayload::ToolUse),
        "tool_result" => typed(kind, payload, EventPayload::ToolResult),
        "permission_request" => typed(kind, payload, EventPayload::PermissionRequest),
        "error" => typed(kind, payload, EventPayload::Error),
        "done" => typed(kind, payload, EventPayload::Done),
        namespaced if namespaced.contains(':') => Ok(EventPayload::Extension {
            kind: namespaced.to_string(),
            payload,
        }),
        other => Err(format!("unknown event type `{other}`")),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_round_trips_done() {
        let event = AgentEvent::new(
            "claude",
            "sess-1",
            EventPayload::Done(DonePayload {
                status: SessionStatus::MaxTurns,
                final_text: Some("partial answer".into()),
                usage: UsageTotals {
                    input_tokens: 10,
                    output_tokens: 4,
                    tool_uses: 2,
                    total_cost_usd: Some(0.01),
                },
                duration_ms: 1234,
            }),
        );

        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "done");
        assert_eq!(wire["agent"], "claude");
        assert_eq!(wire["sessionId"], "sess-1");
        assert_eq!(wire["payload"]["status"], "max_turns");
        assert_eq!(wire["payload"]["usage"]["toolUses"], 2);

        let back: AgentEvent = serde_json::from_value(wire).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn extension_type_carries_arbitrary_payload() {
        let event = AgentEvent::new(
            "codex",
            "sess-2",
            EventPayload::Extension {
                kind: "codex:file_change".into(),
                payload: json!({"path": "src/main.rs", "kind": "update"}),
            },
        );
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["type"], "codex:file_change");
        assert_eq!(wire["payload"]["path"], "src/main.rs");

        let back: AgentEvent = serde_json::from_value(wire).unwrap();
        assert!(!back.is_terminal());
        assert_eq!(back.kind(), "codex:file_change");
    }

    #[test]
    fn unknown_plain_type_is_rejected() {
        let wire = json!({
            "type": "weird",
            "agent": "claude",
            "timestamp": 1,
            "sessionId": "s",
            "payload": {}
        });
        assert!(serde_json::from_value::<AgentEvent>(wire).is_err());
    }

    #[test]
    fn shape_check_requires_all_fields() {
        let ok = json!({
            "type": "text",
            "agent": "gemini",
            "timestamp": 42,
            "sessionId": "s",
            "payload": {"text": "hi"}
        });
        assert!(is_event_value(&ok));

        let missing_session = json!({
            "type": "text",
            "agent": "gemini",
            "timestamp": 42,
            "payload": {"text": "hi"}
        });
        assert!(!is_event_value(&missing_session));

        let wrong_timestamp = json!({
            "type": "text",
            "agent": "gemini",
            "timestamp": "42",
            "sessionId": "s",
            "payload": {}
        });
        assert!(!is_event_value(&wrong_timestamp));
        assert!(!is_event_value(&json!("not an object")));
    }

    #[test]
    fn session_ids_are_unique() {
        let a = new_session_id();
        let b = new_session_id();
        assert_ne!(a, b);
        assert!(a.starts_with("sess-"));
    }

    #[test]
    fn zeroed_usage_is_default() {
        let usage = UsageTotals::default();
        assert_eq!(usage.input_tokens, 0);
        assert_eq!(usage.output_tokens, 0);
        assert_eq!(usage.tool_uses, 0);
        assert!(usage.total_cost_usd.is_none());
    }
}
