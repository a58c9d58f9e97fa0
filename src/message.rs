use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topic used for heartbeat frames.
pub const HEARTBEAT_TOPIC: &str = "phoenix";
/// Event name for heartbeat frames.
pub const HEARTBEAT_EVENT: &str = "heartbeat";

/// Reserved event names that carry join-ref stale-message filtering semantics.
pub const PHX_CLOSE: &str = "phx_close";
pub const PHX_ERROR: &str = "phx_error";
pub const PHX_JOIN: &str = "phx_join";
pub const PHX_REPLY: &str = "phx_reply";
pub const PHX_LEAVE: &str = "phx_leave";

/// `true` if `event` is one of the reserved internal events that are subject
/// to join-ref staleness filtering (see `Message::is_reserved_event`).
#[must_use]
pub fn is_reserved_event(event: &str) -> bool {
    matches!(event, PHX_CLOSE | PHX_ERROR | PHX_JOIN | PHX_REPLY | PHX_LEAVE)
}

/// The wire frame: `[joinRef, ref, topic, event, payload]`.
///
/// Immutable after construction; built via `Message::new` or one of the two
/// canonical factories, `heartbeat` and `timeout_for`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub join_ref: Option<String>,
    #[serde(rename = "ref")]
    pub message_ref: Option<String>,
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

impl Message {
    #[must_use]
    pub fn new(
        join_ref: Option<String>,
        message_ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            join_ref,
            message_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
        }
    }

    /// `Message.heartbeat(ref)` — topic `"phoenix"`, event `"heartbeat"`, payload `{}`.
    #[must_use]
    pub fn heartbeat(message_ref: String) -> Self {
        Self {
            join_ref: None,
            message_ref: Some(message_ref),
            topic: HEARTBEAT_TOPIC.to_string(),
            event: HEARTBEAT_EVENT.to_string(),
            payload: serde_json::json!({}),
        }
    }

    /// A locally synthesized timeout message, never sent over the wire.
    /// Delivered to the owning channel so its waiting `Push` can observe it
    /// as a `chan_reply_<ref>` style status transition.
    #[must_use]
    pub fn timeout_for(message_ref: &str) -> Self {
        Self {
            join_ref: None,
            message_ref: Some(message_ref.to_string()),
            topic: String::new(),
            event: reply_event_for_ref(message_ref),
            payload: serde_json::json!({"status": "timeout", "response": Value::Null}),
        }
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.topic == HEARTBEAT_TOPIC && self.event == HEARTBEAT_EVENT
    }

    #[must_use]
    pub fn is_reserved(&self) -> bool {
        is_reserved_event(&self.event)
    }
}

/// `chan_reply_<ref>` — the synthesized local event name a `Push` listens for.
#[must_use]
pub fn reply_event_for_ref(message_ref: &str) -> String {
    format!("chan_reply_{message_ref}")
}

/// `{status, response}` parsed out of an inbound `phx_reply` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushResponse {
    pub status: String,
    pub response: Value,
}

impl PushResponse {
    #[must_use]
    pub fn ok(response: Value) -> Self {
        Self {
            status: "ok".to_string(),
            response,
        }
    }

    #[must_use]
    pub fn error(response: Value) -> Self {
        Self {
            status: "error".to_string(),
            response,
        }
    }

    #[must_use]
    pub fn timeout() -> Self {
        Self {
            status: "timeout".to_string(),
            response: Value::Null,
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }

    #[must_use]
    pub fn is_timeout(&self) -> bool {
        self.status == "timeout"
    }

    /// Parse `{status, response}` out of a `phx_reply` payload. Missing or
    /// malformed fields default to `"error"`/`null`, matching the server's
    /// own leniency for unusual reply shapes.
    #[must_use]
    pub fn from_reply_payload(payload: &Value) -> Self {
        let status = payload
            .get("status")
            .and_then(Value::as_str)
            .unwrap_or("error")
            .to_string();
        let response = payload.get("response").cloned().unwrap_or(Value::Null);
        Self { status, response }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn heartbeat_has_fixed_topic_and_event() {
        let msg = Message::heartbeat("5".to_string());
        assert_eq!(msg.topic, "phoenix");
        assert_eq!(msg.event, "heartbeat");
        assert_eq!(msg.message_ref.as_deref(), Some("5"));
        assert!(msg.is_heartbeat());
    }

    #[test]
    fn timeout_for_produces_reply_event_name() {
        let msg = Message::timeout_for("7");
        assert_eq!(msg.event, "chan_reply_7");
        assert_eq!(msg.payload["status"], "timeout");
    }

    #[test]
    fn reserved_events_are_classified() {
        for event in [PHX_CLOSE, PHX_ERROR, PHX_JOIN, PHX_REPLY, PHX_LEAVE] {
            assert!(is_reserved_event(event), "{event} should be reserved");
        }
        assert!(!is_reserved_event("hello!"));
        assert!(!is_reserved_event("presence_state"));
    }

    #[test]
    fn message_round_trips_through_serde() {
        let msg = Message::new(
            Some("1".into()),
            Some("2".into()),
            "room:lobby",
            "hello!",
            json!({"foo": "bar"}),
        );
        let encoded = serde_json::to_value(&msg).unwrap();
        let decoded: Message = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn push_response_from_reply_payload_defaults_missing_fields() {
        let resp = PushResponse::from_reply_payload(&json!({}));
        assert_eq!(resp.status, "error");
        assert_eq!(resp.response, Value::Null);
    }

    #[test]
    fn push_response_from_reply_payload_reads_ok_status() {
        let resp = PushResponse::from_reply_payload(&json!({"status": "ok", "response": {"name": "bar"}}));
        assert!(resp.is_ok());
        assert_eq!(resp.response["name"], "bar");
    }
}
