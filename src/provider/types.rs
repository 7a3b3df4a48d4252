use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outbound chat-completion request. `response_mode` is set by the client
/// depending on blocking vs streaming.
#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub query: String,
    /// End-user identifier forwarded to the provider.
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub inputs: Value,
    pub auto_generate_name: bool,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            conversation_id: None,
            inputs: Value::Null,
            auto_generate_name: false,
        }
    }

    pub fn with_conversation(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id.filter(|s| !s.is_empty());
        self
    }

    pub fn with_inputs(mut self, inputs: Value) -> Self {
        self.inputs = inputs;
        self
    }
}

/// Blocking chat-completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageResponse {
    pub conversation_id: String,
    pub message_id: String,
    pub answer: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub created_at: Option<i64>,
}

/// One typed server-sent event from the streaming chat endpoint. Events
/// the gateway does not act on decode as `Other` and are forwarded as-is.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StreamEvent {
    Message {
        #[serde(default)]
        answer: String,
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
    },
    MessageEnd {
        #[serde(default)]
        conversation_id: Option<String>,
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        metadata: Value,
    },
    Error {
        #[serde(default)]
        status: Option<u16>,
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: String,
    },
    Ping,
    #[serde(other)]
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stream_events_decode_by_tag() {
        let msg: StreamEvent =
            serde_json::from_value(json!({ "event": "message", "answer": "Hel" })).unwrap();
        assert!(matches!(msg, StreamEvent::Message { ref answer, .. } if answer == "Hel"));

        let end: StreamEvent = serde_json::from_value(json!({
            "event": "message_end", "conversation_id": "c1", "message_id": "m1"
        }))
        .unwrap();
        assert!(matches!(end, StreamEvent::MessageEnd { .. }));

        let ping: StreamEvent = serde_json::from_value(json!({ "event": "ping" })).unwrap();
        assert!(matches!(ping, StreamEvent::Ping));

        let unknown: StreamEvent =
            serde_json::from_value(json!({ "event": "agent_thought", "thought": "…" })).unwrap();
        assert!(matches!(unknown, StreamEvent::Other));
    }

    #[test]
    fn empty_conversation_id_is_dropped() {
        let req = ChatRequest::new("hi", "u1").with_conversation(Some(String::new()));
        assert!(req.conversation_id.is_none());
    }
}
