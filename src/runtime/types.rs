//! Wire types for the remote agent runtime's message API.

use serde::{Deserialize, Serialize};

/// Body of `POST /message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: String,
    pub message: String,
}

/// Who produced a message in the runtime's log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Produced by the runtime
    Sent,
    /// Echo of caller input
    Received,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeMessage {
    pub message: String,
    #[serde(default)]
    pub timestamp: String,
    pub direction: Direction,
}

impl RuntimeMessage {
    pub fn is_from_runtime(&self) -> bool {
        self.direction == Direction::Sent
    }
}

/// Body of `GET /messages/{conversationId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagesResponse {
    #[serde(default)]
    pub conversation_id: String,
    #[serde(default)]
    pub messages: Vec<RuntimeMessage>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_request_uses_camel_case() {
        let body = SendMessageRequest {
            conversation_id: "pm-project-1".into(),
            message: "/command-invoke prime".into(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["conversationId"], "pm-project-1");
        assert_eq!(json["message"], "/command-invoke prime");
    }

    #[test]
    fn messages_response_parses_directions() {
        let resp: MessagesResponse = serde_json::from_str(
            r#"{
                "conversationId": "pm-project-1",
                "messages": [
                    {"message": "/command-invoke prime", "timestamp": "2026-01-01T00:00:00Z", "direction": "received"},
                    {"message": "Context loaded", "timestamp": "2026-01-01T00:00:01Z", "direction": "sent"},
                    {"message": "?", "timestamp": "2026-01-01T00:00:02Z", "direction": "system"}
                ]
            }"#,
        )
        .unwrap();
        assert_eq!(resp.messages.len(), 3);
        assert!(!resp.messages[0].is_from_runtime());
        assert!(resp.messages[1].is_from_runtime());
        assert_eq!(resp.messages[2].direction, Direction::Unknown);
    }

    #[test]
    fn missing_message_list_is_empty() {
        let resp: MessagesResponse = serde_json::from_str(r#"{"conversationId": "x"}"#).unwrap();
        assert!(resp.messages.is_empty());
    }
}
