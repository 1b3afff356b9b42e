/// Wire protocol for the marketplace realtime channel
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const EVENT_AGENT_SEARCH: &str = "agent.search";
pub const EVENT_AGENT_RESPONSE: &str = "agent.response";
pub const EVENT_CHAT_MESSAGE: &str = "chat.message";
pub const EVENT_CHAT_RESPONSE: &str = "chat.response";
pub const EVENT_CHAT_DELIVER: &str = "chat.deliver";
pub const EVENT_CHAT_SEEN: &str = "chat.seen";
pub const EVENT_ERROR: &str = "error";

/// Error code the server uses when the chat recipient has no live connection
pub const CODE_RECIPIENT_OFFLINE: &str = "RECIPIENT_OFFLINE";

/// One JSON frame on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub event_type: String,

    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "empty_as_none"
    )]
    pub request_id: Option<String>,

    /// Object or JSON-encoded string; see [`Frame::decode_payload`]
    #[serde(default)]
    pub payload: Value,
}

fn empty_as_none<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(de)?;
    Ok(raw.filter(|s| !s.is_empty()))
}

impl Frame {
    pub fn new(event_type: &str, request_id: Option<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.to_string(),
            request_id,
            payload,
        }
    }

    /// Build a frame from a typed payload
    pub fn with_payload<T: Serialize>(
        event_type: &str,
        request_id: Option<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, request_id, serde_json::to_value(payload)?))
    }

    /// Serialize frame to JSON text
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse frame from JSON text
    pub fn from_text(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Decode the payload, accepting both an object and a stringified object
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match &self.payload {
            Value::String(inner) => serde_json::from_str(inner),
            other => T::deserialize(other),
        }
    }

    /// Error payload of an `error` frame. A bare non-JSON string becomes the message.
    pub fn error_payload(&self) -> Option<ErrorPayload> {
        if self.event_type != EVENT_ERROR {
            return None;
        }
        match self.decode_payload::<ErrorPayload>() {
            Ok(p) => Some(p),
            Err(_) => match &self.payload {
                Value::String(s) => Some(ErrorPayload {
                    message: s.clone(),
                    code: None,
                }),
                _ => Some(ErrorPayload {
                    message: "An error occurred".to_string(),
                    code: None,
                }),
            },
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request_id {
            Some(id) => write!(f, "Frame({}, {})", self.event_type, id),
            None => write!(f, "Frame({})", self.event_type),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSearchPayload {
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryImage {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingInfo {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub seller_id: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_image: Option<PrimaryImage>,
}

/// Reply to `agent.search` and `chat.response`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponsePayload {
    #[serde(default)]
    pub answer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub results: Vec<ListingInfo>,
}

impl AgentResponsePayload {
    /// Answer text, falling back to `message` when the answer is empty
    pub fn answer_text(&self) -> &str {
        if !self.answer.is_empty() {
            return &self.answer;
        }
        match self.message.as_deref() {
            Some(m) if !m.is_empty() => m,
            _ => "No response from AI",
        }
    }
}

/// Outbound person-to-person chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessagePayload {
    pub to_user_id: String,
    pub text: String,
}

/// Free-form question to the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantChatPayload {
    pub text: String,
}

/// Server delivery of a chat message (to the recipient, or echoed to the sender)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatDeliverPayload {
    #[serde(default)]
    pub conversation_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    pub from_user_id: String,
    pub text: String,
    #[serde(default)]
    pub sent_at: Option<String>,
    #[serde(default)]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub listing_title: Option<String>,
    #[serde(default)]
    pub other_user_id: Option<String>,
}

/// Read receipt, both directions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSeenPayload {
    pub conversation_id: String,
    pub seen_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorPayload {
    /// Recipient unreachable: the message was accepted but not delivered live
    pub fn is_recipient_offline(&self) -> bool {
        if self.code.as_deref() == Some(CODE_RECIPIENT_OFFLINE) {
            return true;
        }
        self.message.to_lowercase().contains("not connected")
    }

    pub fn code_or_default(&self) -> String {
        self.code.clone().unwrap_or_else(|| "UNKNOWN".to_string())
    }
}

/// Close codes the client distinguishes
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_POLICY: u16 = 1008;

/// How a close code should be handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseClass {
    /// Explicit close, no reconnect
    Normal,
    /// Authentication / policy rejection, fatal
    Rejected,
    /// Anything else, retried up to the bound
    Abnormal,
}

impl CloseClass {
    pub fn from_code(code: u16) -> Self {
        match code {
            CLOSE_NORMAL => CloseClass::Normal,
            CLOSE_POLICY => CloseClass::Rejected,
            _ => CloseClass::Abnormal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_omits_missing_request_id() {
        let frame = Frame::new(EVENT_CHAT_SEEN, None, json!({"conversation_id": "c1"}));
        let text = frame.to_text().unwrap();
        assert!(!text.contains("requestId"));
        assert!(text.contains("\"type\":\"chat.seen\""));
    }

    #[test]
    fn test_frame_parses_empty_request_id_as_none() {
        let frame = Frame::from_text(r#"{"type":"chat.deliver","requestId":"","payload":{}}"#).unwrap();
        assert_eq!(frame.request_id, None);
    }

    #[test]
    fn test_decode_stringified_payload() {
        let frame = Frame::from_text(
            r#"{"type":"agent.response","requestId":"r1","payload":"{\"answer\":\"hi\",\"results\":[]}"}"#,
        )
        .unwrap();
        let payload: AgentResponsePayload = frame.decode_payload().unwrap();
        assert_eq!(payload.answer, "hi");
        assert!(payload.results.is_empty());
    }

    #[test]
    fn test_agent_response_falls_back_to_message() {
        let frame = Frame::new(EVENT_AGENT_RESPONSE, Some("r1".into()), json!({"message": "no luck"}));
        let payload: AgentResponsePayload = frame.decode_payload().unwrap();
        assert_eq!(payload.answer_text(), "no luck");

        let empty = Frame::new(EVENT_AGENT_RESPONSE, Some("r2".into()), json!({}));
        let payload: AgentResponsePayload = empty.decode_payload().unwrap();
        assert_eq!(payload.answer_text(), "No response from AI");
    }

    #[test]
    fn test_listing_info_tolerates_partial_records() {
        let listing: ListingInfo = serde_json::from_value(json!({
            "id": "l1",
            "title": "Desk lamp",
            "price": 12.5,
            "primaryImage": {"key": "k", "url": "https://img"}
        }))
        .unwrap();
        assert_eq!(listing.price, Some(12.5));
        assert_eq!(listing.seller_id, None);
        assert_eq!(listing.primary_image.unwrap().url, "https://img");
    }

    #[test]
    fn test_error_payload_plain_string() {
        let frame = Frame::new(EVENT_ERROR, Some("r1".into()), json!("boom"));
        let err = frame.error_payload().unwrap();
        assert_eq!(err.message, "boom");
        assert_eq!(err.code, None);
    }

    #[test]
    fn test_recipient_offline_detection() {
        let by_code = ErrorPayload {
            message: "whatever".into(),
            code: Some(CODE_RECIPIENT_OFFLINE.into()),
        };
        let by_text = ErrorPayload {
            message: "user not connected: u2".into(),
            code: None,
        };
        let other = ErrorPayload {
            message: "invalid payload".into(),
            code: Some("INVALID_PAYLOAD".into()),
        };
        assert!(by_code.is_recipient_offline());
        assert!(by_text.is_recipient_offline());
        assert!(!other.is_recipient_offline());
    }

    #[test]
    fn test_close_classes() {
        assert_eq!(CloseClass::from_code(1000), CloseClass::Normal);
        assert_eq!(CloseClass::from_code(1008), CloseClass::Rejected);
        assert_eq!(CloseClass::from_code(1006), CloseClass::Abnormal);
        assert_eq!(CloseClass::from_code(1011), CloseClass::Abnormal);
    }
}
