/// Conversation and message state
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery lifecycle of one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryStatus {
    /// Shown locally, not yet confirmed by the server
    Optimistic,
    Delivered,
    /// Accepted but the recipient had no live connection
    SentNotDelivered,
    Failed,
}

impl DeliveryStatus {
    /// Only `Optimistic` may move, and only to one of the terminal statuses
    pub fn can_advance_to(self, next: DeliveryStatus) -> bool {
        self == DeliveryStatus::Optimistic && next != DeliveryStatus::Optimistic
    }

    pub fn label(self) -> &'static str {
        match self {
            DeliveryStatus::Optimistic => "sending",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::SentNotDelivered => "sent, not delivered",
            DeliveryStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// `temp-{request_id}` while optimistic, the server id once known
    pub id: String,
    pub server_id: Option<String>,
    /// Originating request id for locally sent messages
    pub request_id: Option<String>,
    pub sender_id: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
    pub status: DeliveryStatus,
}

impl Message {
    pub fn optimistic(request_id: &str, sender_id: &str, body: &str, sent_at: DateTime<Utc>) -> Self {
        Self {
            id: format!("temp-{}", request_id),
            server_id: None,
            request_id: Some(request_id.to_string()),
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            sent_at,
            status: DeliveryStatus::Optimistic,
        }
    }

    pub fn confirmed(
        server_id: Option<String>,
        sender_id: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: server_id
                .clone()
                .unwrap_or_else(|| format!("msg-{}", Uuid::new_v4())),
            server_id,
            request_id: None,
            sender_id: sender_id.to_string(),
            body: body.to_string(),
            sent_at,
            status: DeliveryStatus::Delivered,
        }
    }

    pub fn is_optimistic(&self) -> bool {
        self.status == DeliveryStatus::Optimistic
    }

    /// Locally sent and not yet tied to a server message
    pub fn is_unconfirmed_local(&self) -> bool {
        self.request_id.is_some() && self.server_id.is_none()
    }

    /// Move the status forward. Returns false if the transition is not allowed.
    pub fn advance(&mut self, next: DeliveryStatus) -> bool {
        if !self.status.can_advance_to(next) {
            return false;
        }
        self.status = next;
        true
    }

    /// Attach the server identity; the local id is replaced
    pub fn attach_server_id(&mut self, server_id: &str) {
        self.server_id = Some(server_id.to_string());
        self.id = server_id.to_string();
    }
}

/// One conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Client-minted id not yet known to the server
    pub is_temp: bool,
    pub counterpart_id: String,
    pub listing_id: Option<String>,
    pub title: String,
    pub seller_id: Option<String>,
    pub buyer_id: Option<String>,
    pub messages: Vec<Message>,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_preview: Option<String>,
    /// Newest message from the counterpart this user has seen
    pub last_seen_at: Option<DateTime<Utc>>,
    /// Read position reported by the counterpart
    pub counterpart_seen_at: Option<DateTime<Utc>>,
}

impl Conversation {
    /// `temp-{self}-{counterpart}-{listing|general}`
    pub fn temp_id(self_id: &str, counterpart_id: &str, listing_id: Option<&str>) -> String {
        format!(
            "temp-{}-{}-{}",
            self_id,
            counterpart_id,
            listing_id.unwrap_or("general")
        )
    }

    pub fn new(id: String, counterpart_id: &str, listing_id: Option<&str>, title: &str) -> Self {
        Self {
            id,
            is_temp: false,
            counterpart_id: counterpart_id.to_string(),
            listing_id: listing_id.map(str::to_string),
            title: title.to_string(),
            seller_id: None,
            buyer_id: None,
            messages: Vec::new(),
            last_activity: None,
            last_preview: None,
            last_seen_at: None,
            counterpart_seen_at: None,
        }
    }

    /// Same counterpart and same listing (absent listing matches absent listing)
    pub fn matches_pair(&self, counterpart_id: &str, listing_id: Option<&str>) -> bool {
        self.counterpart_id == counterpart_id
            && self.listing_id.as_deref().unwrap_or("") == listing_id.unwrap_or("")
    }

    pub fn push(&mut self, message: Message) {
        self.touch(&message);
        self.messages.push(message);
    }

    pub(crate) fn touch(&mut self, message: &Message) {
        if self.last_activity.map_or(true, |t| t <= message.sent_at) {
            self.last_activity = Some(message.sent_at);
            self.last_preview = Some(message.body.clone());
        }
    }

    /// Local sends still waiting for any server answer
    pub fn unconfirmed(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(|m| m.is_unconfirmed_local() && m.is_optimistic())
    }
}

/// Thread as listed by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadSummary {
    pub id: String,
    #[serde(alias = "otherUserID", alias = "other_user_id")]
    pub other_user_id: String,
    #[serde(default)]
    pub other_user_name: Option<String>,
    #[serde(default, alias = "listingID", alias = "listing_id")]
    pub listing_id: Option<String>,
    #[serde(default)]
    pub listing_title: Option<String>,
    #[serde(default, alias = "sellerID", alias = "seller_id")]
    pub seller_id: Option<String>,
    #[serde(default, alias = "buyerID", alias = "buyer_id")]
    pub buyer_id: Option<String>,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_sent_at: Option<DateTime<Utc>>,
}

impl ThreadSummary {
    pub fn title(&self) -> &str {
        self.listing_title
            .as_deref()
            .or(self.other_user_name.as_deref())
            .unwrap_or("Chat")
    }
}

/// Message from the server's history endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryMessage {
    pub id: String,
    #[serde(alias = "senderId")]
    pub sender_id: String,
    pub body: String,
    #[serde(alias = "createdAt")]
    pub created_at: DateTime<Utc>,
}

/// Parse an RFC 3339 timestamp from the wire
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
