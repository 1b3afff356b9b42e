/// Chat session for one authenticated user
///
/// Installs the frame handlers that tie the correlator to the conversation
/// state and exposes the operations a front end calls.
use crate::chat::{Conversation, ConversationReconciler, HistoryMessage, ThreadSummary};
use crate::config::{Config, Credential};
use crate::error::{RealtimeError, Result};
use crate::realtime::connection::{ConnectionManager, ConnectionStatus};
use crate::realtime::correlator::{PendingReply, RequestCorrelator, RequestKind};
use crate::realtime::dispatcher::SubscriptionId;
use crate::realtime::protocol::{
    AgentResponsePayload, AgentSearchPayload, AssistantChatPayload, ChatDeliverPayload,
    ChatMessagePayload, ChatSeenPayload, Frame, EVENT_AGENT_RESPONSE, EVENT_CHAT_DELIVER,
    EVENT_CHAT_RESPONSE, EVENT_CHAT_SEEN, EVENT_ERROR,
};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Identifiers of a chat message that has been handed to the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSendReceipt {
    pub thread_id: String,
    pub request_id: String,
    pub message_id: String,
}

#[derive(Clone)]
pub struct ChatSession {
    user_id: String,
    connection: ConnectionManager,
    correlator: RequestCorrelator,
    conversations: Arc<Mutex<ConversationReconciler>>,
}

impl ChatSession {
    /// Build the session and open the connection
    pub fn start(config: Config, user_id: impl Into<String>, credential: Option<Credential>) -> Result<Self> {
        let session = Self::new(config, user_id, credential)?;
        session.connection.connect()?;
        Ok(session)
    }

    /// Build the session without connecting
    pub fn new(config: Config, user_id: impl Into<String>, credential: Option<Credential>) -> Result<Self> {
        let user_id = user_id.into();
        if user_id.trim().is_empty() {
            return Err(RealtimeError::InvalidInput("user id is required".into()));
        }

        let session = Self {
            correlator: RequestCorrelator::new(config.request_timeout),
            connection: ConnectionManager::new(config, credential),
            conversations: Arc::new(Mutex::new(ConversationReconciler::new(user_id.clone()))),
            user_id,
        };
        session.install_handlers();
        Ok(session)
    }

    fn install_handlers(&self) {
        for event_type in [EVENT_AGENT_RESPONSE, EVENT_CHAT_RESPONSE] {
            let correlator = self.correlator.clone();
            self.connection.subscribe(event_type, move |frame| {
                match frame.request_id.as_deref() {
                    Some(id) => {
                        correlator.resolve(id, frame.clone());
                    }
                    None => debug!("Uncorrelated {}", frame),
                }
                Ok(())
            });
        }

        let correlator = self.correlator.clone();
        let conversations = self.conversations.clone();
        self.connection.subscribe(EVENT_CHAT_DELIVER, move |frame| {
            let payload: ChatDeliverPayload = frame.decode_payload()?;
            let outcome = conversations
                .lock()
                .apply_delivery(&payload, frame.request_id.as_deref());
            if let Some(request_id) = outcome.confirmed_request.or_else(|| frame.request_id.clone()) {
                correlator.resolve(&request_id, frame.clone());
            }
            Ok(())
        });

        let conversations = self.conversations.clone();
        self.connection.subscribe(EVENT_CHAT_SEEN, move |frame| {
            let receipt: ChatSeenPayload = frame.decode_payload()?;
            conversations.lock().apply_seen_receipt(&receipt);
            Ok(())
        });

        let correlator = self.correlator.clone();
        let conversations = self.conversations.clone();
        self.connection.subscribe(EVENT_ERROR, move |frame| {
            let Some(error) = frame.error_payload() else {
                return Ok(());
            };
            let Some(request_id) = frame.request_id.as_deref() else {
                warn!("Server error [{}]: {}", error.code_or_default(), error.message);
                return Ok(());
            };

            if error.is_recipient_offline() {
                conversations.lock().mark_sent_not_delivered(request_id);
            }
            let rejected = correlator.reject(
                request_id,
                RealtimeError::Server {
                    code: error.code_or_default(),
                    message: error.message.clone(),
                },
            );
            if !rejected {
                debug!("Error for settled request {}: {}", request_id, error.message);
            }
            Ok(())
        });
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.connection.watch_status()
    }

    /// Reconnect, restoring the session handlers if a disconnect dropped them
    pub fn reconnect(&self) -> Result<()> {
        if self.connection.dispatcher().subscriber_count(EVENT_CHAT_DELIVER) == 0 {
            debug!("Reinstalling session handlers for {}", self.user_id);
            self.install_handlers();
        }
        self.connection.reconnect()
    }

    /// Additional consumer for an inbound event type. Runs after the
    /// session's own handler, so conversation state is already updated.
    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Frame) -> Result<()> + Send + Sync + 'static,
    {
        self.connection.subscribe(event_type, callback)
    }

    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        self.connection.unsubscribe(event_type, id)
    }

    /// Issue a request and transmit it; a failed send cancels the request
    fn request(&self, kind: RequestKind, payload: Value) -> Result<PendingReply> {
        let (frame, reply) = self.correlator.issue(kind, payload);
        if let Err(e) = self.connection.send(&frame) {
            self.correlator.cancel(reply.request_id());
            return Err(e);
        }
        Ok(reply)
    }

    /// AI listing search
    pub fn search(&self, query: &str) -> Result<PendingReply> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RealtimeError::InvalidInput("search query is empty".into()));
        }
        let payload = serde_json::to_value(AgentSearchPayload {
            query: query.to_string(),
        })?;
        self.request(RequestKind::AgentSearch, payload)
    }

    /// Free-form question to the assistant
    pub fn ask(&self, text: &str) -> Result<PendingReply> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RealtimeError::InvalidInput("question is empty".into()));
        }
        let payload = serde_json::to_value(AssistantChatPayload {
            text: text.to_string(),
        })?;
        self.request(RequestKind::AssistantChat, payload)
    }

    /// Wait for a search or assistant reply and decode it
    pub async fn answer(reply: PendingReply) -> Result<AgentResponsePayload> {
        let frame = reply.wait().await?;
        Ok(frame.decode_payload()?)
    }

    pub fn open_thread(
        &self,
        counterpart_id: &str,
        listing_id: Option<&str>,
        title: Option<&str>,
        seller_id: Option<&str>,
    ) -> Result<String> {
        self.conversations
            .lock()
            .open_thread(counterpart_id, listing_id, title, seller_id)
    }

    pub fn select_thread(&self, thread_id: &str) -> Result<()> {
        self.conversations.lock().select_thread(thread_id)
    }

    pub fn active_thread_id(&self) -> Option<String> {
        self.conversations.lock().active_thread_id().map(str::to_string)
    }

    pub fn threads(&self) -> Vec<Conversation> {
        self.conversations.lock().threads().to_vec()
    }

    pub fn thread(&self, thread_id: &str) -> Option<Conversation> {
        self.conversations.lock().thread(thread_id).cloned()
    }

    /// Seed the thread list from the server's listing
    pub fn merge_server_threads(&self, summaries: Vec<ThreadSummary>) {
        self.conversations.lock().merge_server_threads(summaries);
    }

    pub fn load_history(&self, thread_id: &str, history: Vec<HistoryMessage>) -> Result<usize> {
        self.conversations.lock().load_history(thread_id, history)
    }

    /// Send a chat message: shown optimistically at once, confirmed by the
    /// server's echo. A send that cannot be transmitted marks the message
    /// failed and returns the error.
    pub fn send_chat(&self, thread_id: &str, text: &str) -> Result<ChatSendReceipt> {
        let text = text.trim();
        if text.is_empty() {
            return Err(RealtimeError::InvalidInput("message text is empty".into()));
        }
        let recipient = self.conversations.lock().recipient_for(thread_id)?;
        let payload = serde_json::to_value(ChatMessagePayload {
            to_user_id: recipient,
            text: text.to_string(),
        })?;

        let (frame, reply) = self.correlator.issue(RequestKind::ChatMessage, payload);
        let request_id = reply.request_id().to_string();

        let appended = self
            .conversations
            .lock()
            .append_optimistic(thread_id, &request_id, text, Utc::now());
        let message_id = match appended {
            Ok(id) => id,
            Err(e) => {
                self.correlator.cancel(&request_id);
                return Err(e);
            }
        };

        if let Err(e) = self.connection.send(&frame) {
            warn!("Chat send {} failed: {}", request_id, e);
            self.conversations.lock().mark_failed(&request_id);
            self.correlator.cancel(&request_id);
            return Err(e);
        }

        self.track_chat(reply);
        Ok(ChatSendReceipt {
            thread_id: thread_id.to_string(),
            request_id,
            message_id,
        })
    }

    /// Timeouts and server errors on a chat send mark the message failed
    fn track_chat(&self, reply: PendingReply) {
        let conversations = self.conversations.clone();
        tokio::spawn(async move {
            let request_id = reply.request_id().to_string();
            match reply.wait().await {
                Ok(_) => debug!("Chat send {} confirmed", request_id),
                Err(RealtimeError::Cancelled(_)) => debug!("Chat send {} cancelled", request_id),
                Err(e) => {
                    if conversations.lock().mark_failed(&request_id) {
                        warn!("Chat send {} failed: {}", request_id, e);
                    }
                }
            }
        });
    }

    /// Send a read receipt if the thread has unseen messages.
    /// Returns whether a receipt went out.
    pub fn mark_seen(&self, thread_id: &str) -> Result<bool> {
        let Some(receipt) = self.conversations.lock().mark_seen(thread_id) else {
            return Ok(false);
        };
        let request_id = format!("seen-{}-{}", thread_id, Utc::now().timestamp_millis());
        let frame = Frame::with_payload(EVENT_CHAT_SEEN, Some(request_id), &receipt)?;
        self.connection.send(&frame)?;
        Ok(true)
    }

    /// Close the connection and abandon everything outstanding
    pub fn logout(self) {
        self.connection.disconnect();
        let cancelled = self.correlator.cancel_all();
        info!("Logged out {} ({} requests cancelled)", self.user_id, cancelled);
    }
}
