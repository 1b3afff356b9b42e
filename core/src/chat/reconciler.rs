/// Conversation reconciliation
///
/// Merges optimistic local sends with server delivery events, promotes
/// temporary thread ids to durable ones and keeps a single copy of every
/// message no matter which path (echo, history, thread list) reports it first.
use crate::chat::types::{
    parse_timestamp, Conversation, DeliveryStatus, HistoryMessage, Message, ThreadSummary,
};
use crate::error::{RealtimeError, Result};
use crate::realtime::protocol::{ChatDeliverPayload, ChatSeenPayload};
use chrono::{DateTime, SecondsFormat, Utc};
use tracing::{debug, info, warn};

/// How an inbound delivery was merged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMatch {
    /// Same server message id already present
    ServerId,
    /// Echo of a local send, matched on its request id
    RequestId,
    /// Echo of a local send, matched on sender and body
    Content,
    /// Already present (same sender, body and timestamp)
    Duplicate,
    /// Appended to an existing thread
    Appended,
    /// Started a new thread
    NewThread,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryOutcome {
    pub thread_id: String,
    pub matched: DeliveryMatch,
    /// Temporary id that was promoted by this event
    pub promoted_from: Option<String>,
    /// Request id of the local send this event confirmed
    pub confirmed_request: Option<String>,
}

/// Owns the conversation threads of one user
#[derive(Debug, Clone)]
pub struct ConversationReconciler {
    self_id: String,
    threads: Vec<Conversation>,
    active: Option<String>,
}

impl ConversationReconciler {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            threads: Vec::new(),
            active: None,
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn threads(&self) -> &[Conversation] {
        &self.threads
    }

    pub fn thread(&self, id: &str) -> Option<&Conversation> {
        self.threads.iter().find(|t| t.id == id)
    }

    pub fn active_thread_id(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn active_thread(&self) -> Option<&Conversation> {
        self.active.as_deref().and_then(|id| self.thread(id))
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.threads.iter().position(|t| t.id == id)
    }

    /// Open (and activate) the thread with `counterpart` about `listing_id`,
    /// creating a temporary one if none exists yet.
    pub fn open_thread(
        &mut self,
        counterpart_id: &str,
        listing_id: Option<&str>,
        title: Option<&str>,
        seller_id: Option<&str>,
    ) -> Result<String> {
        let counterpart_id = counterpart_id.trim();
        if counterpart_id.is_empty() {
            return Err(RealtimeError::InvalidInput("counterpart id is required".into()));
        }
        if counterpart_id == self.self_id {
            return Err(RealtimeError::InvalidInput("cannot open a thread with yourself".into()));
        }
        let listing_id = listing_id.filter(|l| !l.is_empty());

        if let Some(existing) = self
            .threads
            .iter()
            .find(|t| t.matches_pair(counterpart_id, listing_id))
        {
            let id = existing.id.clone();
            debug!("Reusing thread {} for {}", id, counterpart_id);
            self.active = Some(id.clone());
            return Ok(id);
        }

        let id = Conversation::temp_id(&self.self_id, counterpart_id, listing_id);
        let mut thread = Conversation::new(
            id.clone(),
            counterpart_id,
            listing_id,
            title.unwrap_or("Chat"),
        );
        thread.is_temp = true;
        let seller = seller_id.unwrap_or(counterpart_id).to_string();
        thread.buyer_id = Some(if seller == self.self_id {
            counterpart_id.to_string()
        } else {
            self.self_id.clone()
        });
        thread.seller_id = Some(seller);

        info!("Opened temporary thread {}", id);
        self.threads.insert(0, thread);
        self.active = Some(id.clone());
        Ok(id)
    }

    pub fn select_thread(&mut self, id: &str) -> Result<()> {
        if self.position(id).is_none() {
            return Err(RealtimeError::UnknownThread(id.to_string()));
        }
        self.active = Some(id.to_string());
        Ok(())
    }

    /// Who a message in this thread goes to: the buyer when this user
    /// sells, otherwise the seller, otherwise the counterpart.
    pub fn recipient_for(&self, thread_id: &str) -> Result<String> {
        let thread = self
            .thread(thread_id)
            .ok_or_else(|| RealtimeError::UnknownThread(thread_id.to_string()))?;

        let recipient = if thread.seller_id.as_deref() == Some(self.self_id.as_str()) {
            thread.buyer_id.clone()
        } else {
            thread.seller_id.clone()
        }
        .filter(|r| !r.is_empty() && *r != self.self_id)
        .or_else(|| Some(thread.counterpart_id.clone()).filter(|c| !c.is_empty()));

        recipient.ok_or_else(|| {
            RealtimeError::InvalidInput(format!("cannot determine recipient for {}", thread_id))
        })
    }

    /// Show a local send immediately. Returns the optimistic message id.
    pub fn append_optimistic(
        &mut self,
        thread_id: &str,
        request_id: &str,
        body: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<String> {
        let self_id = self.self_id.clone();
        let idx = self
            .position(thread_id)
            .ok_or_else(|| RealtimeError::UnknownThread(thread_id.to_string()))?;
        let thread = &mut self.threads[idx];

        // Echo already merged under this request id
        if let Some(existing) = thread
            .messages
            .iter()
            .find(|m| m.request_id.as_deref() == Some(request_id))
        {
            debug!("Request {} already reconciled as {}", request_id, existing.id);
            return Ok(existing.id.clone());
        }

        let message = Message::optimistic(request_id, &self_id, body, sent_at);
        let id = message.id.clone();
        thread.push(message);
        debug!("Appended optimistic {} to {}", id, thread_id);
        Ok(id)
    }

    /// Merge a `chat.deliver` event.
    ///
    /// `frame_request_id` is the request id echoed on the frame, if any.
    pub fn apply_delivery(
        &mut self,
        payload: &ChatDeliverPayload,
        frame_request_id: Option<&str>,
    ) -> DeliveryOutcome {
        let from_self = payload.from_user_id == self.self_id;
        let counterpart = non_empty(payload.other_user_id.as_deref())
            .map(str::to_string)
            .or_else(|| (!from_self).then(|| payload.from_user_id.clone()));
        let listing = non_empty(payload.listing_id.as_deref());
        let conversation_id = non_empty(payload.conversation_id.as_deref());
        let message_id = non_empty(payload.message_id.as_deref());
        let sent_at = payload
            .sent_at
            .as_deref()
            .and_then(parse_timestamp)
            .unwrap_or_else(Utc::now);

        let promoted_from = match (conversation_id, counterpart.as_deref()) {
            (Some(conv), Some(cp)) => self.promote(cp, listing, conv),
            _ => None,
        };

        let target = match conversation_id {
            Some(conv) => self.position(conv),
            None => counterpart.as_deref().and_then(|cp| {
                self.threads
                    .iter()
                    .position(|t| t.matches_pair(cp, listing))
                    .or_else(|| self.threads.iter().position(|t| t.counterpart_id == cp))
            }),
        };

        let Some(idx) = target else {
            let cp = counterpart.unwrap_or_else(|| payload.from_user_id.clone());
            let id = conversation_id
                .map(str::to_string)
                .unwrap_or_else(|| format!("chat-{}-{}", self.self_id, cp));
            let mut thread = Conversation::new(
                id.clone(),
                &cp,
                listing,
                payload.listing_title.as_deref().unwrap_or("Chat"),
            );
            let mut message = Message::confirmed(
                message_id.map(str::to_string),
                &payload.from_user_id,
                &payload.text,
                sent_at,
            );
            if from_self {
                message.request_id = frame_request_id.map(str::to_string);
            }
            thread.push(message);
            info!("New thread {} from delivery", id);
            self.threads.insert(0, thread);
            return DeliveryOutcome {
                thread_id: id,
                matched: DeliveryMatch::NewThread,
                promoted_from,
                confirmed_request: None,
            };
        };

        let thread = &mut self.threads[idx];
        let (matched, confirmed_request) =
            merge_message(thread, payload, message_id, frame_request_id, from_self, sent_at);
        debug!("Delivery merged into {} ({:?})", thread.id, matched);

        DeliveryOutcome {
            thread_id: thread.id.clone(),
            matched,
            promoted_from,
            confirmed_request,
        }
    }

    /// Promote the temporary thread for (`counterpart`, `listing`) to `durable_id`.
    /// Returns the temporary id if a promotion happened.
    fn promote(&mut self, counterpart: &str, listing: Option<&str>, durable_id: &str) -> Option<String> {
        let temp_idx = self
            .threads
            .iter()
            .position(|t| t.is_temp && t.matches_pair(counterpart, listing))?;
        let temp_id = self.threads[temp_idx].id.clone();

        match self.position(durable_id) {
            Some(durable_idx) => {
                // Durable thread already known: fold the temporary one into it
                let temp = self.threads.remove(temp_idx);
                let durable_idx = if temp_idx < durable_idx {
                    durable_idx - 1
                } else {
                    durable_idx
                };
                let durable = &mut self.threads[durable_idx];
                for message in temp.messages {
                    if !durable.messages.iter().any(|m| m.id == message.id) {
                        durable.push(message);
                    }
                }
                if durable.seller_id.is_none() {
                    durable.seller_id = temp.seller_id;
                }
                if durable.buyer_id.is_none() {
                    durable.buyer_id = temp.buyer_id;
                }
                info!("Merged temporary thread {} into {}", temp_id, durable_id);
            }
            None => {
                let thread = &mut self.threads[temp_idx];
                thread.id = durable_id.to_string();
                thread.is_temp = false;
                info!("Promoted thread {} to {}", temp_id, durable_id);
            }
        }

        if self.active.as_deref() == Some(temp_id.as_str()) {
            self.active = Some(durable_id.to_string());
        }
        Some(temp_id)
    }

    fn find_by_request(&mut self, request_id: &str) -> Option<&mut Message> {
        self.threads
            .iter_mut()
            .flat_map(|t| t.messages.iter_mut())
            .find(|m| m.request_id.as_deref() == Some(request_id))
    }

    fn set_status(&mut self, request_id: &str, status: DeliveryStatus) -> bool {
        match self.find_by_request(request_id) {
            Some(message) => {
                let changed = message.advance(status);
                if changed {
                    info!("Message {} marked {}", message.id, status.label());
                } else {
                    debug!(
                        "Message {} already {}, not marking {}",
                        message.id,
                        message.status.label(),
                        status.label()
                    );
                }
                changed
            }
            None => {
                warn!("No local message for request {}", request_id);
                false
            }
        }
    }

    /// Recipient unreachable: keep the message, flag degraded delivery
    pub fn mark_sent_not_delivered(&mut self, request_id: &str) -> bool {
        self.set_status(request_id, DeliveryStatus::SentNotDelivered)
    }

    pub fn mark_failed(&mut self, request_id: &str) -> bool {
        self.set_status(request_id, DeliveryStatus::Failed)
    }

    /// Inbound read receipt from the counterpart
    pub fn apply_seen_receipt(&mut self, receipt: &ChatSeenPayload) -> bool {
        let Some(idx) = self.position(&receipt.conversation_id) else {
            debug!("Seen receipt for unknown thread {}", receipt.conversation_id);
            return false;
        };
        let Some(seen_at) = parse_timestamp(&receipt.seen_at) else {
            warn!("Seen receipt with bad timestamp: {}", receipt.seen_at);
            return false;
        };
        let thread = &mut self.threads[idx];
        if thread.counterpart_seen_at.map_or(true, |t| t < seen_at) {
            thread.counterpart_seen_at = Some(seen_at);
            return true;
        }
        false
    }

    /// Advance this user's read position. Returns the receipt to send, if any.
    pub fn mark_seen(&mut self, thread_id: &str) -> Option<ChatSeenPayload> {
        let self_id = self.self_id.clone();
        let idx = self.position(thread_id)?;
        let thread = &mut self.threads[idx];
        if thread.is_temp {
            return None;
        }
        let newest = thread
            .messages
            .iter()
            .rev()
            .find(|m| m.sender_id != self_id)?
            .sent_at;
        if thread.last_seen_at.is_some_and(|seen| seen >= newest) {
            return None;
        }
        thread.last_seen_at = Some(newest);
        Some(ChatSeenPayload {
            conversation_id: thread.id.clone(),
            seen_at: newest.to_rfc3339_opts(SecondsFormat::Millis, true),
        })
    }

    /// Replace the thread list with the server's, keeping local knowledge
    pub fn merge_server_threads(&mut self, summaries: Vec<ThreadSummary>) {
        let mut previous = std::mem::take(&mut self.threads);
        let mut merged: Vec<Conversation> = Vec::with_capacity(summaries.len());

        for summary in summaries {
            if merged.iter().any(|t| t.id == summary.id) {
                continue;
            }
            let mut thread = Conversation::new(
                summary.id.clone(),
                &summary.other_user_id,
                non_empty(summary.listing_id.as_deref()),
                summary.title(),
            );
            thread.seller_id = summary.seller_id.clone();
            thread.buyer_id = summary.buyer_id.clone();
            thread.last_activity = summary.last_sent_at;
            thread.last_preview = summary.last_message.clone();

            if let Some(pos) = previous.iter().position(|t| t.id == summary.id) {
                let local = previous.remove(pos);
                thread.last_seen_at = local.last_seen_at;
                thread.counterpart_seen_at = local.counterpart_seen_at;
                for message in local.messages {
                    thread.push(message);
                }
            }
            merged.push(thread);
        }

        for local in previous.into_iter().filter(|t| t.is_temp) {
            // Same pair now exists on the server: fold the temporary thread in
            if let Some(durable) = merged
                .iter_mut()
                .find(|t| t.matches_pair(&local.counterpart_id, local.listing_id.as_deref()))
            {
                info!("Folding temporary thread {} into {}", local.id, durable.id);
                if self.active.as_deref() == Some(local.id.as_str()) {
                    self.active = Some(durable.id.clone());
                }
                for message in local.messages {
                    durable.push(message);
                }
            } else {
                merged.push(local);
            }
        }

        merged.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));

        if self
            .active
            .as_ref()
            .is_some_and(|active| !merged.iter().any(|t| &t.id == active))
        {
            self.active = None;
        }
        debug!("Thread list merged: {} threads", merged.len());
        self.threads = merged;
    }

    /// Replace a thread's messages with server history, re-attaching local
    /// sends the server has not confirmed yet.
    pub fn load_history(&mut self, thread_id: &str, history: Vec<HistoryMessage>) -> Result<usize> {
        let idx = self
            .position(thread_id)
            .ok_or_else(|| RealtimeError::UnknownThread(thread_id.to_string()))?;
        let thread = &mut self.threads[idx];
        if thread.is_temp {
            return Err(RealtimeError::InvalidInput(format!(
                "{} is not known to the server yet",
                thread_id
            )));
        }

        let pending: Vec<Message> = thread.unconfirmed().cloned().collect();
        let local_ids: Vec<(String, DeliveryStatus)> = thread
            .messages
            .iter()
            .filter_map(|m| m.server_id.clone().map(|id| (id, m.status)))
            .collect();

        thread.messages.clear();
        thread.last_activity = None;
        for entry in history {
            let mut message =
                Message::confirmed(Some(entry.id.clone()), &entry.sender_id, &entry.body, entry.created_at);
            // A degraded status already shown for this message stays
            if let Some((_, status)) = local_ids.iter().find(|(id, _)| *id == entry.id) {
                message.status = *status;
            }
            thread.push(message);
        }
        let count = thread.messages.len();
        for message in pending {
            thread.push(message);
        }
        debug!("Loaded {} history messages into {}", count, thread_id);
        Ok(count)
    }
}

/// Merge one delivered message into its thread
fn merge_message(
    thread: &mut Conversation,
    payload: &ChatDeliverPayload,
    message_id: Option<&str>,
    frame_request_id: Option<&str>,
    from_self: bool,
    sent_at: DateTime<Utc>,
) -> (DeliveryMatch, Option<String>) {
    if let Some(server_id) = message_id {
        if let Some(existing) = thread
            .messages
            .iter_mut()
            .find(|m| m.server_id.as_deref() == Some(server_id))
        {
            existing.advance(DeliveryStatus::Delivered);
            return (DeliveryMatch::ServerId, None);
        }
    }

    if from_self {
        let by_request = frame_request_id.and_then(|rid| {
            thread
                .messages
                .iter()
                .position(|m| m.request_id.as_deref() == Some(rid))
        });
        let (idx, matched) = match by_request {
            Some(idx) => (Some(idx), DeliveryMatch::RequestId),
            None => {
                let same_text =
                    |m: &Message| m.sender_id == payload.from_user_id && m.body == payload.text;
                // Earliest optimistic send first, then a late echo of a degraded one
                let idx = thread
                    .messages
                    .iter()
                    .position(|m| m.is_unconfirmed_local() && m.is_optimistic() && same_text(m))
                    .or_else(|| {
                        thread.messages.iter().position(|m| {
                            m.is_unconfirmed_local()
                                && m.status != DeliveryStatus::Delivered
                                && same_text(m)
                        })
                    });
                (idx, DeliveryMatch::Content)
            }
        };

        if let Some(idx) = idx {
            let message = &mut thread.messages[idx];
            if let Some(server_id) = message_id {
                message.attach_server_id(server_id);
            }
            if payload.sent_at.is_some() {
                message.sent_at = sent_at;
            }
            message.advance(DeliveryStatus::Delivered);
            let confirmed = message.request_id.clone();
            let snapshot = message.clone();
            thread.touch(&snapshot);
            return (matched, confirmed);
        }
    }

    if message_id.is_none()
        && thread.messages.iter().any(|m| {
            m.sender_id == payload.from_user_id && m.body == payload.text && m.sent_at == sent_at
        })
    {
        return (DeliveryMatch::Duplicate, None);
    }

    let mut message = Message::confirmed(
        message_id.map(str::to_string),
        &payload.from_user_id,
        &payload.text,
        sent_at,
    );
    if from_self {
        message.request_id = frame_request_id.map(str::to_string);
    }
    thread.push(message);
    (DeliveryMatch::Appended, None)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
