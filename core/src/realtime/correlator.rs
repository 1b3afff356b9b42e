/// Request/response correlation over the realtime channel
///
/// Every request-style frame gets a fresh request id and a pending entry
/// with its own timer. The entry is removed by whichever of response,
/// error or timeout arrives first; later arrivals for the same id are no-ops.
use crate::error::{RealtimeError, Result};
use crate::realtime::protocol::{Frame, EVENT_AGENT_SEARCH, EVENT_CHAT_MESSAGE};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, warn};
use uuid::Uuid;

pub type RequestId = String;

/// What kind of request a pending entry belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// AI listing search (`agent.search`)
    AgentSearch,
    /// Person-to-person chat send (`chat.message`)
    ChatMessage,
    /// Free-form question to the assistant (`chat.message`, answered by `chat.response`)
    AssistantChat,
}

impl RequestKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            RequestKind::AgentSearch => EVENT_AGENT_SEARCH,
            RequestKind::ChatMessage | RequestKind::AssistantChat => EVENT_CHAT_MESSAGE,
        }
    }

    fn id_prefix(&self) -> &'static str {
        match self {
            RequestKind::AgentSearch => "req",
            RequestKind::ChatMessage => "chat",
            RequestKind::AssistantChat => "ask",
        }
    }
}

struct PendingRequest {
    kind: RequestKind,
    issued_at: Instant,
    timer: Option<AbortHandle>,
    responder: oneshot::Sender<Result<Frame>>,
}

impl PendingRequest {
    fn finish(self, outcome: Result<Frame>) {
        if let Some(timer) = self.timer {
            timer.abort();
        }
        // Receiver may already be gone; the request still counts as resolved
        let _ = self.responder.send(outcome);
    }
}

/// Caller's side of one outstanding request
#[derive(Debug)]
pub struct PendingReply {
    request_id: RequestId,
    rx: oneshot::Receiver<Result<Frame>>,
}

impl PendingReply {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait for the single resolution of this request
    pub async fn wait(self) -> Result<Frame> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RealtimeError::Cancelled(self.request_id)),
        }
    }
}

/// Tracks outstanding requests until they resolve exactly once
#[derive(Clone)]
pub struct RequestCorrelator {
    pending: Arc<Mutex<HashMap<RequestId, PendingRequest>>>,
    timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    /// Mint a request id, record the pending entry and arm its timer.
    ///
    /// Returns the outbound frame to transmit and the caller's reply handle.
    /// Must be called from within a tokio runtime.
    pub fn issue(&self, kind: RequestKind, payload: Value) -> (Frame, PendingReply) {
        let request_id = format!("{}-{}", kind.id_prefix(), Uuid::new_v4());
        let (tx, rx) = oneshot::channel();

        self.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                kind,
                issued_at: Instant::now(),
                timer: None,
                responder: tx,
            },
        );

        let correlator = self.clone();
        let id = request_id.clone();
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.expire(&id);
        })
        .abort_handle();

        {
            let mut pending = self.pending.lock();
            match pending.get_mut(&request_id) {
                Some(entry) => entry.timer = Some(timer),
                // Resolved before the timer was attached
                None => timer.abort(),
            }
        }

        debug!("Issued {:?} request {}", kind, request_id);
        let frame = Frame::new(kind.event_type(), Some(request_id.clone()), payload);
        (frame, PendingReply { request_id, rx })
    }

    /// Complete a request with a response frame. No-op if not outstanding.
    pub fn resolve(&self, request_id: &str, frame: Frame) -> bool {
        let Some(entry) = self.take(request_id) else {
            debug!("Ignoring response for unknown or settled request {}", request_id);
            return false;
        };
        debug!(
            "Resolved {:?} request {} after {:?}",
            entry.kind,
            request_id,
            entry.issued_at.elapsed()
        );
        entry.finish(Ok(frame));
        true
    }

    /// Complete a request with an error. No-op if not outstanding.
    pub fn reject(&self, request_id: &str, error: RealtimeError) -> bool {
        let Some(entry) = self.take(request_id) else {
            debug!("Ignoring error for unknown or settled request {}", request_id);
            return false;
        };
        debug!("Rejected {:?} request {}: {}", entry.kind, request_id, error);
        entry.finish(Err(error));
        true
    }

    /// Give up on a request. Its timer is cancelled and the waiter sees `Cancelled`.
    pub fn cancel(&self, request_id: &str) -> bool {
        let Some(entry) = self.take(request_id) else {
            return false;
        };
        debug!("Cancelled {:?} request {}", entry.kind, request_id);
        if let Some(timer) = entry.timer {
            timer.abort();
        }
        drop(entry.responder);
        true
    }

    /// Timer path
    fn expire(&self, request_id: &str) {
        let Some(entry) = self.take(request_id) else {
            return;
        };
        warn!(
            "Request {} ({:?}) timed out after {:?}",
            request_id, entry.kind, self.timeout
        );
        let _ = entry.responder.send(Err(RealtimeError::Timeout(format!(
            "request {} got no reply within {:?}",
            request_id, self.timeout
        ))));
    }

    /// Reject everything still outstanding (used on teardown)
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(RequestId, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();
        for (id, entry) in drained {
            entry.finish(Err(RealtimeError::Cancelled(id)));
        }
        count
    }

    pub fn is_pending(&self, request_id: &str) -> bool {
        self.pending.lock().contains_key(request_id)
    }

    pub fn kind_of(&self, request_id: &str) -> Option<RequestKind> {
        self.pending.lock().get(request_id).map(|e| e.kind)
    }

    pub fn outstanding(&self) -> usize {
        self.pending.lock().len()
    }

    fn take(&self, request_id: &str) -> Option<PendingRequest> {
        self.pending.lock().remove(request_id)
    }
}
