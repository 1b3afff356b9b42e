/// Connection lifecycle and the WebSocket driver
///
/// `Lifecycle` is the pure state machine; `ConnectionManager` runs a socket
/// task per generation and feeds it open/close events. Every callback carries
/// the generation it was created for, and anything from a superseded
/// generation is ignored.
use crate::config::{Config, Credential};
use crate::error::{RealtimeError, Result};
use crate::realtime::dispatcher::{EventDispatcher, SubscriptionId};
use crate::realtime::protocol::{
    CloseClass, Frame, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_POLICY,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Never connected
    Idle,
    /// Attempt in progress
    Connecting,
    /// Open and able to send
    Open,
    /// Explicit close in progress
    Closing,
    /// Closed; may be followed by a reconnect
    Closed,
    /// Terminal; needs a new credential or a manual connect
    Failed,
}

/// Fault reported through the connection status
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectionFault {
    #[error("Connection error occurred: {0}")]
    Transient(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Failed to connect after {0} attempts")]
    RetriesExhausted(u32),

    #[error("No authentication credential available")]
    MissingCredential,
}

impl ConnectionFault {
    /// Faults that stop the manager for good
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ConnectionFault::Transient(_))
    }
}

impl From<ConnectionFault> for RealtimeError {
    fn from(fault: ConnectionFault) -> Self {
        match fault {
            ConnectionFault::Transient(msg) => RealtimeError::Connection(msg),
            ConnectionFault::AuthRejected(msg) => RealtimeError::AuthRejected(msg),
            ConnectionFault::RetriesExhausted(n) => RealtimeError::RetriesExhausted(n),
            ConnectionFault::MissingCredential => RealtimeError::MissingCredential,
        }
    }
}

/// Observable connection status
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    pub last_error: Option<ConnectionFault>,
    pub reconnect_attempts: u32,
    pub generation: u64,
}

impl ConnectionStatus {
    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Open
    }
}

/// What the driver should do after a close
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseAction {
    /// Close belonged to a superseded connection
    Ignore,
    /// Normal closure, nothing more to do
    Stop,
    /// Wait the reconnect delay, then try again
    Reconnect { attempt: u32 },
    /// Terminal failure
    Fail(ConnectionFault),
}

/// Connection state machine
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: ConnectionState,
    generation: u64,
    attempts: u32,
    max_attempts: u32,
    last_error: Option<ConnectionFault>,
}

impl Lifecycle {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            generation: 0,
            attempts: 0,
            max_attempts,
            last_error: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            last_error: self.last_error.clone(),
            reconnect_attempts: self.attempts,
            generation: self.generation,
        }
    }

    /// Manual connect: supersedes whatever exists and starts a fresh retry budget
    pub fn begin_connect(&mut self) -> u64 {
        self.attempts = 0;
        self.last_error = None;
        self.next_generation()
    }

    /// Scheduled reconnect. Only valid while `generation` is still current
    /// and nothing else has moved the state on.
    pub fn begin_reconnect(&mut self, generation: u64) -> Option<u64> {
        if !self.is_current(generation) || self.state != ConnectionState::Closed {
            return None;
        }
        Some(self.next_generation())
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.state = ConnectionState::Connecting;
        self.generation
    }

    /// Returns false when the open belongs to a superseded attempt
    pub fn on_open(&mut self, generation: u64) -> bool {
        if !self.is_current(generation) || self.state != ConnectionState::Connecting {
            return false;
        }
        self.state = ConnectionState::Open;
        self.attempts = 0;
        self.last_error = None;
        true
    }

    pub fn on_close(&mut self, generation: u64, code: u16, reason: &str) -> CloseAction {
        if !self.is_current(generation) {
            return CloseAction::Ignore;
        }
        if matches!(
            self.state,
            ConnectionState::Closed | ConnectionState::Failed | ConnectionState::Idle
        ) {
            return CloseAction::Ignore;
        }

        match CloseClass::from_code(code) {
            CloseClass::Normal => {
                self.state = ConnectionState::Closed;
                CloseAction::Stop
            }
            CloseClass::Rejected => {
                let fault = ConnectionFault::AuthRejected(if reason.is_empty() {
                    format!("closed with code {}", code)
                } else {
                    reason.to_string()
                });
                self.fail(fault.clone());
                CloseAction::Fail(fault)
            }
            CloseClass::Abnormal => {
                if self.attempts < self.max_attempts {
                    self.attempts += 1;
                    self.state = ConnectionState::Closed;
                    self.last_error = Some(ConnectionFault::Transient(format!(
                        "closed with code {}{}",
                        code,
                        if reason.is_empty() {
                            String::new()
                        } else {
                            format!(": {}", reason)
                        }
                    )));
                    CloseAction::Reconnect {
                        attempt: self.attempts,
                    }
                } else {
                    let fault = ConnectionFault::RetriesExhausted(self.max_attempts);
                    self.fail(fault.clone());
                    CloseAction::Fail(fault)
                }
            }
        }
    }

    /// Explicit close. Bumps the generation so in-flight callbacks go stale.
    pub fn begin_disconnect(&mut self) {
        self.generation += 1;
        self.state = ConnectionState::Closing;
    }

    pub fn finish_disconnect(&mut self) {
        if self.state == ConnectionState::Closing {
            self.state = ConnectionState::Closed;
        }
    }

    pub fn fail(&mut self, fault: ConnectionFault) {
        self.state = ConnectionState::Failed;
        self.last_error = Some(fault);
    }
}

/// Outbound half of the current socket
struct Link {
    generation: u64,
    outbound: mpsc::UnboundedSender<Message>,
}

struct Inner {
    lifecycle: Lifecycle,
    link: Option<Link>,
}

struct Shared {
    config: Config,
    credential: Mutex<Option<Credential>>,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ConnectionStatus>,
    dispatcher: EventDispatcher,
}

/// Owns the one logical connection of a session
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(config: Config, credential: Option<Credential>) -> Self {
        let lifecycle = Lifecycle::new(config.max_reconnect_attempts);
        let (status_tx, _) = watch::channel(lifecycle.status());
        Self {
            shared: Arc::new(Shared {
                config,
                credential: Mutex::new(credential),
                inner: Mutex::new(Inner {
                    lifecycle,
                    link: None,
                }),
                status_tx,
                dispatcher: EventDispatcher::new(),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Subscriber registry scoped to this manager
    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.shared.dispatcher
    }

    pub fn subscribe<F>(&self, event_type: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Frame) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.dispatcher.subscribe(event_type, callback)
    }

    pub fn unsubscribe(&self, event_type: &str, id: SubscriptionId) -> bool {
        self.shared.dispatcher.unsubscribe(event_type, id)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.inner.lock().lifecycle.status()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status().connected()
    }

    /// Replace the credential used by the next connect
    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.shared.credential.lock() = credential;
    }

    /// Open a new connection, superseding any existing one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) -> Result<()> {
        let credential = self.shared.credential.lock().clone();
        let Some(credential) = credential else {
            let mut inner = self.shared.inner.lock();
            inner.lifecycle.fail(ConnectionFault::MissingCredential);
            self.publish(&inner);
            error!("Cannot connect: no authentication credential");
            return Err(RealtimeError::MissingCredential);
        };

        let generation = {
            let mut inner = self.shared.inner.lock();
            // Dropping the old link closes the superseded socket
            if inner.link.take().is_some() {
                debug!("Closing existing connection before reconnecting");
            }
            let generation = inner.lifecycle.begin_connect();
            self.publish(&inner);
            generation
        };

        info!(
            "Connecting to WebSocket: {} (generation {})",
            self.shared.config.redacted_url(),
            generation
        );

        let url = self.shared.config.endpoint_url(&credential);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(generation, url).await;
        });
        Ok(())
    }

    /// Manual reconnect
    pub fn reconnect(&self) -> Result<()> {
        self.connect()
    }

    /// Close with a normal code, cancel pending reconnects and drop all subscribers
    pub fn disconnect(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.lifecycle.begin_disconnect();
            inner.link = None;
            self.publish(&inner);
            inner.lifecycle.finish_disconnect();
            self.publish(&inner);
        }
        self.shared.dispatcher.clear();
        info!("WebSocket disconnected by client");
    }

    /// Transmit a frame. Fails immediately unless the connection is open.
    pub fn send(&self, frame: &Frame) -> Result<()> {
        let text = frame.to_text()?;
        let inner = self.shared.inner.lock();
        let state = inner.lifecycle.state();
        match (&inner.link, state) {
            (Some(link), ConnectionState::Open) => {
                link.outbound.send(Message::text(text)).map_err(|_| {
                    RealtimeError::NotConnected("socket writer closed".to_string())
                })?;
                debug!("Sent {}", frame);
                Ok(())
            }
            _ => Err(RealtimeError::NotConnected(format!("{:?}", state))),
        }
    }

    fn publish(&self, inner: &Inner) {
        self.shared.status_tx.send_replace(inner.lifecycle.status());
    }

    /// Drive one logical connection: socket, close handling and reconnects
    async fn run(&self, mut generation: u64, url: String) {
        loop {
            let Some((code, reason)) = self.run_socket(generation, &url).await else {
                debug!("Connection generation {} superseded", generation);
                return;
            };

            let action = {
                let mut inner = self.shared.inner.lock();
                if inner.link.as_ref().map(|l| l.generation) == Some(generation) {
                    inner.link = None;
                }
                let action = inner.lifecycle.on_close(generation, code, &reason);
                self.publish(&inner);
                action
            };

            match action {
                CloseAction::Ignore => {
                    debug!("Ignoring close from stale generation {}", generation);
                    return;
                }
                CloseAction::Stop => {
                    info!("WebSocket closed normally");
                    return;
                }
                CloseAction::Fail(fault) => {
                    error!("WebSocket closed for good: {}", fault);
                    return;
                }
                CloseAction::Reconnect { attempt } => {
                    warn!(
                        "WebSocket closed: {} {}. Reconnecting... (attempt {}/{})",
                        code, reason, attempt, self.shared.config.max_reconnect_attempts
                    );
                    sleep(self.shared.config.reconnect_delay).await;

                    let next = {
                        let mut inner = self.shared.inner.lock();
                        let next = inner.lifecycle.begin_reconnect(generation);
                        if next.is_some() {
                            self.publish(&inner);
                        }
                        next
                    };
                    match next {
                        Some(g) => generation = g,
                        None => {
                            debug!("Scheduled reconnect for generation {} cancelled", generation);
                            return;
                        }
                    }
                }
            }
        }
    }

    /// Returns the close code and reason, or `None` if this generation was
    /// superseded while running.
    async fn run_socket(&self, generation: u64, url: &str) -> Option<(u16, String)> {
        let ws = match timeout(self.shared.config.connect_timeout, connect_async(url)).await {
            Ok(Ok((ws, _response))) => ws,
            Ok(Err(WsError::Http(response))) => {
                let status = response.status().as_u16();
                warn!("WebSocket handshake rejected with HTTP {}", status);
                let code = if status == 401 || status == 403 {
                    CLOSE_POLICY
                } else {
                    CLOSE_ABNORMAL
                };
                return Some((code, format!("handshake rejected with HTTP {}", status)));
            }
            Ok(Err(e)) => {
                warn!("WebSocket connect failed: {}", e);
                return Some((CLOSE_ABNORMAL, e.to_string()));
            }
            Err(_) => {
                warn!(
                    "WebSocket connect timed out after {:?}",
                    self.shared.config.connect_timeout
                );
                return Some((CLOSE_ABNORMAL, "connect timed out".to_string()));
            }
        };

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let current = {
            let mut inner = self.shared.inner.lock();
            let current = inner.lifecycle.on_open(generation);
            if current {
                inner.link = Some(Link {
                    generation,
                    outbound: outbound_tx,
                });
                self.publish(&inner);
            }
            current
        };
        if !current {
            let mut ws = ws;
            let _ = ws.close(None).await;
            return None;
        }
        info!("WebSocket connected (generation {})", generation);

        let (mut sink, mut stream) = ws.split();
        loop {
            tokio::select! {
                outbound = outbound_rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!("WebSocket write failed: {}", e);
                            return Some((CLOSE_ABNORMAL, e.to_string()));
                        }
                    }
                    None => {
                        // Link dropped: explicit disconnect or superseded by a new connect
                        let close = CloseFrame {
                            code: CloseCode::from(CLOSE_NORMAL),
                            reason: "Client disconnect".into(),
                        };
                        let _ = sink.send(Message::Close(Some(close))).await;
                        let _ = sink.close().await;
                        return None;
                    }
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(generation, text.as_str()),
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(f) => (u16::from(f.code), f.reason.as_str().to_string()),
                            None => (CloseCode::Status.into(), String::new()),
                        };
                        info!("WebSocket closed by server: {} {}", code, reason);
                        return Some((code, reason));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        return Some((CLOSE_ABNORMAL, e.to_string()));
                    }
                    None => return Some((CLOSE_ABNORMAL, "stream ended".to_string())),
                },
            }
        }
    }

    fn handle_text(&self, generation: u64, text: &str) {
        if !self.shared.inner.lock().lifecycle.is_current(generation) {
            debug!("Dropping frame from superseded generation {}", generation);
            return;
        }
        match Frame::from_text(text) {
            Ok(frame) => {
                debug!("WebSocket message received: {}", frame);
                self.shared.dispatcher.dispatch(&frame);
            }
            Err(e) => warn!("Dropping malformed frame: {}", e),
        }
    }
}
