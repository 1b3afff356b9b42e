/// MarketLink - Realtime client core for a marketplace
///
/// One resilient WebSocket per session, event fan-out by type, request
/// correlation with timeouts and optimistic chat state reconciled against
/// server delivery events.

pub mod chat;
pub mod cli_app;
pub mod config;
pub mod error;
pub mod realtime;
pub mod session;

pub use chat::{Conversation, ConversationReconciler, DeliveryStatus, Message};
pub use config::{Config, Credential};
pub use error::{RealtimeError, Result};
pub use realtime::{ConnectionManager, ConnectionState, ConnectionStatus, EventDispatcher, Frame, RequestCorrelator};
pub use session::{ChatSendReceipt, ChatSession};
