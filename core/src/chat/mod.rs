/// Conversation threads and their reconciliation
pub mod reconciler;
pub mod types;

pub use reconciler::{ConversationReconciler, DeliveryMatch, DeliveryOutcome};
pub use types::{Conversation, DeliveryStatus, HistoryMessage, Message, ThreadSummary};
