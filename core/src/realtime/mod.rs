pub mod connection;
pub mod correlator;
pub mod dispatcher;
/// Realtime channel: wire protocol, connection, dispatch and correlation
pub mod protocol;

pub use connection::{
    CloseAction, ConnectionFault, ConnectionManager, ConnectionState, ConnectionStatus, Lifecycle,
};
pub use correlator::{PendingReply, RequestCorrelator, RequestId, RequestKind};
pub use dispatcher::{Callback, DispatchReport, EventDispatcher, SubscriptionId};
pub use protocol::{
    AgentResponsePayload, AgentSearchPayload, AssistantChatPayload, ChatDeliverPayload, ChatMessagePayload,
    ChatSeenPayload, CloseClass, ErrorPayload, Frame, ListingInfo,
};
