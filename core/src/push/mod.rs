pub mod connection;
/// Push channel: wire contract, connection lifecycle, WebSocket transport
pub mod protocol;
pub mod websocket;

pub use connection::{
    ConnectionEvent, ConnectionManager, ConnectionPhase, ConnectionState, PushConnector,
    PushHandle, PushLink, PushSignal,
};
pub use protocol::{
    AuthFailure, DeliveredNotice, InboundEvent, MarkDelivered, OutboundEvent, ReadReceipt,
    ReadRequest, SendAck, SendRequest,
};
pub use websocket::WsConnector;
