//! Persistent-connection transport
//!
//! JSON-RPC flavored envelopes over any message-oriented socket. Queries and
//! mutations answer once; subscriptions answer `started`, then one `data` per
//! value, then `stopped` (or an error).
//!
//! Per connection, a request id maps to at most one live subscription. A second
//! subscription reusing a live id is stopped at once and answered with
//! `BAD_REQUEST` "Duplicate id", while the first keeps running.

mod connection;
mod envelope;
mod subscription;

pub use connection::{Connection, Outbound, SocketHandler};
pub use envelope::{
    EnvelopeId, JsonRpcVersion, ReconnectNotification, SocketMethod, SocketOutcome, SocketParams,
    SocketRequest, SocketResponse, SocketResult, parse_message,
};
pub use subscription::{CancellationSignal, ConnectionId, SubscriptionHandle, SubscriptionId};
