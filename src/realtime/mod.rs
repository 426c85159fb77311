//! Realtime notifications over WebSocket.
//!
//! Every frame is a JSON object with a `type`. A client's first frame must be
//! `{"type":"auth","userId":...}`; until then the connection receives no
//! user-scoped delivery.

pub mod client;
pub mod handlers;
pub mod hub;
pub mod message;
pub mod socket;

pub use client::{ClientError, ClientState, RealtimeClient, Subscription};
pub use handlers::HandlerId;
pub use hub::{ConnectionId, ConnectionState, Hub, HubStats, Inbound, Publisher};
pub use message::{AUTH_TYPE, Envelope};
