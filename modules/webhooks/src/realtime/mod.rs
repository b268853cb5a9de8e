//! Authenticated WebSocket push channel with room-based fan-out.

pub mod auth;
pub mod handler;
pub mod hub;
pub mod message;
pub mod rooms;

pub use auth::{push_auth_middleware, AuthenticatedClient, PushAuth, PushClaims};
pub use handler::ws_handler;
pub use hub::{ClientAction, ConnectionId, Outbound, PushConfig, PushHub};
pub use message::{ClientMessage, ServerFrame};
pub use rooms::{RoomSpec, Scope, SubscriptionFilter};
