//! Core types for the rat room sync hub.
//!
//! This crate defines what travels over the wire. The hub and the client
//! both depend on it; neither owns the format.

mod identity;
mod message;

pub use identity::{RatId, RatIdError};
pub use message::{
    BalanceChange, ClientList, DecodeError, Decoded, OffChainMessage, RoomUpdate, TripEvent,
    decode,
};

/// Path prefix of the WebSocket endpoint; the rat id follows it.
pub const WS_CONNECT_PATH: &str = "/ws-connect";

/// Connection lifecycle state, as seen by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Establishing connection.
    #[default]
    Connecting,
    /// Receiving replay and live messages.
    Live,
    /// Connection lost, retrying.
    Reconnecting,
    /// Closed for good.
    Closed,
}

impl ConnectionState {
    /// Whether messages are currently flowing.
    pub fn is_live(self) -> bool {
        self == ConnectionState::Live
    }
}
