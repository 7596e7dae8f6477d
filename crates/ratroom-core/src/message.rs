//! Off-chain messages.
//!
//! Every frame on the wire is an `OffChainMessage` encoded as
//! `{"type": ..., "payload": ...}`. Decoding goes through [`decode`] so that
//! unknown types can be told apart from malformed frames.

use crate::RatId;
use serde::{Deserialize, Serialize};

/// A normalized game event, as fanned out by the hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum OffChainMessage {
    /// A balance changed.
    Balance(BalanceChange),
    /// A rat finished a trip.
    Trip(TripEvent),
    /// A room's balance changed.
    Room(RoomUpdate),
    /// The set of connected clients changed.
    Clients(ClientList),
}

impl OffChainMessage {
    /// Every `type` tag this version understands.
    pub const KNOWN_TYPES: &'static [&'static str] = &["balance", "trip", "room", "clients"];

    /// The wire tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            OffChainMessage::Balance(_) => "balance",
            OffChainMessage::Trip(_) => "trip",
            OffChainMessage::Room(_) => "room",
            OffChainMessage::Clients(_) => "clients",
        }
    }

    /// Whether the message belongs in the recent-events history.
    ///
    /// Client lists are snapshots; replaying an old one would be wrong.
    pub fn is_replayable(&self) -> bool {
        !matches!(self, OffChainMessage::Clients(_))
    }

    /// Serialize to a JSON text frame.
    pub fn to_json(&self) -> String {
        // Every variant is plain data with string keys; this cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Balance update payload.
///
/// A payload carrying `delta` is applied relative to the current balance;
/// otherwise `value` replaces it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BalanceChange {
    Delta { delta: i64 },
    Absolute { value: u64 },
}

impl BalanceChange {
    /// Apply this change to `current`.
    pub fn apply(self, current: u64) -> u64 {
        match self {
            BalanceChange::Absolute { value } => value,
            BalanceChange::Delta { delta } => current.saturating_add_signed(delta),
        }
    }
}

/// Outcome of a single trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripEvent {
    pub trip_id: String,
    pub rat_id: RatId,
    pub outcome: String,
    pub value_change: i64,
    pub block_number: u64,
}

/// New balance of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomUpdate {
    pub room_id: String,
    pub balance: u64,
    pub block_number: u64,
}

/// Snapshot of connected clients, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientList {
    pub clients: Vec<RatId>,
}

/// Result of decoding a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// A message this version understands.
    Message(OffChainMessage),
    /// A well-formed frame with a type this version does not know.
    Unknown(String),
}

/// Error decoding a frame.
#[derive(Debug, thiserror::Error)]
#[error("malformed message: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Decode a text frame.
pub fn decode(text: &str) -> Result<Decoded, DecodeError> {
    let envelope: Envelope = serde_json::from_str(text)?;
    if !OffChainMessage::KNOWN_TYPES.contains(&envelope.kind.as_str()) {
        return Ok(Decoded::Unknown(envelope.kind));
    }
    Ok(Decoded::Message(serde_json::from_str(text)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn balance_wire_shape() {
        let msg = OffChainMessage::Balance(BalanceChange::Absolute { value: 42 });
        let value: serde_json::Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(value, json!({"type": "balance", "payload": {"value": 42}}));
    }

    #[test]
    fn delta_wins_over_value() {
        let decoded = decode(r#"{"type":"balance","payload":{"value":10,"delta":-3}}"#).unwrap();
        assert_eq!(
            decoded,
            Decoded::Message(OffChainMessage::Balance(BalanceChange::Delta { delta: -3 }))
        );
    }

    #[test]
    fn balance_change_apply() {
        assert_eq!(BalanceChange::Absolute { value: 7 }.apply(100), 7);
        assert_eq!(BalanceChange::Delta { delta: 5 }.apply(100), 105);
        assert_eq!(BalanceChange::Delta { delta: -500 }.apply(100), 0);
    }

    #[test]
    fn unknown_type_is_not_an_error() {
        assert_eq!(
            decode(r#"{"type":"foo"}"#).unwrap(),
            Decoded::Unknown("foo".to_string())
        );
        assert_eq!(
            decode(r#"{"type":"foo","payload":[1,2,3]}"#).unwrap(),
            Decoded::Unknown("foo".to_string())
        );
    }

    #[test]
    fn malformed_frames() {
        assert!(decode("not json").is_err());
        assert!(decode(r#"{"payload":{}}"#).is_err());
        assert!(decode(r#"{"type":"balance"}"#).is_err());
        assert!(decode(r#"{"type":"balance","payload":"lots"}"#).is_err());
        assert!(decode(r#"{"type":"clients","payload":{"clients":["bad id"]}}"#).is_err());
    }

    #[test]
    fn trip_decodes() {
        let text = r#"{"type":"trip","payload":{"trip_id":"0x01","rat_id":"rat_1","outcome":"survived","value_change":-20,"block_number":9}}"#;
        let Decoded::Message(OffChainMessage::Trip(trip)) = decode(text).unwrap() else {
            panic!("expected trip");
        };
        assert_eq!(trip.rat_id.as_str(), "rat_1");
        assert_eq!(trip.value_change, -20);
    }

    #[test]
    fn clients_are_not_replayable() {
        assert!(!OffChainMessage::Clients(ClientList::default()).is_replayable());
        assert!(OffChainMessage::Balance(BalanceChange::Absolute { value: 1 }).is_replayable());
    }
}
