//! Client-side mirror of hub state.
//!
//! The mirror is a plain context object: create one, hand clones to the
//! transport and to whatever renders it. There is no global state.

use crate::cell::Cell;
use ratroom_core::{ConnectionState, DecodeError, Decoded, OffChainMessage, RatId, decode};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

/// Default number of recent events kept.
pub const DEFAULT_HISTORY_LEN: usize = 32;

/// What [`Mirror::apply_text`] did with a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A message of this type updated the mirror.
    Updated(&'static str),
    /// The type is unknown; nothing changed.
    Ignored(String),
}

/// Reactive copy of what the hub has told this client.
#[derive(Clone, Debug)]
pub struct Mirror {
    state: Cell<ConnectionState>,
    connected: Cell<bool>,
    balance: Cell<u64>,
    rooms: Cell<BTreeMap<String, u64>>,
    clients: Cell<Vec<RatId>>,
    latest_events: Cell<VecDeque<OffChainMessage>>,
    round_trip: Cell<Option<Duration>>,
    history_len: usize,
}

impl Default for Mirror {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LEN)
    }
}

impl Mirror {
    pub fn new(history_len: usize) -> Self {
        Self {
            state: Cell::new(ConnectionState::Connecting),
            connected: Cell::new(false),
            balance: Cell::new(0),
            rooms: Cell::default(),
            clients: Cell::default(),
            latest_events: Cell::new(VecDeque::with_capacity(history_len)),
            round_trip: Cell::new(None),
            history_len,
        }
    }

    /// Connection lifecycle.
    pub fn state(&self) -> &Cell<ConnectionState> {
        &self.state
    }

    /// True while messages are flowing.
    pub fn connected(&self) -> &Cell<bool> {
        &self.connected
    }

    pub fn balance(&self) -> &Cell<u64> {
        &self.balance
    }

    /// Room balances by room id.
    pub fn rooms(&self) -> &Cell<BTreeMap<String, u64>> {
        &self.rooms
    }

    /// Connected clients, oldest first.
    pub fn clients(&self) -> &Cell<Vec<RatId>> {
        &self.clients
    }

    /// Recent game events, oldest first.
    pub fn latest_events(&self) -> &Cell<VecDeque<OffChainMessage>> {
        &self.latest_events
    }

    /// Last measured round-trip time.
    pub fn round_trip(&self) -> &Cell<Option<Duration>> {
        &self.round_trip
    }

    /// Apply one message.
    pub fn apply(&self, msg: &OffChainMessage) {
        match msg {
            OffChainMessage::Balance(change) => {
                let change = *change;
                self.balance.update(|balance| *balance = change.apply(*balance));
            }
            OffChainMessage::Room(room) => {
                self.rooms.update(|rooms| {
                    rooms.insert(room.room_id.clone(), room.balance);
                });
            }
            OffChainMessage::Trip(_) => {}
            OffChainMessage::Clients(list) => self.clients.set(list.clients.clone()),
        }

        if msg.is_replayable() && self.history_len > 0 {
            self.latest_events.update(|events| {
                if events.len() == self.history_len {
                    events.pop_front();
                }
                events.push_back(msg.clone());
            });
        }
    }

    /// Decode a text frame and apply it.
    ///
    /// Malformed frames and unknown types leave every cell untouched.
    pub fn apply_text(&self, text: &str) -> Result<Applied, DecodeError> {
        match decode(text)? {
            Decoded::Message(msg) => {
                self.apply(&msg);
                Ok(Applied::Updated(msg.kind()))
            }
            Decoded::Unknown(kind) => Ok(Applied::Ignored(kind)),
        }
    }

    /// Forget everything learned from the previous connection.
    ///
    /// The hub replays its history to every new connection, so the mirror
    /// must be empty when that replay starts or deltas would apply twice.
    /// The round-trip sample is kept.
    pub fn begin_session(&self) {
        if self.balance.get() != 0 {
            self.balance.set(0);
        }
        if self.rooms.with(|rooms| !rooms.is_empty()) {
            self.rooms.set(BTreeMap::new());
        }
        if self.clients.with(|clients| !clients.is_empty()) {
            self.clients.set(Vec::new());
        }
        if self.latest_events.with(|events| !events.is_empty()) {
            self.latest_events.set(VecDeque::with_capacity(self.history_len));
        }
    }

    /// Move to a new lifecycle state.
    pub fn set_state(&self, state: ConnectionState) {
        self.state.set(state);
        if self.connected.get() != state.is_live() {
            self.connected.set(state.is_live());
        }
    }

    pub(crate) fn record_round_trip(&self, sample: Duration) {
        self.round_trip.set(Some(sample));
    }
}
