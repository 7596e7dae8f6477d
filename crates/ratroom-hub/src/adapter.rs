//! World-state adapter.
//!
//! Turns raw table updates from the chain indexer into off-chain messages
//! and hands them to the hub. Updates arrive as newline-delimited JSON,
//! one [`RawWorldEvent`] per line, in block/log order.

use crate::config::ChainConfig;
use crate::hub::Hub;
use ratroom_core::{BalanceChange, OffChainMessage, RatId, RatIdError, RoomUpdate, TripEvent};
use serde::Deserialize;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;

/// A raw table update, as emitted by the indexer.
#[derive(Debug, Clone, Deserialize)]
pub struct RawWorldEvent {
    pub table: String,
    pub block_number: u64,
    #[serde(default)]
    pub log_index: u64,
    /// Set by indexers that serve several chains.
    #[serde(default)]
    pub chain_id: Option<u64>,
    #[serde(default)]
    pub key: Vec<String>,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum NormalizationError {
    #[error("invalid event json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{table}: event for chain {got}, expected {expected}")]
    ChainMismatch { table: String, got: u64, expected: u64 },
    #[error("{table}: missing key")]
    MissingKey { table: String },
    #[error("{table}: missing field `{field}`")]
    MissingField { table: String, field: &'static str },
    #[error("{table}: field `{field}` is not a valid {expected}")]
    InvalidField {
        table: String,
        field: &'static str,
        expected: &'static str,
    },
    #[error("{table}: {source}")]
    RatId {
        table: String,
        #[source]
        source: RatIdError,
    },
}

/// Normalize one raw event.
///
/// `Ok(None)` means the table is not one clients care about.
pub fn normalize(raw: &RawWorldEvent) -> Result<Option<OffChainMessage>, NormalizationError> {
    let table = raw.table.as_str();
    let msg = match table {
        "Balance" => {
            let change = if raw.fields.contains_key("delta") {
                BalanceChange::Delta {
                    delta: field_i64(raw, "delta")?,
                }
            } else {
                BalanceChange::Absolute {
                    value: field_u64(raw, "value")?,
                }
            };
            OffChainMessage::Balance(change)
        }
        "Trip" => {
            let rat_id = field_str(raw, "rat_id")?
                .parse::<RatId>()
                .map_err(|source| NormalizationError::RatId {
                    table: raw.table.clone(),
                    source,
                })?;
            OffChainMessage::Trip(TripEvent {
                trip_id: first_key(raw)?,
                rat_id,
                outcome: field_str(raw, "outcome")?.to_string(),
                value_change: field_i64(raw, "value_change")?,
                block_number: raw.block_number,
            })
        }
        "Room" => OffChainMessage::Room(RoomUpdate {
            room_id: first_key(raw)?,
            balance: field_u64(raw, "balance")?,
            block_number: raw.block_number,
        }),
        _ => return Ok(None),
    };
    Ok(Some(msg))
}

fn first_key(raw: &RawWorldEvent) -> Result<String, NormalizationError> {
    raw.key
        .first()
        .filter(|key| !key.is_empty())
        .cloned()
        .ok_or_else(|| NormalizationError::MissingKey {
            table: raw.table.clone(),
        })
}

fn field<'a>(raw: &'a RawWorldEvent, name: &'static str) -> Result<&'a Value, NormalizationError> {
    raw.fields
        .get(name)
        .ok_or_else(|| NormalizationError::MissingField {
            table: raw.table.clone(),
            field: name,
        })
}

fn invalid(raw: &RawWorldEvent, field: &'static str, expected: &'static str) -> NormalizationError {
    NormalizationError::InvalidField {
        table: raw.table.clone(),
        field,
        expected,
    }
}

fn field_str<'a>(raw: &'a RawWorldEvent, name: &'static str) -> Result<&'a str, NormalizationError> {
    field(raw, name)?
        .as_str()
        .ok_or_else(|| invalid(raw, name, "string"))
}

// Chain integers often arrive as decimal strings; accept both forms.
fn field_u64(raw: &RawWorldEvent, name: &'static str) -> Result<u64, NormalizationError> {
    match field(raw, name)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(raw, name, "unsigned integer"))
}

fn field_i64(raw: &RawWorldEvent, name: &'static str) -> Result<i64, NormalizationError> {
    match field(raw, name)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid(raw, name, "integer"))
}

/// Running totals, logged when the source ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AdapterStats {
    /// Messages handed to the hub.
    pub emitted: u64,
    /// Events from tables clients do not care about.
    pub skipped: u64,
    /// Events that failed to normalize.
    pub dropped: u64,
}

/// Feeds normalized world events into the hub.
pub struct EventAdapter {
    hub: Hub,
    chain_id: u64,
    stats: AdapterStats,
}

impl EventAdapter {
    pub fn new(hub: Hub, chain: &ChainConfig) -> Self {
        Self {
            hub,
            chain_id: chain.chain_id(),
            stats: AdapterStats::default(),
        }
    }

    pub fn stats(&self) -> AdapterStats {
        self.stats
    }

    /// Normalize and forward one event. Bad events are logged and dropped.
    pub fn handle(&mut self, raw: &RawWorldEvent) {
        let result = match raw.chain_id {
            Some(got) if got != self.chain_id => Err(NormalizationError::ChainMismatch {
                table: raw.table.clone(),
                got,
                expected: self.chain_id,
            }),
            _ => normalize(raw),
        };

        match result {
            Ok(Some(msg)) => {
                self.stats.emitted += 1;
                self.hub.broadcast(msg);
            }
            Ok(None) => {
                self.stats.skipped += 1;
                tracing::trace!(table = %raw.table, "Ignoring table");
            }
            Err(e) => {
                self.stats.dropped += 1;
                tracing::warn!(
                    block = raw.block_number,
                    log_index = raw.log_index,
                    "Dropping world event: {}",
                    e
                );
            }
        }
    }

    /// Parse and forward one line of indexer output.
    pub fn handle_line(&mut self, line: &str) {
        match serde_json::from_str::<RawWorldEvent>(line) {
            Ok(raw) => self.handle(&raw),
            Err(e) => {
                self.stats.dropped += 1;
                tracing::warn!("Dropping world event: {}", NormalizationError::from(e));
            }
        }
    }

    /// Consume newline-delimited JSON until the reader ends.
    pub async fn run_lines<R>(mut self, reader: R) -> std::io::Result<AdapterStats>
    where
        R: AsyncBufRead + Unpin,
    {
        tracing::info!(chain_id = self.chain_id, "World-state adapter started");
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            self.handle_line(&line);
        }
        self.log_finished();
        Ok(self.stats)
    }

    /// Consume events from an in-process source until it closes.
    pub async fn run_channel(mut self, mut rx: mpsc::Receiver<RawWorldEvent>) -> AdapterStats {
        tracing::info!(chain_id = self.chain_id, "World-state adapter started");
        while let Some(raw) = rx.recv().await {
            self.handle(&raw);
        }
        self.log_finished();
        self.stats
    }

    fn log_finished(&self) {
        tracing::info!(
            emitted = self.stats.emitted,
            skipped = self.stats.skipped,
            dropped = self.stats.dropped,
            "World-state source ended"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::registry::Outbound;
    use serde_json::json;

    const KEY: &str = "59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    fn raw(value: Value) -> RawWorldEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn balance_absolute_and_delta() {
        let absolute = raw(json!({"table": "Balance", "block_number": 1, "fields": {"value": "42"}}));
        assert_eq!(
            normalize(&absolute).unwrap(),
            Some(OffChainMessage::Balance(BalanceChange::Absolute { value: 42 }))
        );

        let delta = raw(json!({"table": "Balance", "block_number": 1, "fields": {"value": 1, "delta": -5}}));
        assert_eq!(
            normalize(&delta).unwrap(),
            Some(OffChainMessage::Balance(BalanceChange::Delta { delta: -5 }))
        );
    }

    #[test]
    fn trip_and_room() {
        let trip = raw(json!({
            "table": "Trip",
            "block_number": 77,
            "key": ["0xabc"],
            "fields": {"rat_id": "rat_9", "outcome": "died", "value_change": "-100"}
        }));
        let Some(OffChainMessage::Trip(trip)) = normalize(&trip).unwrap() else {
            panic!("expected trip");
        };
        assert_eq!(trip.trip_id, "0xabc");
        assert_eq!(trip.value_change, -100);
        assert_eq!(trip.block_number, 77);

        let room = raw(json!({"table": "Room", "block_number": 3, "key": ["room_1"], "fields": {"balance": 500}}));
        assert_eq!(
            normalize(&room).unwrap(),
            Some(OffChainMessage::Room(RoomUpdate {
                room_id: "room_1".to_string(),
                balance: 500,
                block_number: 3,
            }))
        );
    }

    #[test]
    fn irrelevant_tables_are_skipped() {
        let other = raw(json!({"table": "GamePercentage", "block_number": 1}));
        assert_eq!(normalize(&other).unwrap(), None);
    }

    #[test]
    fn malformed_rows() {
        let cases = [
            json!({"table": "Balance", "block_number": 1}),
            json!({"table": "Balance", "block_number": 1, "fields": {"value": -1}}),
            json!({"table": "Room", "block_number": 1, "fields": {"balance": 1}}),
            json!({"table": "Trip", "block_number": 1, "key": ["t"], "fields": {"rat_id": "no spaces", "outcome": "x", "value_change": 0}}),
            json!({"table": "Trip", "block_number": 1, "key": ["t"], "fields": {"rat_id": "r", "outcome": 5, "value_change": 0}}),
        ];
        for case in cases {
            assert!(normalize(&raw(case.clone())).is_err(), "{case}");
        }
    }

    #[tokio::test]
    async fn bad_lines_do_not_stop_the_adapter() {
        let hub = Hub::spawn(&HubConfig::default());
        let chain = ChainConfig::new("31337", KEY).unwrap();
        let mut reg = hub.register("watcher").await.unwrap();

        let input = concat!(
            "{\"table\":\"Balance\",\"block_number\":1,\"fields\":{\"value\":1}}\n",
            "this is not json\n",
            "\n",
            "{\"table\":\"Balance\",\"block_number\":2,\"chain_id\":1,\"fields\":{\"value\":99}}\n",
            "{\"table\":\"Unrelated\",\"block_number\":3}\n",
            "{\"table\":\"Balance\",\"block_number\":4,\"chain_id\":31337,\"fields\":{\"value\":2}}\n",
        );
        let stats = EventAdapter::new(hub.clone(), &chain)
            .run_lines(input.as_bytes())
            .await
            .unwrap();
        assert_eq!(
            stats,
            AdapterStats {
                emitted: 2,
                skipped: 1,
                dropped: 2
            }
        );

        let events = hub.latest_events().await.unwrap();
        assert_eq!(
            events,
            vec![
                OffChainMessage::Balance(BalanceChange::Absolute { value: 1 }),
                OffChainMessage::Balance(BalanceChange::Absolute { value: 2 }),
            ]
        );

        let mut balances = Vec::new();
        while let Ok(Outbound::Frame(text)) = reg.outbound.try_recv() {
            if let Ok(OffChainMessage::Balance(change)) = serde_json::from_str(text.as_str()) {
                balances.push(change);
            }
        }
        assert_eq!(balances.len(), 2);
    }

    #[tokio::test]
    async fn channel_source() {
        let hub = Hub::spawn(&HubConfig::default());
        let chain = ChainConfig::new("1", KEY).unwrap();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(EventAdapter::new(hub.clone(), &chain).run_channel(rx));

        tx.send(raw(json!({"table": "Room", "block_number": 1, "key": ["r"], "fields": {"balance": 10}})))
            .await
            .unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats.emitted, 1);
        assert_eq!(hub.latest_events().await.unwrap().len(), 1);
    }
}
