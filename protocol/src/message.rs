//! Message tuples exchanged with the master
//!
//! A message is the tuple `(type, data, node_id)`. On the wire it is a
//! 3-element MessagePack array in a single frame; `data` is an arbitrary map
//! (or nil) whose schema depends on the message type.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Protocol version advertised in `client_ready`.
///
/// The master treats a `client_ready` as a fresh registration regardless of
/// version; the field exists so a future master can reject stale slaves.
pub const PROTOCOL_VERSION: i64 = 1;

/// Message type strings, slave -> master.
pub mod outbound {
    /// Registration hello, sent on connect and on re-entry from `missing`.
    pub const CLIENT_READY: &str = "client_ready";
    /// Sent after a `stop` has been honored.
    pub const CLIENT_STOPPED: &str = "client_stopped";
    /// Liveness beacon with state and CPU usage.
    pub const HEARTBEAT: &str = "heartbeat";
    /// All requested workers are up.
    pub const SPAWNING_COMPLETE: &str = "spawning_complete";
    /// Aggregated report window.
    pub const STATS: &str = "stats";
    /// Final goodbye.
    pub const QUIT: &str = "quit";
}

/// Message type strings, master -> slave.
pub mod inbound {
    /// Bring the worker count to a target.
    pub const SPAWN: &str = "spawn";
    /// Stop all workers, keep the session.
    pub const STOP: &str = "stop";
    /// Terminate the slave.
    pub const QUIT: &str = "quit";
    /// Re-register with the master.
    pub const RECONNECT: &str = "reconnect";
    /// Acknowledgement of a registration.
    pub const ACK: &str = "ack";
}

/// Errors produced by the codec.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The payload is not a well-formed message tuple.
    #[error("decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// A `(type, data, node_id)` tuple.
///
/// Serialized positionally, so the wire form is a MessagePack array of
/// exactly three elements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Message type, one of the [`inbound`]/[`outbound`] strings.
    pub typ: String,
    /// Type-dependent payload map, `None` when the type alone suffices.
    pub data: Option<Value>,
    /// Identity of the sending node.
    pub node_id: String,
}

impl Message {
    /// Create a message from raw parts.
    pub fn new(typ: impl Into<String>, data: Option<Value>, node_id: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            data,
            node_id: node_id.into(),
        }
    }

    /// Registration hello carrying the protocol version.
    pub fn client_ready(node_id: &str) -> Self {
        Self::new(
            outbound::CLIENT_READY,
            Some(json!({ "version": PROTOCOL_VERSION })),
            node_id,
        )
    }

    /// Acknowledge a `stop`.
    pub fn client_stopped(node_id: &str) -> Self {
        Self::new(outbound::CLIENT_STOPPED, None, node_id)
    }

    /// Liveness beacon. `state` is the runner state string, `cpu_usage` is a
    /// percentage in `[0, 100]`.
    pub fn heartbeat(node_id: &str, state: &str, cpu_usage: f64) -> Self {
        Self::new(
            outbound::HEARTBEAT,
            Some(json!({ "state": state, "current_cpu_usage": cpu_usage })),
            node_id,
        )
    }

    /// All requested workers are up.
    pub fn spawning_complete(node_id: &str, user_count: u64) -> Self {
        Self::new(
            outbound::SPAWNING_COMPLETE,
            Some(json!({ "user_count": user_count })),
            node_id,
        )
    }

    /// Wrap an already-serialized report window.
    pub fn stats(node_id: &str, report: Value) -> Self {
        Self::new(outbound::STATS, Some(report), node_id)
    }

    /// Final goodbye.
    pub fn quit(node_id: &str) -> Self {
        Self::new(outbound::QUIT, None, node_id)
    }

    /// Whether this is a heartbeat. Heartbeats are the one message class the
    /// send queue never sheds under overflow.
    pub fn is_heartbeat(&self) -> bool {
        self.typ == outbound::HEARTBEAT
    }

    /// Encode to a single MessagePack frame.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec(self)?)
    }

    /// Decode from a single MessagePack frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

/// Arguments of an inbound `spawn` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnArgs {
    /// Target number of active virtual users.
    pub user_count: u64,
    /// Users to start per second; zero means all at once.
    #[serde(default)]
    pub spawn_rate: f64,
    /// Optional target host override, passed through to user code.
    #[serde(default)]
    pub host: Option<String>,
}

impl SpawnArgs {
    /// Parse the `data` map of a `spawn` message.
    pub fn from_data(data: Option<Value>) -> Result<Self, CodecError> {
        let value = data.unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|e| {
            CodecError::Decode(rmp_serde::decode::Error::Uncategorized(e.to_string()))
        })
    }
}
