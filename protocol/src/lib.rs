//! Master protocol plumbing for boomer
//!
//! This crate owns the two halves of the slave side of the Locust wire
//! contract:
//!
//! - Message tuples and their MessagePack encoding ([`message`])
//! - The DEALER-socket client that carries them ([`client`])
//!
//! The transport itself (ZMTP framing, TCP reconnection backoff) belongs to
//! the `zeromq` crate; everything here is the contract on top of it: frame
//! layout, payload encoding, buffering, and the disconnect signal.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod message;

pub use client::{ClientError, ClientHandle, InProcessMaster, MasterClient};
pub use message::{CodecError, Message, SpawnArgs, PROTOCOL_VERSION};
