//! Error types for boomer-core

use thiserror::Error;

/// Core error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (malformed rate, invalid hatch type).
    /// These refuse to start the test.
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport-level failure from the master client.
    #[error("transport error: {0}")]
    Transport(#[from] boomer_protocol::ClientError),

    /// Runner lifecycle error.
    #[error("runner error: {0}")]
    Runner(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
