//! Error types for the connection layer

use crate::{ConnectionId, ConnectionState};
use thiserror::Error;

/// Main error type for the connection layer
///
/// Only synchronous, rejected calls surface as an `Error`. Network failures
/// on a live connection are reported through [`crate::NetEvent`]s instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Connection limit reached ({max})")]
    Capacity { max: usize },

    #[error("Cannot {operation} while {state}")]
    InvalidTransition {
        state: ConnectionState,
        operation: &'static str,
    },

    #[error("Unknown connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("Not connected ({state})")]
    NotConnected { state: ConnectionState },

    #[error("Message too long ({len} > {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("Send queue full ({queued}/{max})")]
    SendQueueFull { queued: usize, max: usize },

    #[error("Line exceeds {max} bytes ({len} buffered), discarding")]
    Framing { len: usize, max: usize },

    #[error("Failed to resolve {0}")]
    Resolve(String),

    #[error("Command channel error: {0}")]
    Channel(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
