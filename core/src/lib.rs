//! IRC Client Connection Layer
//!
//! This crate provides the network layer of an IRC client: a registry of
//! server connections, each driven through an explicit state machine with
//! reconnection backoff and liveness tracking, multiplexed together with
//! standard input on a single-threaded poll loop.

pub mod backoff;
pub mod buffer;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod framer;
pub mod lookup;
pub mod poller;
pub mod registry;

pub use backoff::Backoff;
pub use buffer::{Flush, SendQueue};
pub use command::{NetCommand, NetRemote};
pub use config::{
    BackoffConfig, BufferConfig, ConnectionConfig, LivenessConfig, NetConfig, PollConfig,
};
pub use connection::{Connection, ConnectionState, ConnectionStats};
pub use error::{Error, Result};
pub use event::{NetEvent, NetHandler};
pub use framer::{Framed, LineFramer, MAX_MESSAGE_LEN};
pub use lookup::{Resolve, SystemResolver};
pub use poller::Poller;
pub use registry::{ConnectionId, Registry};

/// Re-exports for convenience
pub use tracing::{debug, error, info, warn};
