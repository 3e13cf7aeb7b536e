//! Callback contract between the connection layer and the application
//!
//! Every state change and every inbound line becomes a [`NetEvent`], queued
//! on the [`Registry`] in the order it happened. Events are handed to a
//! [`NetHandler`] by [`Registry::dispatch`] (or [`crate::Poller::poll`],
//! which dispatches at the end of each cycle).

use crate::{ConnectionId, Registry};
use std::time::Duration;

/// Application-side callbacks
///
/// Each method receives the registry so it can issue explicit directives
/// (`connect`, `disconnect`, `send`, ...). Events produced by those calls are
/// delivered within the same dispatch pass, after the current one.
pub trait NetHandler<C> {
    /// Framing or I/O error not tied to a state transition; `context` is
    /// `None` for errors on standard input
    fn on_error(&mut self, net: &mut Registry<C>, context: Option<&C>, message: &str);

    /// A connect attempt to one resolved address has started
    fn on_connecting(
        &mut self,
        net: &mut Registry<C>,
        id: ConnectionId,
        context: &C,
        message: &str,
    );

    /// The connection is established
    fn on_connected(&mut self, net: &mut Registry<C>, id: ConnectionId, context: &C, message: &str);

    /// A connect attempt failed; a retry is armed after `retry_in`
    fn on_failed(
        &mut self,
        net: &mut Registry<C>,
        id: ConnectionId,
        context: &C,
        reason: &str,
        retry_in: Duration,
    );

    /// The connection was lost or explicitly closed
    fn on_disconnected(
        &mut self,
        net: &mut Registry<C>,
        id: ConnectionId,
        context: &C,
        reason: &str,
    );

    /// Idle time on an established connection, `Duration::ZERO` once traffic resumes
    fn on_ping(&mut self, net: &mut Registry<C>, id: ConnectionId, context: &C, idle: Duration);

    /// A complete line from standard input
    fn on_input_line(&mut self, net: &mut Registry<C>, line: &[u8]);

    /// A complete line from a connection's socket
    fn on_socket_line(&mut self, net: &mut Registry<C>, id: ConnectionId, context: &C, line: &[u8]);
}

/// Queued callback with its payload
#[derive(Debug, Clone, PartialEq)]
pub enum NetEvent<C> {
    Error {
        context: Option<C>,
        message: String,
    },
    Connecting {
        id: ConnectionId,
        context: C,
        message: String,
    },
    Connected {
        id: ConnectionId,
        context: C,
        message: String,
    },
    Failed {
        id: ConnectionId,
        context: C,
        reason: String,
        retry_in: Duration,
    },
    Disconnected {
        id: ConnectionId,
        context: C,
        reason: String,
    },
    Ping {
        id: ConnectionId,
        context: C,
        idle: Duration,
    },
    InputLine(Vec<u8>),
    SocketLine {
        id: ConnectionId,
        context: C,
        line: Vec<u8>,
    },
}

impl<C> NetEvent<C> {
    /// Connection the event belongs to, if any
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            NetEvent::Connecting { id, .. }
            | NetEvent::Connected { id, .. }
            | NetEvent::Failed { id, .. }
            | NetEvent::Disconnected { id, .. }
            | NetEvent::Ping { id, .. }
            | NetEvent::SocketLine { id, .. } => Some(*id),
            NetEvent::Error { .. } | NetEvent::InputLine(_) => None,
        }
    }

    /// Short name of the callback this event maps to
    pub fn kind(&self) -> &'static str {
        match self {
            NetEvent::Error { .. } => "error",
            NetEvent::Connecting { .. } => "connecting",
            NetEvent::Connected { .. } => "connected",
            NetEvent::Failed { .. } => "failed",
            NetEvent::Disconnected { .. } => "disconnected",
            NetEvent::Ping { .. } => "ping",
            NetEvent::InputLine(_) => "input line",
            NetEvent::SocketLine { .. } => "socket line",
        }
    }

    /// Invoke the matching handler method
    pub fn dispatch<H: NetHandler<C>>(self, handler: &mut H, net: &mut Registry<C>) {
        match self {
            NetEvent::Error { context, message } => {
                handler.on_error(net, context.as_ref(), &message)
            }
            NetEvent::Connecting { id, context, message } => {
                handler.on_connecting(net, id, &context, &message)
            }
            NetEvent::Connected { id, context, message } => {
                handler.on_connected(net, id, &context, &message)
            }
            NetEvent::Failed { id, context, reason, retry_in } => {
                handler.on_failed(net, id, &context, &reason, retry_in)
            }
            NetEvent::Disconnected { id, context, reason } => {
                handler.on_disconnected(net, id, &context, &reason)
            }
            NetEvent::Ping { id, context, idle } => handler.on_ping(net, id, &context, idle),
            NetEvent::InputLine(line) => handler.on_input_line(net, &line),
            NetEvent::SocketLine { id, context, line } => {
                handler.on_socket_line(net, id, &context, &line)
            }
        }
    }
}
