//! Connection registry
//!
//! A fixed-capacity pool owning every [`Connection`]. It is the only place
//! connections are created or destroyed, and the surface the application
//! addresses for explicit directives.

use crate::connection::NetIo;
use crate::lookup::{Lookups, Resolve, SystemResolver};
use crate::poller::FIRST_SOCKET_TOKEN;
use crate::{Connection, ConnectionState, ConnectionStats, Error, NetConfig, NetEvent, NetHandler};
use crate::{Poller, Result};
use mio::Token;
use std::collections::vec_deque::Drain;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Handle to a connection in a [`Registry`]
///
/// Handles are never reused: once a connection is destroyed its handle is
/// rejected even if the slot is taken by a new connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    index: usize,
    generation: u32,
}

impl ConnectionId {
    /// Slot index within the registry
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<C> {
    generation: u32,
    connection: Option<Connection<C>>,
}

/// Capacity-bounded pool of connections
#[derive(Debug)]
pub struct Registry<C> {
    slots: Vec<Slot<C>>,
    len: usize,
    io: NetIo<C>,
    config: NetConfig,
}

impl<C: Clone> Registry<C> {
    /// Create a registry whose sockets are watched by `poller`
    pub fn new(config: NetConfig, poller: &Poller<C>) -> Result<Self> {
        Self::with_resolver(config, poller, Arc::new(SystemResolver))
    }

    /// Create a registry that looks up host names through `resolver`
    pub fn with_resolver(
        config: NetConfig,
        poller: &Poller<C>,
        resolver: Arc<dyn Resolve>,
    ) -> Result<Self> {
        config.validate()?;

        let capacity = config.connection.max_connections;
        let slots = (0..capacity)
            .map(|_| Slot {
                generation: 0,
                connection: None,
            })
            .collect();

        Ok(Self {
            slots,
            len: 0,
            io: NetIo::new(
                poller.mio_registry()?,
                FIRST_SOCKET_TOKEN,
                Lookups::new(resolver, poller.waker()),
            ),
            config,
        })
    }

    /// Allocate a new connection in the `disconnected` state
    ///
    /// Fails without side effects when the registry is full. Duplicate
    /// host/port pairs are not detected.
    pub fn create(
        &mut self,
        context: C,
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> Result<ConnectionId> {
        let Some(index) = self.slots.iter().position(|s| s.connection.is_none()) else {
            let max = self.slots.len();
            warn!("Connection limit reached ({})", max);
            return Err(Error::Capacity { max });
        };

        let slot = &mut self.slots[index];
        let id = ConnectionId {
            index,
            generation: slot.generation,
        };
        let (host, port) = (host.into(), port.into());
        debug!(%id, %host, %port, "Created connection");

        slot.connection = Some(Connection::new(id, context, host, port, &self.config));
        self.len += 1;
        Ok(id)
    }

    /// Close the connection's socket, cancel its timer and free its slot
    ///
    /// Events still queued for the connection are dropped.
    pub fn destroy(&mut self, id: ConnectionId) -> Result<()> {
        let slot = self
            .slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation && s.connection.is_some())
            .ok_or(Error::UnknownConnection(id))?;

        if let Some(mut connection) = slot.connection.take() {
            connection.close(&mut self.io);
            info!(%id, host = %connection.host(), "Destroyed connection");
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.len -= 1;
        self.io.events.retain(|event| event.connection() != Some(id));
        Ok(())
    }

    /// Explicit connect, valid from `disconnected` or `reconnecting`
    pub fn connect(&mut self, id: ConnectionId) -> Result<()> {
        let now = Instant::now();
        let (connection, io) = self.split_mut(id)?;
        connection.connect(io, now)
    }

    /// Explicit disconnect; succeeds from every state
    pub fn disconnect(&mut self, id: ConnectionId) -> Result<()> {
        let (connection, io) = self.split_mut(id)?;
        connection.disconnect(io);
        Ok(())
    }

    /// Queue a message on an established connection
    ///
    /// The message must fit in one protocol line; CRLF is appended.
    /// Delivery happens as the socket accepts data.
    pub fn send(&mut self, id: ConnectionId, message: impl fmt::Display) -> Result<()> {
        let now = Instant::now();
        let message = message.to_string();
        let (connection, io) = self.split_mut(id)?;
        connection.send(io, now, &message)
    }

    /// Look up a connection
    pub fn get(&self, id: ConnectionId) -> Option<&Connection<C>> {
        self.slots
            .get(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.connection.as_ref())
    }

    /// Current state of a connection
    pub fn state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.get(id).map(|c| c.state())
    }

    /// Application context of a connection
    pub fn context(&self, id: ConnectionId) -> Option<&C> {
        self.get(id).map(|c| c.context())
    }

    /// Traffic statistics of a connection
    pub fn stats(&self, id: ConnectionId) -> Option<&ConnectionStats> {
        self.get(id).map(|c| c.stats())
    }

    /// All live connections in slot order
    pub fn iter(&self) -> impl Iterator<Item = &Connection<C>> {
        self.slots.iter().filter_map(|s| s.connection.as_ref())
    }

    /// Number of live connections
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of connections
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Number of events waiting for dispatch
    pub fn pending_events(&self) -> usize {
        self.io.events.len()
    }

    /// Take queued events without dispatching them
    pub fn drain_events(&mut self) -> Drain<'_, NetEvent<C>> {
        self.io.events.drain(..)
    }

    /// Hand every queued event to `handler`, including events raised by
    /// the handler itself, and return how many were delivered
    pub fn dispatch<H: NetHandler<C>>(&mut self, handler: &mut H) -> usize {
        let mut delivered = 0;
        while let Some(event) = self.io.events.pop_front() {
            event.dispatch(handler, self);
            delivered += 1;
        }
        delivered
    }

    pub(crate) fn push_event(&mut self, event: NetEvent<C>) {
        self.io.emit(event);
    }

    /// Route socket readiness to the owning connection; stale tokens are ignored
    pub(crate) fn handle_ready(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
        now: Instant,
    ) {
        let Some(&id) = self.io.tokens.get(&token) else {
            debug!(token = token.0, "Ignoring readiness for closed socket");
            return;
        };

        if let Ok((connection, io)) = self.split_mut(id) {
            connection.on_ready(io, now, readable, writable);
        }
    }

    /// Hand finished host lookups to the connections waiting for them
    pub(crate) fn complete_lookups(&mut self, now: Instant) {
        while let Some(resolved) = self.io.lookups.try_recv() {
            match self.split_mut(resolved.id) {
                Ok((connection, io)) => {
                    connection.resolved(io, now, resolved.seq, resolved.result)
                }
                Err(_) => debug!(id = %resolved.id, "Lookup finished for destroyed connection"),
            }
        }
    }

    /// Run timer driven transitions on every connection
    pub(crate) fn tick(&mut self, now: Instant) {
        let io = &mut self.io;
        for connection in self.slots.iter_mut().filter_map(|s| s.connection.as_mut()) {
            connection.tick(io, now);
        }
    }

    /// Earliest timer across all connections
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.iter().filter_map(|c| c.next_deadline()).min()
    }

    fn split_mut(&mut self, id: ConnectionId) -> Result<(&mut Connection<C>, &mut NetIo<C>)> {
        let connection = self
            .slots
            .get_mut(id.index)
            .filter(|s| s.generation == id.generation)
            .and_then(|s| s.connection.as_mut())
            .ok_or(Error::UnknownConnection(id))?;
        Ok((connection, &mut self.io))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetConfig;

    fn registry(max_connections: usize) -> (Poller<u32>, Registry<u32>) {
        let mut config = NetConfig::default();
        config.connection.max_connections = max_connections;
        config.poll.watch_stdin = false;
        let poller = Poller::new(&config).unwrap();
        let registry = Registry::new(config, &poller).unwrap();
        (poller, registry)
    }

    #[test]
    fn test_capacity_refused() {
        let (_poller, mut registry) = registry(1);

        let first = registry.create(1, "irc.example.org", "6667").unwrap();
        let second = registry.create(2, "irc.example.org", "6667");

        assert!(matches!(second, Err(Error::Capacity { max: 1 })));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.capacity(), 1);
        assert_eq!(registry.state(first), Some(ConnectionState::Disconnected));
        assert_eq!(registry.context(first), Some(&1));
    }

    #[test]
    fn test_destroy_frees_slot() {
        let (_poller, mut registry) = registry(1);

        let first = registry.create(1, "irc.example.org", "6667").unwrap();
        registry.destroy(first).unwrap();
        assert!(registry.is_empty());

        let second = registry.create(2, "irc.example.org", "6697").unwrap();
        assert_eq!(second.index(), first.index());
        assert_ne!(second, first);

        // the old handle stays dead after slot reuse
        assert!(registry.get(first).is_none());
        assert!(matches!(registry.connect(first), Err(Error::UnknownConnection(_))));
        assert!(matches!(registry.destroy(first), Err(Error::UnknownConnection(_))));
        assert_eq!(registry.get(second).map(|c| c.port()), Some("6697"));
    }

    #[test]
    fn test_disconnect_idempotent() {
        let (_poller, mut registry) = registry(2);
        let id = registry.create(7, "irc.example.org", "6667").unwrap();

        assert!(registry.disconnect(id).is_ok());
        assert!(registry.disconnect(id).is_ok());
        assert_eq!(registry.state(id), Some(ConnectionState::Disconnected));
        assert_eq!(registry.pending_events(), 0);
    }

    #[test]
    fn test_send_requires_connection() {
        let (_poller, mut registry) = registry(2);
        let id = registry.create(7, "irc.example.org", "6667").unwrap();

        let result = registry.send(id, "NICK alice");
        assert!(matches!(
            result,
            Err(Error::NotConnected { state: ConnectionState::Disconnected })
        ));
    }

    #[test]
    fn test_invalid_port_fails_into_backoff() {
        let (_poller, mut registry) = registry(2);
        let id = registry.create(7, "127.0.0.1", "not-a-port").unwrap();

        registry.connect(id).unwrap();
        assert_eq!(registry.state(id), Some(ConnectionState::Reconnecting));

        let kinds: Vec<_> = registry.drain_events().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["connecting", "failed"]);
        assert!(!registry.get(id).unwrap().has_socket());
        assert!(registry.get(id).unwrap().retry_at().is_some());
    }

    #[test]
    fn test_destroy_drops_queued_events() {
        let (_poller, mut registry) = registry(2);
        let kept = registry.create(1, "127.0.0.1", "not-a-port").unwrap();
        let gone = registry.create(2, "127.0.0.1", "not-a-port").unwrap();

        registry.connect(kept).unwrap();
        registry.connect(gone).unwrap();
        assert_eq!(registry.pending_events(), 4);

        registry.destroy(gone).unwrap();
        let owners: Vec<_> = registry.drain_events().map(|e| e.connection()).collect();
        assert_eq!(owners, vec![Some(kept), Some(kept)]);
    }
}
