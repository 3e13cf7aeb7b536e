//! Connection state machine
//!
//! ```text
//!  from          event                         to
//!  ----          -----                         --
//!  dxed, rxng    connect / retry timer         cxng   (connecting)
//!  cxng          lookup done, next address     cxng   (connecting)
//!  cxng          handshake complete            cxed   (connected)
//!  cxng          lookup or all addresses       rxng   (failed)
//!                failed, timeout
//!  cxed, ping    read/write error, peer close  cxng   (disconnected, connecting)
//!  ping          ping timeout                  cxng   (disconnected, connecting)
//!  cxed          idle past threshold           ping   (ping)
//!  ping          inbound data                  cxed   (ping 0)
//!  any but dxed  disconnect                    dxed   (disconnected)
//! ```
//!
//! `connect` and `disconnect` are the only explicit transitions. Everything
//! else is driven by the [`crate::Poller`] through socket readiness and
//! timer expiry, and reported as a [`NetEvent`].

use crate::backoff::Backoff;
use crate::buffer::{Flush, SendQueue};
use crate::config::NetConfig;
use crate::framer::{Framed, LineFramer};
use crate::lookup::Lookups;
use crate::{ConnectionId, Error, NetEvent, Result};
use chrono::{DateTime, Utc};
use mio::net::TcpStream;
use mio::{Interest, Registry as MioRegistry, Token};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::io::{self, ErrorKind, Read};
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Bytes read from a socket per `read` call
const READ_CHUNK: usize = 4096;

/// Longest timer that gets armed; keeps `Instant` arithmetic in range
const MAX_TIMER: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No socket, nothing scheduled
    Disconnected,
    /// No socket, retry timer armed
    Reconnecting,
    /// Host lookup or socket connect in progress
    Connecting,
    /// Socket connected
    Connected,
    /// Socket connected but idle past the liveness threshold
    Degraded,
}

impl ConnectionState {
    /// Whether a socket can be owned in this state; `connecting` owns none
    /// while its host name is being resolved
    pub fn has_socket(self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::Connected | ConnectionState::Degraded
        )
    }

    /// Whether the link is established
    pub fn is_established(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Degraded)
    }

    /// Short form used in logs
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "dxed",
            ConnectionState::Reconnecting => "rxng",
            ConnectionState::Connecting => "cxng",
            ConnectionState::Connected => "cxed",
            ConnectionState::Degraded => "ping",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Connection statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionStats {
    /// Bytes received
    pub bytes_received: u64,
    /// Bytes sent
    pub bytes_sent: u64,
    /// Complete lines received
    pub lines_received: u64,
    /// Messages queued for sending
    pub lines_sent: u64,
    /// When the current link was established
    pub connected_at: Option<DateTime<Utc>>,
    /// When the last connect attempt failed
    pub last_failure: Option<DateTime<Utc>>,
}

/// An open socket and its registration
#[derive(Debug)]
pub(crate) struct Socket {
    stream: TcpStream,
    token: Token,
    peer: SocketAddr,
    interest: Interest,
}

/// Shared plumbing every connection needs to resolve, open sockets and
/// emit events
#[derive(Debug)]
pub(crate) struct NetIo<C> {
    registry: MioRegistry,
    next_token: usize,
    pub(crate) tokens: FxHashMap<Token, ConnectionId>,
    pub(crate) events: VecDeque<NetEvent<C>>,
    pub(crate) lookups: Lookups,
}

impl<C> NetIo<C> {
    pub(crate) fn new(registry: MioRegistry, first_token: usize, lookups: Lookups) -> Self {
        Self {
            registry,
            next_token: first_token,
            tokens: FxHashMap::default(),
            events: VecDeque::new(),
            lookups,
        }
    }

    pub(crate) fn emit(&mut self, event: NetEvent<C>) {
        self.events.push_back(event);
    }

    /// Start a non-blocking connect and register the socket under a fresh token
    fn open(&mut self, id: ConnectionId, addr: SocketAddr) -> io::Result<Socket> {
        let mut stream = TcpStream::connect(addr)?;
        let token = Token(self.next_token);
        let interest = Interest::READABLE | Interest::WRITABLE;
        self.registry.register(&mut stream, token, interest)?;
        self.next_token += 1;
        self.tokens.insert(token, id);

        Ok(Socket {
            stream,
            token,
            peer: addr,
            interest,
        })
    }

    fn close(&mut self, mut socket: Socket) {
        self.tokens.remove(&socket.token);
        if let Err(e) = self.registry.deregister(&mut socket.stream) {
            warn!("Failed to deregister socket for {}: {}", socket.peer, e);
        }
    }

    fn set_interest(&self, socket: &mut Socket, interest: Interest) -> io::Result<()> {
        if socket.interest != interest {
            self.registry
                .reregister(&mut socket.stream, socket.token, interest)?;
            socket.interest = interest;
        }
        Ok(())
    }
}

/// One remote endpoint and its lifecycle
#[derive(Debug)]
pub struct Connection<C> {
    id: ConnectionId,
    context: C,
    host: String,
    port: String,
    state: ConnectionState,
    socket: Option<Socket>,
    /// Resolved addresses not yet tried in the current attempt
    addrs: VecDeque<SocketAddr>,
    /// Sequence number of the lookup this attempt waits for
    lookup: Option<u64>,
    /// Start of the current connect attempt
    attempt_started: Option<Instant>,
    /// Armed retry timer, only while reconnecting
    retry_at: Option<Instant>,
    backoff: Backoff,
    framer: LineFramer,
    sendq: SendQueue,
    last_activity: Instant,
    /// Last ping notification while degraded
    ping_noticed: Option<Instant>,
    connect_timeout: Duration,
    ping_threshold: Duration,
    ping_refresh: Duration,
    ping_timeout: Duration,
    stats: ConnectionStats,
}

impl<C: Clone> Connection<C> {
    pub(crate) fn new(
        id: ConnectionId,
        context: C,
        host: String,
        port: String,
        config: &NetConfig,
    ) -> Self {
        Self {
            id,
            context,
            host,
            port,
            state: ConnectionState::Disconnected,
            socket: None,
            addrs: VecDeque::new(),
            lookup: None,
            attempt_started: None,
            retry_at: None,
            backoff: Backoff::from_config(&config.backoff),
            framer: LineFramer::new(config.buffers.max_line_length),
            sendq: SendQueue::new(config.buffers.sendq_max),
            last_activity: Instant::now(),
            ping_noticed: None,
            connect_timeout: config.connection.connect_timeout(),
            ping_threshold: config.liveness.ping_threshold(),
            ping_refresh: config.liveness.ping_refresh(),
            ping_timeout: config.liveness.ping_timeout(),
            stats: ConnectionStats::default(),
        }
    }

    /// Explicit connect, valid from `disconnected` or `reconnecting`
    pub(crate) fn connect(&mut self, io: &mut NetIo<C>, now: Instant) -> Result<()> {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {}
            state => {
                return Err(Error::InvalidTransition {
                    state,
                    operation: "connect",
                })
            }
        }

        self.retry_at = None;
        self.begin_attempt(io, now);
        Ok(())
    }

    /// Explicit disconnect, a no-op when already disconnected
    pub(crate) fn disconnect(&mut self, io: &mut NetIo<C>) {
        if self.state == ConnectionState::Disconnected {
            return;
        }

        self.teardown(io);
        self.retry_at = None;
        self.backoff.reset();
        self.transition(ConnectionState::Disconnected);
        info!(host = %self.host, port = %self.port, "Disconnected");
        io.emit(NetEvent::Disconnected {
            id: self.id,
            context: self.context.clone(),
            reason: "Disconnected".to_string(),
        });
    }

    /// Release every resource without emitting anything
    pub(crate) fn close(&mut self, io: &mut NetIo<C>) {
        self.teardown(io);
        self.retry_at = None;
        self.state = ConnectionState::Disconnected;
    }

    /// Queue one formatted message, CRLF appended
    pub(crate) fn send(&mut self, io: &mut NetIo<C>, now: Instant, message: &str) -> Result<()> {
        if !self.state.is_established() {
            return Err(Error::NotConnected { state: self.state });
        }

        let content = message
            .strip_suffix("\r\n")
            .or_else(|| message.strip_suffix('\n'))
            .unwrap_or(message);
        let max = self.framer.max_line();
        if content.len() > max {
            return Err(Error::MessageTooLong {
                len: content.len(),
                max,
            });
        }

        let mut line = Vec::with_capacity(content.len() + 2);
        line.extend_from_slice(content.as_bytes());
        line.extend_from_slice(b"\r\n");

        if !self.sendq.push(&line) {
            return Err(Error::SendQueueFull {
                queued: self.sendq.len(),
                max: self.sendq.max_size(),
            });
        }
        self.stats.lines_sent += 1;
        self.flush(io, now);
        Ok(())
    }

    /// Socket readiness reported by the poller
    pub(crate) fn on_ready(
        &mut self,
        io: &mut NetIo<C>,
        now: Instant,
        readable: bool,
        writable: bool,
    ) {
        if self.state == ConnectionState::Connecting {
            self.check_connect(io, now);
            if self.state != ConnectionState::Connected || !readable {
                return;
            }
        }

        if !self.state.is_established() {
            return;
        }

        if readable {
            self.read(io, now);
        }
        if writable && self.state.is_established() {
            self.flush(io, now);
        }
    }

    /// Timer driven transitions: retry expiry, connect timeout, liveness
    pub(crate) fn tick(&mut self, io: &mut NetIo<C>, now: Instant) {
        match self.state {
            ConnectionState::Reconnecting => {
                if self.retry_at.is_some_and(|at| at <= now) {
                    debug!(host = %self.host, port = %self.port, "Retry timer expired");
                    self.retry_at = None;
                    self.begin_attempt(io, now);
                }
            }
            ConnectionState::Connecting => {
                let timeout = self.connect_timeout;
                let expired = self
                    .attempt_started
                    .is_some_and(|started| now.saturating_duration_since(started) >= timeout);
                if expired {
                    self.addrs.clear();
                    self.fail(io, now, "Connection timed out".to_string());
                }
            }
            ConnectionState::Connected | ConnectionState::Degraded => self.check_liveness(io, now),
            ConnectionState::Disconnected => {}
        }
    }

    /// Compare idle time against the liveness thresholds
    pub(crate) fn check_liveness(&mut self, io: &mut NetIo<C>, now: Instant) {
        let idle = now.saturating_duration_since(self.last_activity);

        match self.state {
            ConnectionState::Connected if idle >= self.ping_threshold => {
                self.transition(ConnectionState::Degraded);
                self.notify_ping(io, now, idle);
            }
            ConnectionState::Degraded if idle >= self.ping_timeout => {
                self.lost(io, now, format!("Ping timeout ({}s)", idle.as_secs()));
            }
            ConnectionState::Degraded => {
                let refresh = self.ping_refresh;
                let refresh_due = self
                    .ping_noticed
                    .map_or(true, |at| now.saturating_duration_since(at) >= refresh);
                if refresh_due {
                    self.notify_ping(io, now, idle);
                }
            }
            _ => {}
        }
    }

    /// Earliest instant at which [`Connection::tick`] has work to do
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        match self.state {
            ConnectionState::Disconnected => None,
            ConnectionState::Reconnecting => self.retry_at,
            ConnectionState::Connecting => self.attempt_started.map(|t| t + self.connect_timeout),
            ConnectionState::Connected => Some(self.last_activity + self.ping_threshold),
            ConnectionState::Degraded => {
                let timeout = self.last_activity + self.ping_timeout;
                let refresh = self.ping_noticed.map(|t| t + self.ping_refresh);
                Some(refresh.map_or(timeout, |r| r.min(timeout)))
            }
        }
    }

    /// Start an attempt: literal addresses connect right away, host names
    /// are handed to a background lookup
    fn begin_attempt(&mut self, io: &mut NetIo<C>, now: Instant) {
        self.transition(ConnectionState::Connecting);
        self.attempt_started = Some(now);

        let Ok(port) = self.port.parse::<u16>() else {
            self.notify_connecting(io);
            let error = Error::Resolve(format!("{}: invalid port '{}'", self.host, self.port));
            self.fail(io, now, error.to_string());
            return;
        };

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            self.addrs = VecDeque::from([SocketAddr::new(ip, port)]);
            self.try_next_addr(io, now, None);
            return;
        }

        self.notify_connecting(io);
        match io.lookups.start(self.id, &self.host, port) {
            Ok(seq) => {
                debug!(host = %self.host, seq, "Resolving");
                self.lookup = Some(seq);
            }
            Err(e) => self.fail(io, now, format!("Failed to start lookup: {}", e)),
        }
    }

    /// Background lookup finished; stale results are ignored
    pub(crate) fn resolved(
        &mut self,
        io: &mut NetIo<C>,
        now: Instant,
        seq: u64,
        result: io::Result<Vec<SocketAddr>>,
    ) {
        if self.state != ConnectionState::Connecting || self.lookup != Some(seq) {
            debug!(host = %self.host, seq, "Ignoring stale lookup");
            return;
        }
        self.lookup = None;

        match result {
            Ok(addrs) if !addrs.is_empty() => {
                debug!(host = %self.host, count = addrs.len(), "Resolved addresses");
                self.addrs = addrs.into();
                self.try_next_addr(io, now, None);
            }
            Ok(_) => {
                let error =
                    Error::Resolve(format!("{} port {}: no addresses", self.host, self.port));
                self.fail(io, now, error.to_string());
            }
            Err(e) => {
                let error = Error::Resolve(format!("{} port {}: {}", self.host, self.port, e));
                self.fail(io, now, error.to_string());
            }
        }
    }

    fn notify_connecting(&self, io: &mut NetIo<C>) {
        io.emit(NetEvent::Connecting {
            id: self.id,
            context: self.context.clone(),
            message: format!("Connecting to '{}' port {}", self.host, self.port),
        });
    }

    /// Open a socket to the next untried address, failing the attempt when
    /// none is left
    fn try_next_addr(&mut self, io: &mut NetIo<C>, now: Instant, mut last_error: Option<String>) {
        while let Some(addr) = self.addrs.pop_front() {
            io.emit(NetEvent::Connecting {
                id: self.id,
                context: self.context.clone(),
                message: format!(
                    "Connecting to '{}' ({}) port {}",
                    self.host,
                    addr.ip(),
                    self.port
                ),
            });

            match io.open(self.id, addr) {
                Ok(socket) => {
                    debug!(host = %self.host, %addr, token = socket.token.0, "Connect in progress");
                    self.socket = Some(socket);
                    return;
                }
                Err(e) => {
                    warn!(host = %self.host, %addr, "Connect failed: {}", e);
                    last_error = Some(e.to_string());
                }
            }
        }

        let reason = last_error.unwrap_or_else(|| "No addresses to connect to".to_string());
        self.fail(io, now, reason);
    }

    fn check_connect(&mut self, io: &mut NetIo<C>, now: Instant) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        let outcome = match socket.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => match socket.stream.peer_addr() {
                Ok(_) => Ok(()),
                // spurious wakeup, the handshake is still in flight
                Err(e) if e.kind() == ErrorKind::NotConnected => return,
                Err(e) => Err(e),
            },
        };

        match outcome {
            Ok(()) => self.established(io, now),
            Err(e) => {
                let peer = socket.peer;
                warn!(host = %self.host, %peer, "Connect failed: {}", e);
                if let Some(socket) = self.socket.take() {
                    io.close(socket);
                }
                self.try_next_addr(io, now, Some(e.to_string()));
            }
        }
    }

    fn established(&mut self, io: &mut NetIo<C>, now: Instant) {
        self.addrs.clear();
        self.attempt_started = None;
        self.backoff.reset();
        self.last_activity = now;
        self.ping_noticed = None;
        self.stats.connected_at = Some(Utc::now());

        let peer = self.socket.as_ref().map(|s| s.peer);
        if let Some(socket) = self.socket.as_mut() {
            if let Err(e) = io.set_interest(socket, Interest::READABLE) {
                self.lost(io, now, format!("Failed to watch socket: {}", e));
                return;
            }
        }

        self.transition(ConnectionState::Connected);
        info!(host = %self.host, port = %self.port, ?peer, "Connected");
        io.emit(NetEvent::Connected {
            id: self.id,
            context: self.context.clone(),
            message: format!("Connected to '{}' port {}", self.host, self.port),
        });
    }

    /// Connect attempt exhausted: back off and arm the retry timer
    fn fail(&mut self, io: &mut NetIo<C>, now: Instant, reason: String) {
        self.teardown(io);

        let retry_in = self.backoff.next_delay();
        self.retry_at = Some(now + retry_in.min(MAX_TIMER));
        self.stats.last_failure = Some(Utc::now());
        self.transition(ConnectionState::Reconnecting);

        warn!(
            host = %self.host,
            port = %self.port,
            attempt = self.backoff.attempts(),
            "Connection failed: {}, retrying in {:?}",
            reason,
            retry_in
        );
        io.emit(NetEvent::Failed {
            id: self.id,
            context: self.context.clone(),
            reason,
            retry_in,
        });
    }

    /// Established link dropped: report it and reconnect immediately
    fn lost(&mut self, io: &mut NetIo<C>, now: Instant, reason: String) {
        self.teardown(io);

        warn!(host = %self.host, port = %self.port, "Connection lost: {}", reason);
        io.emit(NetEvent::Disconnected {
            id: self.id,
            context: self.context.clone(),
            reason,
        });

        self.begin_attempt(io, now);
    }

    fn read(&mut self, io: &mut NetIo<C>, now: Instant) {
        let mut buf = [0u8; READ_CHUNK];

        loop {
            let Some(socket) = self.socket.as_mut() else {
                return;
            };

            match socket.stream.read(&mut buf) {
                Ok(0) => {
                    self.lost(io, now, "Connection closed by peer".to_string());
                    return;
                }
                Ok(n) => {
                    self.stats.bytes_received += n as u64;
                    self.last_activity = now;
                    if self.state == ConnectionState::Degraded {
                        self.transition(ConnectionState::Connected);
                        self.ping_noticed = None;
                        io.emit(NetEvent::Ping {
                            id: self.id,
                            context: self.context.clone(),
                            idle: Duration::ZERO,
                        });
                    }
                    self.deliver(io, &buf[..n]);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.lost(io, now, format!("Read error: {}", e));
                    return;
                }
            }
        }
    }

    fn deliver(&mut self, io: &mut NetIo<C>, data: &[u8]) {
        for framed in self.framer.feed(data) {
            match framed {
                Framed::Line(line) => {
                    self.stats.lines_received += 1;
                    io.emit(NetEvent::SocketLine {
                        id: self.id,
                        context: self.context.clone(),
                        line,
                    });
                }
                Framed::Overflow { discarded } => {
                    let error = Error::Framing {
                        len: discarded,
                        max: self.framer.max_line(),
                    };
                    warn!(host = %self.host, "{}", error);
                    io.emit(NetEvent::Error {
                        context: Some(self.context.clone()),
                        message: error.to_string(),
                    });
                }
            }
        }
    }

    fn flush(&mut self, io: &mut NetIo<C>, now: Instant) {
        let Some(socket) = self.socket.as_mut() else {
            return;
        };

        let flushed = match self.sendq.flush_to(&mut socket.stream) {
            Ok(flushed) => flushed,
            Err(e) => {
                self.lost(io, now, format!("Write error: {}", e));
                return;
            }
        };

        self.stats.bytes_sent += flushed.written() as u64;
        let interest = match flushed {
            Flush::Drained { .. } => Interest::READABLE,
            Flush::Pending { .. } => Interest::READABLE | Interest::WRITABLE,
        };

        if let Err(e) = io.set_interest(socket, interest) {
            self.lost(io, now, format!("Failed to watch socket: {}", e));
        }
    }

    fn notify_ping(&mut self, io: &mut NetIo<C>, now: Instant, idle: Duration) {
        self.ping_noticed = Some(now);
        debug!(host = %self.host, idle = idle.as_secs(), "No activity");
        io.emit(NetEvent::Ping {
            id: self.id,
            context: self.context.clone(),
            idle,
        });
    }

    /// Close the socket and drop per-link buffers
    fn teardown(&mut self, io: &mut NetIo<C>) {
        if let Some(socket) = self.socket.take() {
            io.close(socket);
        }
        self.addrs.clear();
        self.lookup = None;
        self.attempt_started = None;
        self.ping_noticed = None;
        self.framer.clear();
        self.sendq.clear();
        self.stats.connected_at = None;
    }

    fn transition(&mut self, to: ConnectionState) {
        if self.state != to {
            let (old, new) = (self.state.as_str(), to.as_str());
            debug!(host = %self.host, port = %self.port, "{} -> {}", old, new);
        }
        self.state = to;
    }
}

impl<C> Connection<C> {
    /// Registry handle of this connection
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Application context relayed with every event
    pub fn context(&self) -> &C {
        &self.context
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Failed attempts since the last successful connection
    pub fn attempts(&self) -> u32 {
        self.backoff.attempts()
    }

    /// When the armed retry fires
    pub fn retry_at(&self) -> Option<Instant> {
        self.retry_at
    }

    /// Address of the socket currently open, if any
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().map(|s| s.peer)
    }

    /// Whether the attempt is still waiting on a host lookup
    pub fn is_resolving(&self) -> bool {
        self.lookup.is_some()
    }

    /// Whether a socket is currently owned
    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    /// Bytes waiting to be written
    pub fn queued_bytes(&self) -> usize {
        self.sendq.len()
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_socket_ownership() {
        assert!(!ConnectionState::Disconnected.has_socket());
        assert!(!ConnectionState::Reconnecting.has_socket());
        assert!(ConnectionState::Connecting.has_socket());
        assert!(ConnectionState::Connected.has_socket());
        assert!(ConnectionState::Degraded.has_socket());
    }

    #[test]
    fn test_state_names() {
        assert_eq!(ConnectionState::Degraded.as_str(), "ping");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }
}
