//! Host name lookups off the poll thread
//!
//! Each lookup runs on its own short-lived thread. The result is sent back
//! over a channel and the poll is woken, so a slow resolver never stalls
//! input handling or other connections. Results are matched to the attempt
//! that asked for them by sequence number; anything else is discarded.

use crate::ConnectionId;
use mio::Waker;
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Host name resolution backend
pub trait Resolve: Send + Sync + 'static {
    /// Resolve `host` to the addresses to try, in order. May block.
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn resolve(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
        Ok((host, port).to_socket_addrs()?.collect())
    }
}

/// Outcome of one background lookup
#[derive(Debug)]
pub(crate) struct Resolved {
    pub(crate) id: ConnectionId,
    pub(crate) seq: u64,
    pub(crate) result: io::Result<Vec<SocketAddr>>,
}

/// Lookups in flight for one registry
pub(crate) struct Lookups {
    resolver: Arc<dyn Resolve>,
    waker: Arc<Waker>,
    tx: UnboundedSender<Resolved>,
    rx: UnboundedReceiver<Resolved>,
    next_seq: u64,
}

impl fmt::Debug for Lookups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lookups")
            .field("next_seq", &self.next_seq)
            .finish_non_exhaustive()
    }
}

impl Lookups {
    pub(crate) fn new(resolver: Arc<dyn Resolve>, waker: Arc<Waker>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            resolver,
            waker,
            tx,
            rx,
            next_seq: 0,
        }
    }

    /// Start resolving `host` for connection `id`, returning the sequence
    /// number its result will carry
    pub(crate) fn start(&mut self, id: ConnectionId, host: &str, port: u16) -> io::Result<u64> {
        let seq = self.next_seq;
        let resolver = Arc::clone(&self.resolver);
        let waker = Arc::clone(&self.waker);
        let tx = self.tx.clone();
        let host = host.to_string();

        thread::Builder::new()
            .name("ircnet-lookup".to_string())
            .spawn(move || {
                let result = resolver.resolve(&host, port);
                debug!(%host, ok = result.is_ok(), "Lookup finished");
                if tx.send(Resolved { id, seq, result }).is_err() {
                    return;
                }
                if let Err(e) = waker.wake() {
                    warn!("Failed to wake poller: {}", e);
                }
            })?;

        self.next_seq += 1;
        Ok(seq)
    }

    /// Take one finished lookup, if any
    pub(crate) fn try_recv(&mut self) -> Option<Resolved> {
        self.rx.try_recv().ok()
    }
}
