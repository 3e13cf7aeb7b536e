//! Directives issued from outside the poll thread
//!
//! A [`NetRemote`] queues [`NetCommand`]s and wakes the poll; the poller
//! applies them against its [`Registry`] at the start of the next cycle and
//! again right after waking.

use crate::{ConnectionId, Error, Registry, Result};
use mio::Waker;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc::UnboundedSender, oneshot};
use tracing::debug;

/// Reply channel for a directive's outcome
pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Registry directive with its reply channel
#[derive(Debug)]
pub enum NetCommand<C> {
    Create {
        context: C,
        host: String,
        port: String,
        reply: Reply<ConnectionId>,
    },
    Connect {
        id: ConnectionId,
        reply: Reply<()>,
    },
    Disconnect {
        id: ConnectionId,
        reply: Reply<()>,
    },
    Send {
        id: ConnectionId,
        message: String,
        reply: Reply<()>,
    },
    Destroy {
        id: ConnectionId,
        reply: Reply<()>,
    },
}

impl<C> NetCommand<C> {
    /// Short name of the directive
    pub fn name(&self) -> &'static str {
        match self {
            NetCommand::Create { .. } => "create",
            NetCommand::Connect { .. } => "connect",
            NetCommand::Disconnect { .. } => "disconnect",
            NetCommand::Send { .. } => "send",
            NetCommand::Destroy { .. } => "destroy",
        }
    }
}

impl<C: Clone> NetCommand<C> {
    /// Run the directive and report its outcome to the caller
    pub(crate) fn apply(self, registry: &mut Registry<C>) {
        let name = self.name();
        let delivered = match self {
            NetCommand::Create {
                context,
                host,
                port,
                reply,
            } => reply.send(registry.create(context, host, port)).is_ok(),
            NetCommand::Connect { id, reply } => reply.send(registry.connect(id)).is_ok(),
            NetCommand::Disconnect { id, reply } => reply.send(registry.disconnect(id)).is_ok(),
            NetCommand::Send { id, message, reply } => {
                reply.send(registry.send(id, message)).is_ok()
            }
            NetCommand::Destroy { id, reply } => reply.send(registry.destroy(id)).is_ok(),
        };

        if !delivered {
            debug!(command = name, "Caller dropped reply");
        }
    }
}

/// Thread-safe handle queueing directives for a [`crate::Poller`]
pub struct NetRemote<C> {
    tx: UnboundedSender<NetCommand<C>>,
    waker: Arc<Waker>,
}

impl<C> Clone for NetRemote<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            waker: Arc::clone(&self.waker),
        }
    }
}

impl<C> fmt::Debug for NetRemote<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetRemote")
            .field("closed", &self.tx.is_closed())
            .finish()
    }
}

impl<C> NetRemote<C> {
    pub(crate) fn new(tx: UnboundedSender<NetCommand<C>>, waker: Arc<Waker>) -> Self {
        Self { tx, waker }
    }

    /// Queue a `create`; the receiver yields the new handle
    pub fn create(
        &self,
        context: C,
        host: impl Into<String>,
        port: impl Into<String>,
    ) -> Result<oneshot::Receiver<Result<ConnectionId>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(NetCommand::Create {
            context,
            host: host.into(),
            port: port.into(),
            reply,
        })?;
        Ok(rx)
    }

    pub fn connect(&self, id: ConnectionId) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(NetCommand::Connect { id, reply })?;
        Ok(rx)
    }

    pub fn disconnect(&self, id: ConnectionId) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(NetCommand::Disconnect { id, reply })?;
        Ok(rx)
    }

    /// Queue a message, formatted now, for an established connection
    pub fn send(
        &self,
        id: ConnectionId,
        message: impl fmt::Display,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(NetCommand::Send {
            id,
            message: message.to_string(),
            reply,
        })?;
        Ok(rx)
    }

    pub fn destroy(&self, id: ConnectionId) -> Result<oneshot::Receiver<Result<()>>> {
        let (reply, rx) = oneshot::channel();
        self.submit(NetCommand::Destroy { id, reply })?;
        Ok(rx)
    }

    fn submit(&self, command: NetCommand<C>) -> Result<()> {
        let name = command.name();
        self.tx
            .send(command)
            .map_err(|_| Error::Channel(format!("poller gone, {} not delivered", name)))?;
        self.waker.wake()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ConnectionState, NetConfig, Poller};
    use std::thread;

    fn quiet_config() -> NetConfig {
        let mut config = NetConfig::default();
        config.connection.max_connections = 2;
        config.poll.watch_stdin = false;
        config.poll.max_wait_ms = 20;
        config
    }

    #[test]
    fn test_remote_create_and_destroy() {
        let config = quiet_config();
        let mut poller: Poller<&'static str> = Poller::new(&config).unwrap();
        let mut registry = Registry::new(config, &poller).unwrap();
        let remote = poller.remote();

        let worker = thread::spawn(move || {
            let id = remote
                .create("libera", "irc.libera.chat", "6697")
                .unwrap()
                .blocking_recv()
                .unwrap()
                .unwrap();
            let sent = remote.send(id, "NICK alice").unwrap().blocking_recv().unwrap();
            remote.destroy(id).unwrap().blocking_recv().unwrap().unwrap();
            (id, sent)
        });

        while !worker.is_finished() {
            poller.turn(&mut registry).unwrap();
        }
        let (id, sent) = worker.join().unwrap();

        assert!(matches!(
            sent,
            Err(Error::NotConnected { state: ConnectionState::Disconnected })
        ));
        assert!(registry.get(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_dropped_reply_is_harmless() {
        let config = quiet_config();
        let mut poller: Poller<u8> = Poller::new(&config).unwrap();
        let mut registry = Registry::new(config, &poller).unwrap();

        drop(poller.remote().create(1, "irc.example.org", "6667").unwrap());
        poller.turn(&mut registry).unwrap();

        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_submit_after_poller_dropped() {
        let config = quiet_config();
        let poller: Poller<u8> = Poller::new(&config).unwrap();
        let mut registry = Registry::new(config, &poller).unwrap();
        let id = registry.create(1, "irc.example.org", "6667").unwrap();

        let remote = poller.remote();
        drop(poller);

        assert!(matches!(remote.connect(id), Err(Error::Channel(_))));
    }
}
