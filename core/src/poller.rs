//! Single-threaded poll loop
//!
//! One [`Poller::poll`] call is one cycle:
//!
//! 1. apply directives queued through a [`NetRemote`]
//! 2. wait, bounded by the next connection timer and `max_wait`, for
//!    socket readiness or input
//! 3. apply directives that arrived while waiting, so an explicit
//!    disconnect always precedes readiness of the same cycle
//! 4. route readiness to the owning connections, in the order reported
//! 5. finish attempts whose host lookup has completed
//! 6. fire expired retry, connect-timeout and liveness timers
//! 7. dispatch every queued event to the handler
//!
//! Standard input is blocking, so a reader thread forwards its bytes over a
//! channel and wakes the poll; framing and callbacks stay on this thread.

use crate::command::{NetCommand, NetRemote};
use crate::framer::{Framed, LineFramer};
use crate::{Error, NetConfig, NetEvent, NetHandler, Registry, Result};
use mio::{Events, Poll, Token, Waker};
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Token shared by input and remote directives
pub(crate) const WAKE: Token = Token(0);

/// First token handed to a connection socket
pub(crate) const FIRST_SOCKET_TOKEN: usize = 1;

/// Bytes read from the input source per `read` call
const INPUT_CHUNK: usize = 8192;

/// Input source feeding the poll loop
#[derive(Debug)]
struct Input {
    rx: UnboundedReceiver<Vec<u8>>,
    framer: LineFramer,
    open: bool,
}

impl Input {
    /// Frame everything the reader thread has sent so far
    fn drain<C: Clone>(&mut self, registry: &mut Registry<C>) {
        while self.open {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    for framed in self.framer.feed(&chunk) {
                        match framed {
                            Framed::Line(line) => registry.push_event(NetEvent::InputLine(line)),
                            Framed::Overflow { discarded } => {
                                let error = Error::Framing {
                                    len: discarded,
                                    max: self.framer.max_line(),
                                };
                                warn!("Input {}", error);
                                registry.push_event(NetEvent::Error {
                                    context: None,
                                    message: error.to_string(),
                                });
                            }
                        }
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if let Some(line) = self.framer.finish() {
                        registry.push_event(NetEvent::InputLine(line));
                    }
                    info!("Input closed");
                    self.open = false;
                }
            }
        }
    }
}

/// Multiplexing loop over input and every connection socket
#[derive(Debug)]
pub struct Poller<C> {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    input: Option<Input>,
    input_max_line: usize,
    commands_tx: UnboundedSender<NetCommand<C>>,
    commands: UnboundedReceiver<NetCommand<C>>,
    max_wait: Duration,
}

impl<C: Clone> Poller<C> {
    /// Create the poller, watching standard input if configured
    pub fn new(config: &NetConfig) -> Result<Self> {
        config.validate()?;

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE)?);
        let (commands_tx, commands) = mpsc::unbounded_channel();

        let mut poller = Self {
            poll,
            events: Events::with_capacity(config.poll.events_capacity),
            waker,
            input: None,
            input_max_line: config.buffers.input_max_line_length,
            commands_tx,
            commands,
            max_wait: config.poll.max_wait(),
        };

        if config.poll.watch_stdin {
            poller.watch_input(std::io::stdin())?;
        }

        Ok(poller)
    }

    /// Feed lines from `reader` into the loop as input-line events
    ///
    /// Replaces any input source watched before.
    pub fn watch_input<R: Read + Send + 'static>(&mut self, reader: R) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel();
        spawn_reader(reader, tx, Arc::clone(&self.waker))?;

        self.input = Some(Input {
            rx,
            framer: LineFramer::new(self.input_max_line),
            open: true,
        });
        Ok(())
    }

    /// Whether the input source is still delivering
    pub fn input_open(&self) -> bool {
        self.input.as_ref().is_some_and(|input| input.open)
    }

    /// Handle for issuing directives from other threads
    pub fn remote(&self) -> NetRemote<C> {
        NetRemote::new(self.commands_tx.clone(), Arc::clone(&self.waker))
    }

    /// Run one cycle and dispatch the resulting events, returning how many
    /// were delivered
    pub fn poll<H: NetHandler<C>>(
        &mut self,
        registry: &mut Registry<C>,
        handler: &mut H,
    ) -> Result<usize> {
        self.turn(registry)?;
        Ok(registry.dispatch(handler))
    }

    /// Run one cycle, leaving the resulting events queued on the registry
    pub fn turn(&mut self, registry: &mut Registry<C>) -> Result<()> {
        self.apply_commands(registry);

        let timeout = self.next_timeout(registry, Instant::now());
        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }

        self.apply_commands(registry);

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| {
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed() || event.is_error();
                (event.token(), readable, writable)
            })
            .collect();

        let now = Instant::now();
        for (token, readable, writable) in ready {
            if token == WAKE {
                if let Some(input) = self.input.as_mut() {
                    input.drain(registry);
                }
            } else {
                registry.handle_ready(token, readable, writable, now);
            }
        }

        registry.complete_lookups(now);
        registry.tick(now);
        Ok(())
    }

    pub(crate) fn mio_registry(&self) -> Result<mio::Registry> {
        Ok(self.poll.registry().try_clone()?)
    }

    pub(crate) fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    fn apply_commands(&mut self, registry: &mut Registry<C>) {
        while let Ok(command) = self.commands.try_recv() {
            command.apply(registry);
        }
    }

    /// Wait until the earliest connection timer, never longer than `max_wait`;
    /// don't wait at all while events are queued
    fn next_timeout(&self, registry: &Registry<C>, now: Instant) -> Duration {
        if registry.pending_events() > 0 {
            return Duration::ZERO;
        }

        match registry.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(now).min(self.max_wait),
            None => self.max_wait,
        }
    }
}

fn spawn_reader<R: Read + Send + 'static>(
    mut reader: R,
    tx: UnboundedSender<Vec<u8>>,
    waker: Arc<Waker>,
) -> Result<()> {
    thread::Builder::new()
        .name("ircnet-input".to_string())
        .spawn(move || {
            let mut buf = [0u8; INPUT_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.send(buf[..n].to_vec()).is_err() {
                            return;
                        }
                    }
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("Error reading input: {}", e);
                        break;
                    }
                }
                if let Err(e) = waker.wake() {
                    warn!("Failed to wake poller: {}", e);
                }
            }

            debug!("Input reader finished");
            drop(tx);
            let _ = waker.wake();
        })?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn quiet_config() -> NetConfig {
        let mut config = NetConfig::default();
        config.poll.watch_stdin = false;
        config.poll.max_wait_ms = 20;
        config
    }

    #[test]
    fn test_idle_cycle_is_bounded() {
        let config = quiet_config();
        let mut poller: Poller<()> = Poller::new(&config).unwrap();
        let mut registry = Registry::new(config, &poller).unwrap();

        let started = Instant::now();
        poller.turn(&mut registry).unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(registry.pending_events(), 0);
        assert!(!poller.input_open());
    }

    #[test]
    fn test_input_lines_framed() {
        let mut config = quiet_config();
        config.buffers.input_max_line_length = 16;
        let mut poller: Poller<()> = Poller::new(&config).unwrap();
        let mut registry = Registry::new(config, &poller).unwrap();

        let data = b"/join #rust\nhello\r\nthis line is far too long\nafter\n".to_vec();
        poller.watch_input(Cursor::new(data)).unwrap();

        let mut events = Vec::new();
        for _ in 0..200 {
            poller.turn(&mut registry).unwrap();
            events.extend(registry.drain_events());
            if !poller.input_open() {
                break;
            }
        }

        assert!(!poller.input_open());
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], NetEvent::InputLine(b"/join #rust".to_vec()));
        assert_eq!(events[1], NetEvent::InputLine(b"hello".to_vec()));
        assert!(matches!(&events[2], NetEvent::Error { context: None, .. }));
        assert_eq!(events[3], NetEvent::InputLine(b"after".to_vec()));
    }

    #[test]
    fn test_unterminated_last_input_line_delivered() {
        let config = quiet_config();
        let mut poller: Poller<()> = Poller::new(&config).unwrap();
        let mut registry = Registry::new(config, &poller).unwrap();

        poller.watch_input(Cursor::new(b"hello\n/quit".to_vec())).unwrap();

        let mut events = Vec::new();
        for _ in 0..200 {
            poller.turn(&mut registry).unwrap();
            events.extend(registry.drain_events());
            if !poller.input_open() {
                break;
            }
        }

        assert_eq!(
            events,
            vec![
                NetEvent::InputLine(b"hello".to_vec()),
                NetEvent::InputLine(b"/quit".to_vec()),
            ]
        );
    }
}
