//! Outbound send queue
//!
//! Bytes queued by [`crate::Registry::send`] wait here until the socket
//! accepts them. Writes are non-blocking so a flush may only drain part of
//! the queue; the remainder is retried on the next writable readiness.

use std::collections::VecDeque;
use std::io::{self, ErrorKind, Write};

/// Send queue - bounded outgoing byte buffer
#[derive(Debug)]
pub struct SendQueue {
    /// Bytes not yet accepted by the socket
    buffer: VecDeque<u8>,
    /// Maximum size in bytes
    max_size: usize,
    /// Number of messages refused because the queue was full
    dropped_messages: u64,
}

/// Outcome of a [`SendQueue::flush_to`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Everything queued was written
    Drained { written: usize },
    /// The writer would block with bytes still queued
    Pending { written: usize },
}

impl Flush {
    /// Bytes accepted by the writer during the flush
    pub fn written(&self) -> usize {
        match *self {
            Flush::Drained { written } | Flush::Pending { written } => written,
        }
    }
}

impl SendQueue {
    /// Create a new send queue with specified maximum size
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_size,
            dropped_messages: 0,
        }
    }

    /// Queue one complete message
    /// Returns false, leaving the queue untouched, if it would not fit
    pub fn push(&mut self, message: &[u8]) -> bool {
        if self.buffer.len() + message.len() > self.max_size {
            self.dropped_messages += 1;
            tracing::warn!(
                "SendQueue full ({}/{}), dropping message",
                self.buffer.len(),
                self.max_size
            );
            return false;
        }

        self.buffer.extend(message);
        true
    }

    /// Write as much as the writer accepts without blocking
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<Flush> {
        let mut written = 0;

        while !self.buffer.is_empty() {
            match writer.write(self.buffer.make_contiguous()) {
                Ok(0) => {
                    return Err(io::Error::new(ErrorKind::WriteZero, "socket accepted no bytes"));
                }
                Ok(n) => {
                    self.buffer.drain(..n);
                    written += n;
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    return Ok(Flush::Pending { written });
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(Flush::Drained { written })
    }

    /// Get current buffer size in bytes
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the queue is empty
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Get maximum buffer size in bytes
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Get number of dropped messages
    pub fn dropped_messages(&self) -> u64 {
        self.dropped_messages
    }

    /// Discard everything queued
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Accepts at most `budget` bytes, then blocks
    struct Throttled {
        accepted: Vec<u8>,
        budget: usize,
    }

    impl Write for Throttled {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget).min(4);
            self.accepted.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_sendq_basic() {
        let mut sendq = SendQueue::new(100);

        assert!(sendq.push(b"PRIVMSG #test :Hello\r\n"));
        assert_eq!(sendq.len(), 22);

        let mut out = Throttled { accepted: Vec::new(), budget: usize::MAX };
        assert_eq!(sendq.flush_to(&mut out).unwrap(), Flush::Drained { written: 22 });
        assert_eq!(out.accepted, b"PRIVMSG #test :Hello\r\n");
        assert!(sendq.is_empty());
    }

    #[test]
    fn test_sendq_overflow() {
        let mut sendq = SendQueue::new(30);

        assert!(sendq.push(b"PRIVMSG #test :Hello\r\n"));
        assert!(!sendq.push(b"PRIVMSG #test :Again\r\n"));

        assert_eq!(sendq.dropped_messages(), 1);
        assert_eq!(sendq.len(), 22);
    }

    #[test]
    fn test_sendq_partial_flush() {
        let mut sendq = SendQueue::new(100);
        sendq.push(b"NICK alice\r\n");

        let mut out = Throttled { accepted: Vec::new(), budget: 5 };
        assert_eq!(sendq.flush_to(&mut out).unwrap(), Flush::Pending { written: 5 });
        assert_eq!(sendq.len(), 7);

        out.budget = 100;
        assert_eq!(sendq.flush_to(&mut out).unwrap(), Flush::Drained { written: 7 });
        assert_eq!(out.accepted, b"NICK alice\r\n");
    }
}
