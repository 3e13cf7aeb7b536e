//! Line framing for socket and terminal input
//!
//! Turns an arbitrary byte stream into `\n`-delimited lines of bounded
//! length. A trailing `\r` is stripped so both `\r\n` (RFC 2812) and bare
//! `\n` terminate a line. Partial data is retained across reads.

/// Maximum IRC message content, RFC 2812 section 2.3
pub const MAX_MESSAGE_LEN: usize = 510;

/// One unit of output from [`LineFramer::feed`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framed {
    /// A complete line, terminator stripped
    Line(Vec<u8>),
    /// A line grew past the limit before a terminator arrived; the buffered
    /// bytes were dropped and the rest of that line will be skipped
    Overflow { discarded: usize },
}

/// Bounded line accumulator
#[derive(Debug)]
pub struct LineFramer {
    buffer: Vec<u8>,
    max_line: usize,
    /// Skipping the tail of an oversized line until the next `\n`
    discarding: bool,
}

impl LineFramer {
    /// Create a framer that accepts lines of at most `max_line` content bytes
    pub fn new(max_line: usize) -> Self {
        Self {
            // room for the content plus a pending '\r'
            buffer: Vec::with_capacity(max_line + 1),
            max_line,
            discarding: false,
        }
    }

    /// Feed freshly read bytes, returning every line completed by them
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<Framed> {
        let mut out = Vec::new();

        while !data.is_empty() {
            let newline = data.iter().position(|&b| b == b'\n');
            let (chunk, rest, terminated) = match newline {
                Some(pos) => (&data[..pos], &data[pos + 1..], true),
                None => (data, &data[data.len()..], false),
            };
            data = rest;

            if self.discarding {
                if terminated {
                    self.discarding = false;
                }
                continue;
            }

            self.buffer.extend_from_slice(chunk);

            if terminated {
                if self.buffer.last() == Some(&b'\r') {
                    self.buffer.pop();
                }
                if self.buffer.len() > self.max_line {
                    // content plus terminator arrived in one read
                    out.push(Framed::Overflow { discarded: self.buffer.len() });
                    self.buffer.clear();
                } else if !self.buffer.is_empty() {
                    let line = std::mem::replace(
                        &mut self.buffer,
                        Vec::with_capacity(self.max_line + 1),
                    );
                    out.push(Framed::Line(line));
                }
            } else if self.pending_content() > self.max_line {
                out.push(Framed::Overflow { discarded: self.buffer.len() });
                self.buffer.clear();
                self.discarding = true;
            }
        }

        out
    }

    /// Number of content bytes buffered, not counting a trailing `\r` that
    /// may turn out to be part of the terminator
    fn pending_content(&self) -> usize {
        match self.buffer.last() {
            Some(b'\r') => self.buffer.len() - 1,
            _ => self.buffer.len(),
        }
    }

    /// Bytes of the current partial line
    pub fn pending(&self) -> &[u8] {
        &self.buffer
    }

    /// Maximum content length of one line
    pub fn max_line(&self) -> usize {
        self.max_line
    }

    /// End of stream: take the unterminated last line, if any, as a line
    pub fn finish(&mut self) -> Option<Vec<u8>> {
        let discarding = std::mem::replace(&mut self.discarding, false);
        if self.buffer.last() == Some(&b'\r') {
            self.buffer.pop();
        }
        let line = std::mem::take(&mut self.buffer);
        (!discarding && !line.is_empty()).then_some(line)
    }

    /// Drop any partial line, e.g. when the socket it belonged to is closed
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.discarding = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(out: &[Framed]) -> Vec<&[u8]> {
        out.iter()
            .filter_map(|f| match f {
                Framed::Line(l) => Some(l.as_slice()),
                Framed::Overflow { .. } => None,
            })
            .collect()
    }

    #[test]
    fn test_partial_line_retained() {
        let mut framer = LineFramer::new(MAX_MESSAGE_LEN);

        let out = framer.feed(b"PING :x\r\nPRIVMSG");
        assert_eq!(out, vec![Framed::Line(b"PING :x".to_vec())]);
        assert_eq!(framer.pending(), b"PRIVMSG");

        let out = framer.feed(b" #c :hi\r\n");
        assert_eq!(out, vec![Framed::Line(b"PRIVMSG #c :hi".to_vec())]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_terminator_split_across_reads() {
        let mut framer = LineFramer::new(MAX_MESSAGE_LEN);

        assert!(framer.feed(b"NICK test\r").is_empty());
        let out = framer.feed(b"\nUSER");
        assert_eq!(lines(&out), vec![b"NICK test".as_slice()]);
    }

    #[test]
    fn test_bare_newline_and_empty_lines() {
        let mut framer = LineFramer::new(MAX_MESSAGE_LEN);

        let out = framer.feed(b"one\n\r\n\ntwo\r\n");
        assert_eq!(lines(&out), vec![b"one".as_slice(), b"two".as_slice()]);
    }

    #[test]
    fn test_exact_max_length_delivered() {
        let mut framer = LineFramer::new(MAX_MESSAGE_LEN);
        let mut data = vec![b'a'; MAX_MESSAGE_LEN];

        // split so the limit is reached, then the '\r' lands alone
        assert!(framer.feed(&data).is_empty());
        assert!(framer.feed(b"\r").is_empty());
        let out = framer.feed(b"\n");
        assert_eq!(out, vec![Framed::Line(data.clone())]);

        data.extend_from_slice(b"\r\n");
        let out = framer.feed(&data);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0], Framed::Line(l) if l.len() == MAX_MESSAGE_LEN));
    }

    #[test]
    fn test_one_byte_over_reports_once() {
        let mut framer = LineFramer::new(MAX_MESSAGE_LEN);

        let out = framer.feed(&vec![b'a'; MAX_MESSAGE_LEN + 1]);
        assert_eq!(out, vec![Framed::Overflow { discarded: MAX_MESSAGE_LEN + 1 }]);

        // the rest of the oversized line is skipped silently
        assert!(framer.feed(&vec![b'b'; 2000]).is_empty());

        // resynchronised at the next line boundary
        let out = framer.feed(b"tail\r\nPING :y\r\n");
        assert_eq!(lines(&out), vec![b"PING :y".as_slice()]);
    }

    #[test]
    fn test_oversized_line_in_single_read() {
        let mut framer = LineFramer::new(8);

        let out = framer.feed(b"0123456789\r\nok\r\n");
        assert_eq!(
            out,
            vec![Framed::Overflow { discarded: 10 }, Framed::Line(b"ok".to_vec())]
        );
    }

    #[test]
    fn test_clear_drops_partial() {
        let mut framer = LineFramer::new(8);
        framer.feed(&[b'x'; 9]);
        framer.clear();

        let out = framer.feed(b"fresh\n");
        assert_eq!(lines(&out), vec![b"fresh".as_slice()]);
    }

    #[test]
    fn test_finish_flushes_unterminated_line() {
        let mut framer = LineFramer::new(MAX_MESSAGE_LEN);
        assert_eq!(framer.feed(b"/join #rust\n/quit").len(), 1);

        assert_eq!(framer.finish(), Some(b"/quit".to_vec()));
        assert_eq!(framer.finish(), None);
    }

    #[test]
    fn test_finish_skips_discarded_tail() {
        let mut framer = LineFramer::new(4);
        framer.feed(b"0123456789");
        assert_eq!(framer.finish(), None);
    }
}
