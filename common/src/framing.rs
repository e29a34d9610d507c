//! Message boundaries on the decrypted byte stream.

use std::io;

/// Largest line accepted by the default framing
pub const DEFAULT_MAX_LINE: usize = 64 * 1024;
/// Read size of the raw framing, one read per message
pub const DEFAULT_RAW_CHUNK: usize = 256;

const LINE_READ_CHUNK: usize = 4096;

/// How text messages map onto the byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Each message is terminated by `\n`; a trailing `\r` is dropped.
    ///
    /// Text is not escaped: a message that itself contains `\n` is sent as
    /// written and arrives at the peer as several lines, so an echo of it
    /// comes back as several messages.
    Lines {
        /// Longest line accepted from the peer, without the terminator
        max_len: usize,
    },
    /// Whatever one read returns is one message, and writes go out verbatim.
    /// Messages longer than `chunk` are split.
    Raw {
        /// Bytes requested per read
        chunk: usize,
    },
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Lines {
            max_len: DEFAULT_MAX_LINE,
        }
    }
}

impl Framing {
    /// One read per message with the historical 256 byte buffer
    pub fn raw() -> Self {
        Framing::Raw {
            chunk: DEFAULT_RAW_CHUNK,
        }
    }

    pub fn encode(&self, message: &str) -> Vec<u8> {
        match self {
            Framing::Lines { .. } => {
                let mut out = Vec::with_capacity(message.len() + 1);
                out.extend_from_slice(message.as_bytes());
                out.push(b'\n');
                out
            }
            Framing::Raw { .. } => message.as_bytes().to_vec(),
        }
    }

    /// Size of the buffer the receive loop should read into
    pub fn read_chunk(&self) -> usize {
        match self {
            Framing::Lines { .. } => LINE_READ_CHUNK,
            Framing::Raw { chunk } => (*chunk).max(1),
        }
    }

    pub fn decoder(&self) -> FrameDecoder {
        FrameDecoder {
            framing: *self,
            pending: Vec::new(),
            scanned: 0,
        }
    }
}

/// Incremental splitter for inbound bytes
#[derive(Debug)]
pub struct FrameDecoder {
    framing: Framing,
    pending: Vec<u8>,
    /// Prefix of `pending` already known to hold no terminator
    scanned: usize,
}

impl FrameDecoder {
    /// Feeds freshly read bytes and returns every message they complete
    pub fn push(&mut self, bytes: &[u8]) -> io::Result<Vec<String>> {
        let max_len = match self.framing {
            Framing::Raw { .. } => {
                return Ok(vec![String::from_utf8_lossy(bytes).into_owned()]);
            }
            Framing::Lines { max_len } => max_len,
        };

        self.pending.extend_from_slice(bytes);
        let mut messages = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.pending[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            let mut line = &self.pending[start..end];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            if line.len() > max_len {
                return Err(oversized(max_len));
            }
            messages.push(String::from_utf8_lossy(line).into_owned());
            start = end + 1;
            from = start;
        }
        self.pending.drain(..start);
        self.scanned = self.pending.len();

        if self.pending.len() > max_len {
            return Err(oversized(max_len));
        }
        Ok(messages)
    }

    /// Hands out an unterminated remainder once the stream has ended
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        self.scanned = 0;
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

fn oversized(max_len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("message exceeds {} bytes without a line terminator", max_len),
    )
}
