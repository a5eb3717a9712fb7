// src/buffer.rs
use std::io::{self, Read};

/// Outcome of draining a socket into a [`ReadBuffer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Read until the source would block; `n` new bytes arrived.
    Drained(usize),
    /// Stopped because the buffer reached its limit; `n` new bytes arrived.
    Full(usize),
    /// The peer closed its side (a zero-byte read).
    Closed,
}

/// Per-connection read buffer with a hard capacity.
///
/// `read_idx` is where the next byte from the socket lands and `checked_idx`
/// is how far the parser has looked; `0 <= checked_idx <= read_idx <= limit`
/// holds at all times. Storage starts small and doubles on demand up to
/// `limit`, so idle slots stay cheap while uploads still fit.
pub struct ReadBuffer {
    buf: Vec<u8>,
    read_idx: usize,
    checked_idx: usize,
    initial: usize,
    limit: usize,
}

impl ReadBuffer {
    /// A buffer that has not allocated yet.
    pub fn new(initial: usize, limit: usize) -> Self {
        let initial = initial.clamp(1, limit.max(1));
        Self {
            buf: Vec::new(),
            read_idx: 0,
            checked_idx: 0,
            initial,
            limit: limit.max(initial),
        }
    }

    #[inline]
    pub fn filled(&self) -> &[u8] {
        &self.buf[..self.read_idx]
    }

    #[inline]
    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    #[inline]
    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read_idx >= self.limit
    }

    /// Move the parse cursor forward; it never passes `read_idx` or moves back.
    pub fn advance_checked(&mut self, to: usize) {
        self.checked_idx = self.checked_idx.max(to.min(self.read_idx));
    }

    /// Writable tail, growing storage if the current allocation is used up.
    /// Empty only when the buffer is at its limit.
    fn spare_mut(&mut self) -> &mut [u8] {
        if self.read_idx == self.buf.len() && self.buf.len() < self.limit {
            let grown = if self.buf.is_empty() {
                self.initial
            } else {
                (self.buf.len() * 2).min(self.limit)
            };
            self.buf.resize(grown, 0);
        }
        &mut self.buf[self.read_idx..]
    }

    /// Copy bytes in directly; used by tests and by callers that already hold data.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> usize {
        let mut written = 0;
        while written < data.len() {
            let spare = self.spare_mut();
            if spare.is_empty() {
                break;
            }
            let n = spare.len().min(data.len() - written);
            spare[..n].copy_from_slice(&data[written..written + n]);
            self.read_idx += n;
            written += n;
        }
        written
    }

    /// Drain `src` until it would block, the peer closes, or the buffer is full.
    ///
    /// Errors other than `WouldBlock`/`Interrupted` are returned as-is and are
    /// fatal for the connection.
    pub fn fill_from<R: Read>(&mut self, src: &mut R) -> io::Result<ReadStatus> {
        let mut total = 0;
        loop {
            let spare = self.spare_mut();
            if spare.is_empty() {
                return Ok(ReadStatus::Full(total));
            }
            match src.read(spare) {
                Ok(0) => return Ok(ReadStatus::Closed),
                Ok(n) => {
                    self.read_idx += n;
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadStatus::Drained(total));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drop the first `n` bytes (a finished request), shifting any pipelined
    /// bytes to the front and rewinding the parse cursor.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.read_idx);
        self.buf.copy_within(n..self.read_idx, 0);
        self.read_idx -= n;
        self.checked_idx = 0;
    }

    /// Forget everything and give back storage beyond the initial size.
    pub fn clear(&mut self) {
        self.read_idx = 0;
        self.checked_idx = 0;
        if self.buf.len() > self.initial {
            self.buf.truncate(self.initial);
            self.buf.shrink_to(self.initial);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Hands out scripted chunks, then reports WouldBlock (or EOF if asked).
    struct Script {
        chunks: VecDeque<Vec<u8>>,
        eof: bool,
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.chunks.front_mut() {
                Some(chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    chunk.drain(..n);
                    if chunk.is_empty() {
                        self.chunks.pop_front();
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    #[test]
    fn drains_until_would_block() {
        let mut src = Script {
            chunks: VecDeque::from(vec![b"GET / ".to_vec(), b"HTTP/1.1\r\n".to_vec()]),
            eof: false,
        };
        let mut buf = ReadBuffer::new(4, 64);
        assert_eq!(buf.fill_from(&mut src).unwrap(), ReadStatus::Drained(16));
        assert_eq!(buf.filled(), b"GET / HTTP/1.1\r\n");
        assert!(buf.checked_idx() <= buf.read_idx());
    }

    #[test]
    fn stops_at_limit() {
        let mut src = Script {
            chunks: VecDeque::from(vec![vec![b'x'; 100]]),
            eof: false,
        };
        let mut buf = ReadBuffer::new(8, 32);
        assert_eq!(buf.fill_from(&mut src).unwrap(), ReadStatus::Full(32));
        assert!(buf.is_full());
        assert_eq!(buf.read_idx(), 32);
    }

    #[test]
    fn zero_byte_read_is_close() {
        let mut src = Script {
            chunks: VecDeque::from(vec![b"partial".to_vec()]),
            eof: true,
        };
        let mut buf = ReadBuffer::new(16, 64);
        assert_eq!(buf.fill_from(&mut src).unwrap(), ReadStatus::Closed);
    }

    #[test]
    fn consume_keeps_pipelined_tail() {
        let mut buf = ReadBuffer::new(16, 64);
        buf.extend_from_slice(b"first|second");
        buf.advance_checked(6);
        buf.consume(6);
        assert_eq!(buf.filled(), b"second");
        assert_eq!(buf.checked_idx(), 0);
    }

    #[test]
    fn checked_cursor_never_moves_back_or_past_read() {
        let mut buf = ReadBuffer::new(16, 64);
        buf.extend_from_slice(b"abcdef");
        buf.advance_checked(4);
        buf.advance_checked(2);
        assert_eq!(buf.checked_idx(), 4);
        buf.advance_checked(100);
        assert_eq!(buf.checked_idx(), 6);
    }

    #[test]
    fn clear_shrinks_grown_storage() {
        let mut buf = ReadBuffer::new(4, 1024);
        buf.extend_from_slice(&[0u8; 500]);
        buf.clear();
        assert_eq!(buf.read_idx(), 0);
        assert_eq!(buf.buf.len(), 4);
    }
}
