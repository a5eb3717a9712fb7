// src/conn.rs
use crate::buffer::{ReadBuffer, ReadStatus};
use crate::http::{HttpCode, ParseState, Request};
use crate::parser::{self, HEADER_END, ParseError};
use crate::resolver::{Resolution, Resolver};
use crate::response::{Response, WriteProgress};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Instant;

/// Largest accepted request line plus headers, terminator included.
pub const HEADER_LIMIT: usize = 8 * 1024;

/// Who may touch a slot right now.
///
/// `Reading` and `Writing` slots belong to the reactor, `Queued` and
/// `Processing` slots to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SlotState {
    #[default]
    Free = 0,
    Reading = 1,
    Queued = 2,
    Processing = 3,
    Writing = 4,
}

/// One accepted socket and everything in flight on it.
pub struct Conn {
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    /// Bumped on every close; stale queue entries and events carry an old value.
    pub generation: u32,
    pub state: SlotState,
    pub last_active: Instant,
    pub requests_served: u32,

    buf: ReadBuffer,
    parse: ParseState,
    header_end: usize,
    req: Request,
    max_body: usize,
    response: Option<Response>,
}

impl Conn {
    /// An empty slot. The read buffer starts at `initial` bytes and may grow
    /// to hold a header block plus a `max_body` byte body.
    pub fn new(initial: usize, max_body: usize) -> Self {
        Self {
            stream: None,
            peer: None,
            generation: 0,
            state: SlotState::Free,
            last_active: Instant::now(),
            requests_served: 0,
            buf: ReadBuffer::new(initial, HEADER_LIMIT.saturating_add(max_body)),
            parse: ParseState::AwaitingRequest,
            header_end: 0,
            req: Request::default(),
            max_body,
            response: None,
        }
    }

    /// Take ownership of a freshly accepted stream.
    pub fn open(&mut self, stream: TcpStream, peer: SocketAddr, now: Instant) {
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.state = SlotState::Reading;
        self.last_active = now;
        self.requests_served = 0;
        self.reset_request();
        self.buf.clear();
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    #[inline]
    pub fn fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    #[inline]
    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    #[inline]
    pub fn parse_state(&self) -> ParseState {
        self.parse
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.req
    }

    #[inline]
    pub fn response(&self) -> Option<&Response> {
        self.response.as_ref()
    }

    /// Drain the socket into the read buffer.
    pub fn read(&mut self) -> io::Result<ReadStatus> {
        let Some(stream) = self.stream.as_ref() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        let mut src = stream;
        self.buf.fill_from(&mut src)
    }

    /// Run the state machine over everything buffered so far.
    ///
    /// Returns `NoRequest` while more bytes are needed. Any other code means
    /// a response has been built and is ready to write.
    pub fn process(&mut self, resolver: &Resolver) -> HttpCode {
        match self.parse_request() {
            Ok(true) => {
                let start = self.header_end;
                let body = &self.buf.filled()[start..start + self.req.content_length];
                let resolution = resolver.resolve(&mut self.req, body);
                self.respond(resolution)
            }
            Ok(false) if self.buf.is_full() => {
                tracing::debug!(peer = ?self.peer, "read buffer full before request completed");
                self.respond(Resolution::failed(HttpCode::BadRequest))
            }
            Ok(false) => HttpCode::NoRequest,
            Err(e) => {
                tracing::debug!(peer = ?self.peer, error = %e, "rejecting request");
                self.respond(Resolution::failed(HttpCode::BadRequest))
            }
        }
    }

    /// Replace whatever was in progress with a fixed error response.
    pub fn fail(&mut self, code: HttpCode) -> HttpCode {
        self.respond(Resolution::failed(code))
    }

    fn respond(&mut self, resolution: Resolution) -> HttpCode {
        let code = resolution.code;
        self.parse = ParseState::Resolved(code);
        self.requests_served += 1;
        self.response = Some(Response::build(
            code,
            resolution.body,
            resolution.content_type,
            resolution.attachment.as_deref(),
            self.req.keep_alive,
        ));
        code
    }

    /// Advance through the parse states. `Ok(true)` once the request line,
    /// headers and the full body are buffered.
    fn parse_request(&mut self) -> Result<bool, ParseError> {
        loop {
            match self.parse {
                ParseState::AwaitingRequest => {
                    // Stray CRLFs between pipelined requests.
                    while self.buf.filled().starts_with(b"\r\n") {
                        self.buf.consume(2);
                    }

                    let Some(end) = parser::find_header_end(self.buf.filled(), self.buf.checked_idx())
                    else {
                        self.buf.advance_checked(self.buf.read_idx());
                        if self.buf.read_idx() >= HEADER_LIMIT {
                            return Err(ParseError::HeadersTooLarge);
                        }
                        return Ok(false);
                    };
                    if end > HEADER_LIMIT {
                        return Err(ParseError::HeadersTooLarge);
                    }
                    self.header_end = end;
                    self.buf.advance_checked(end);

                    let first = parser::lines(&self.buf.filled()[..end])
                        .next()
                        .unwrap_or_default();
                    let line = parser::parse_request_line(first)?;
                    self.req.method = line.method;
                    self.req.path = line.path;
                    self.req.version = line.version;
                    self.parse = ParseState::GotRequestLine;
                }
                ParseState::GotRequestLine => {
                    let block = &self.buf.filled()[..self.header_end - HEADER_END.len()];
                    for line in parser::lines(block).skip(1) {
                        parser::parse_header_line(line, &mut self.req)?;
                    }
                    self.parse = ParseState::GotHeaders;
                }
                ParseState::GotHeaders => {
                    if self.req.content_length > self.max_body {
                        return Err(ParseError::BodyTooLarge);
                    }
                    if self.req.content_length == 0 {
                        return Ok(true);
                    }
                    self.parse = ParseState::AwaitingBody;
                }
                ParseState::AwaitingBody => {
                    return Ok(self.buf.read_idx() >= self.header_end + self.req.content_length);
                }
                ParseState::Resolved(_) => return Ok(false),
            }
        }
    }

    /// Push the pending response out.
    pub fn write(&mut self) -> WriteProgress {
        let (Some(stream), Some(response)) = (self.stream.as_ref(), self.response.as_mut()) else {
            return WriteProgress::Failed(io::ErrorKind::NotConnected.into());
        };
        let mut out = stream;
        response.write_to(&mut out)
    }

    /// Start the next keep-alive cycle. Returns `true` when bytes of a
    /// pipelined request are already buffered.
    pub fn reset_for_next(&mut self) -> bool {
        let consumed = self.header_end + self.req.content_length;
        self.buf.consume(consumed);
        if self.buf.read_idx() == 0 {
            self.buf.clear();
        }
        self.reset_request();
        self.buf.read_idx() > 0
    }

    fn reset_request(&mut self) {
        self.response = None;
        self.req = Request::default();
        self.parse = ParseState::AwaitingRequest;
        self.header_end = 0;
    }

    /// Release the mapping and buffers and hand back the socket.
    pub fn close(&mut self) -> Option<TcpStream> {
        self.reset_request();
        self.buf.clear();
        self.state = SlotState::Free;
        self.generation = self.generation.wrapping_add(1);
        self.requests_served = 0;
        self.peer = None;
        self.stream.take()
    }

    #[cfg(test)]
    pub(crate) fn feed(&mut self, bytes: &[u8]) -> usize {
        self.buf.extend_from_slice(bytes)
    }
}
