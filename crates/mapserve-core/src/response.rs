// src/response.rs
use crate::http::HttpCode;
use crate::mmap::MappedFile;
use arrayvec::ArrayVec;
use std::io::{self, IoSlice, Write};
use std::path::Path;
use std::time::SystemTime;

/// Upper bound on the serialized status line and headers.
pub const HEADER_CAPACITY: usize = 1024;

/// Second region of a response, if any.
#[derive(Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    /// File contents served straight from the page cache.
    Mapped(MappedFile),
    /// A page composed in memory (the index listing).
    Rendered(Vec<u8>),
}

impl Body {
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            Body::Empty => &[],
            Body::Mapped(map) => map.as_slice(),
            Body::Rendered(bytes) => bytes,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `Content-Type` for a served path. Files without an extension inside the
/// upload directory are assumed to be text.
pub fn content_type(path: &Path, in_uploads: bool) -> &'static str {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return if in_uploads {
            "text/plain"
        } else {
            "application/octet-stream"
        };
    };
    match ext.to_ascii_lowercase().as_str() {
        "html" | "htm" => "text/html",
        "txt" => "text/plain",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "css" => "text/css",
        "js" => "application/javascript",
        "pdf" => "application/pdf",
        "mp3" => "audio/mpeg",
        "mp4" => "video/mp4",
        _ => "application/octet-stream",
    }
}

/// How far a write attempt got.
#[derive(Debug)]
pub enum WriteProgress {
    /// Every byte of header and body is out.
    Complete,
    /// The socket is full; wait for write readiness and call again.
    WouldBlock,
    /// The connection is unusable.
    Failed(io::Error),
}

struct HeaderOverflow;

/// A serialized response: header bytes plus at most one body region.
///
/// `bytes_sent` counts across both regions, so after a partial write the
/// unsent tail is recomputed rather than resent.
#[derive(Debug)]
pub struct Response {
    status: u16,
    keep_alive: bool,
    header: ArrayVec<u8, HEADER_CAPACITY>,
    body: Body,
    bytes_sent: usize,
}

impl Response {
    /// Build the response for `code`.
    ///
    /// Error outcomes ignore `body` and carry their fixed form inside the
    /// header buffer. A `BadRequest` always closes the connection.
    pub fn build(
        code: HttpCode,
        body: Body,
        content_type: &str,
        attachment: Option<&str>,
        keep_alive: bool,
    ) -> Self {
        let keep_alive = keep_alive && !matches!(code, HttpCode::BadRequest | HttpCode::NoRequest);
        match Self::try_build(code, body, content_type, attachment, keep_alive) {
            Ok(resp) => resp,
            Err(HeaderOverflow) => {
                tracing::warn!(status = code.status(), "response header overflow, sending 500");
                Self::error(HttpCode::InternalError, false)
            }
        }
    }

    /// A fixed error response.
    pub fn error(code: HttpCode, keep_alive: bool) -> Self {
        let keep_alive = keep_alive && !matches!(code, HttpCode::BadRequest | HttpCode::NoRequest);
        Self::try_build(code, Body::Empty, "text/html", None, keep_alive)
            .or_else(|_| Self::try_build(HttpCode::InternalError, Body::Empty, "text/html", None, false))
            .unwrap_or_else(|_| Self {
                status: 500,
                keep_alive: false,
                header: ArrayVec::new(),
                body: Body::Empty,
                bytes_sent: 0,
            })
    }

    fn try_build(
        code: HttpCode,
        body: Body,
        content_type: &str,
        attachment: Option<&str>,
        keep_alive: bool,
    ) -> Result<Self, HeaderOverflow> {
        let mut header = ArrayVec::<u8, HEADER_CAPACITY>::new();
        let mut put = |bytes: &[u8]| {
            header
                .try_extend_from_slice(bytes)
                .map_err(|_| HeaderOverflow)
        };

        let status = code.status();
        let mut num = itoa::Buffer::new();
        put(b"HTTP/1.1 ")?;
        put(num.format(status).as_bytes())?;
        put(b" ")?;
        put(code.title().as_bytes())?;
        put(b"\r\n")?;

        let (form, body, content_type, attachment) = match code.error_form() {
            Some(form) => (form.as_bytes(), Body::Empty, "text/html", None),
            None => (&[][..], body, content_type, attachment),
        };

        put(b"Content-Length: ")?;
        put(num.format(form.len() + body.len()).as_bytes())?;
        put(b"\r\nContent-Type: ")?;
        put(content_type.as_bytes())?;
        put(b"\r\n")?;
        if let Some(name) = attachment {
            put(b"Content-Disposition: attachment; filename=\"")?;
            for ch in name.chars() {
                let mut utf8 = [0u8; 4];
                let ch = if matches!(ch, '"' | '\\') || ch.is_control() { '_' } else { ch };
                put(ch.encode_utf8(&mut utf8).as_bytes())?;
            }
            put(b"\"\r\n")?;
        }
        put(if keep_alive {
            &b"Connection: keep-alive\r\n"[..]
        } else {
            &b"Connection: close\r\n"[..]
        })?;
        put(b"Date: ")?;
        put(httpdate::fmt_http_date(SystemTime::now()).as_bytes())?;
        put(b"\r\n\r\n")?;
        put(form)?;

        Ok(Self {
            status,
            keep_alive,
            header,
            body,
            bytes_sent: 0,
        })
    }

    #[inline]
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Whether the connection stays open once this response is out.
    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    #[inline]
    pub fn header(&self) -> &[u8] {
        &self.header
    }

    #[inline]
    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    #[inline]
    pub fn total_len(&self) -> usize {
        self.header.len() + self.body.len()
    }

    #[inline]
    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    #[inline]
    pub fn is_complete(&self) -> bool {
        self.bytes_sent >= self.total_len()
    }

    /// Push as much as `out` accepts with vectored writes.
    pub fn write_to<W: Write>(&mut self, out: &mut W) -> WriteProgress {
        loop {
            let header = &self.header[..];
            let body = self.body.as_slice();
            if self.bytes_sent >= header.len() + body.len() {
                return WriteProgress::Complete;
            }

            let result = if self.bytes_sent < header.len() {
                let slices = [IoSlice::new(&header[self.bytes_sent..]), IoSlice::new(body)];
                let count = if body.is_empty() { 1 } else { 2 };
                out.write_vectored(&slices[..count])
            } else {
                out.write_vectored(&[IoSlice::new(&body[self.bytes_sent - header.len()..])])
            };

            match result {
                Ok(0) => return WriteProgress::Failed(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.bytes_sent += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return WriteProgress::WouldBlock,
                Err(e) => return WriteProgress::Failed(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::ERROR_404_FORM;

    /// Accepts at most `k` bytes per call and blocks on every other call.
    struct Trickle {
        k: usize,
        out: Vec<u8>,
        block_next: bool,
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.write_vectored(&[IoSlice::new(buf)])
        }

        fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let mut budget = self.k;
            let mut written = 0;
            for buf in bufs {
                let n = buf.len().min(budget);
                self.out.extend_from_slice(&buf[..n]);
                budget -= n;
                written += n;
                if budget == 0 {
                    break;
                }
            }
            Ok(written)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn header_str(resp: &Response) -> String {
        String::from_utf8(resp.header().to_vec()).unwrap()
    }

    #[test]
    fn partial_writes_deliver_everything_in_order() {
        let body: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
        for k in [1, 2, 7, 64, 1000, 5000] {
            let mut resp = Response::build(
                HttpCode::FileReady,
                Body::Rendered(body.clone()),
                "application/octet-stream",
                None,
                true,
            );
            let mut expected = resp.header().to_vec();
            expected.extend_from_slice(&body);

            let mut sink = Trickle {
                k,
                out: Vec::new(),
                block_next: false,
            };
            let mut rounds = 0;
            loop {
                match resp.write_to(&mut sink) {
                    WriteProgress::Complete => break,
                    WriteProgress::WouldBlock => rounds += 1,
                    WriteProgress::Failed(e) => panic!("write failed: {e}"),
                }
                assert!(rounds < 100_000);
            }
            assert_eq!(resp.bytes_sent(), resp.total_len());
            assert_eq!(sink.out, expected, "corrupted output with k={k}");
        }
    }

    #[test]
    fn zero_length_write_is_fatal() {
        struct Stuck;
        impl Write for Stuck {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut resp = Response::error(HttpCode::NoResource, false);
        assert!(matches!(resp.write_to(&mut Stuck), WriteProgress::Failed(_)));
    }

    #[test]
    fn success_headers_in_order() {
        let resp = Response::build(
            HttpCode::FileReady,
            Body::Rendered(b"hello".to_vec()),
            "text/plain",
            Some("notes.txt"),
            true,
        );
        let head = header_str(&resp);
        assert!(head.starts_with(
            "HTTP/1.1 200 OK\r\nContent-Length: 5\r\nContent-Type: text/plain\r\n\
             Content-Disposition: attachment; filename=\"notes.txt\"\r\n\
             Connection: keep-alive\r\nDate: "
        ));
        assert!(head.ends_with(" GMT\r\n\r\n"));
        assert_eq!(resp.body(), b"hello");
        assert!(resp.keep_alive());
    }

    #[test]
    fn error_response_is_a_single_region() {
        let resp = Response::error(HttpCode::NoResource, true);
        let head = header_str(&resp);
        assert!(head.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", ERROR_404_FORM.len())));
        assert!(head.contains("Content-Type: text/html\r\n"));
        assert!(head.ends_with(ERROR_404_FORM));
        assert!(resp.body().is_empty());
        assert!(resp.keep_alive());
    }

    #[test]
    fn bad_request_always_closes() {
        let resp = Response::build(HttpCode::BadRequest, Body::Empty, "text/html", None, true);
        assert!(!resp.keep_alive());
        assert!(header_str(&resp).contains("Connection: close\r\n"));
    }

    #[test]
    fn header_overflow_falls_back_to_500() {
        let long_name = "x".repeat(HEADER_CAPACITY);
        let resp = Response::build(
            HttpCode::FileReady,
            Body::Rendered(b"data".to_vec()),
            "text/plain",
            Some(&long_name),
            true,
        );
        assert_eq!(resp.status(), 500);
        assert!(!resp.keep_alive());
        assert!(resp.body().is_empty());
    }

    #[test]
    fn content_types_follow_extension_table() {
        assert_eq!(content_type(Path::new("a/index.HTML"), false), "text/html");
        assert_eq!(content_type(Path::new("song.mp3"), false), "audio/mpeg");
        assert_eq!(content_type(Path::new("clip.mp4"), true), "video/mp4");
        assert_eq!(content_type(Path::new("archive.tar.gz"), false), "application/octet-stream");
        assert_eq!(content_type(Path::new("README"), false), "application/octet-stream");
        assert_eq!(content_type(Path::new("uploads/README"), true), "text/plain");
    }

    #[test]
    fn mapped_body_is_written_after_header() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"from the page cache").unwrap();
        let map = MappedFile::map(tmp.as_file()).unwrap();

        let mut resp = Response::build(HttpCode::FileReady, Body::Mapped(map), "text/plain", None, false);
        let mut out = Vec::new();
        assert!(matches!(resp.write_to(&mut out), WriteProgress::Complete));
        assert!(out.ends_with(b"\r\n\r\nfrom the page cache"));
    }
}
