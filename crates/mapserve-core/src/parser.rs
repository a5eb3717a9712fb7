// src/parser.rs
use crate::http::{Method, Request};
use memchr::memmem;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use thiserror::Error;

/// Blank line terminating the header block.
pub const HEADER_END: &[u8] = b"\r\n\r\n";

/// Why a request was rejected. Every variant is answered with a 400.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("request line must be `METHOD target version`")]
    BadRequestLine,
    #[error("only GET and POST are supported")]
    UnsupportedMethod,
    #[error("only HTTP/1.1 is supported")]
    UnsupportedVersion,
    #[error("request target is not an absolute path")]
    BadTarget,
    #[error("header line has no `:` separator")]
    BadHeader,
    #[error("Content-Length is not a non-negative integer")]
    BadContentLength,
    #[error("multipart/form-data without a boundary parameter")]
    MissingBoundary,
    #[error("request text is not valid UTF-8")]
    NotUtf8,
    #[error("header block exceeds the size limit")]
    HeadersTooLarge,
    #[error("Content-Length exceeds the upload limit")]
    BodyTooLarge,
}

/// Offset just past the first `\r\n\r\n`, or `None` if it has not arrived.
///
/// The search resumes at `from` (backed off so a terminator split across two
/// reads is still found), so repeated calls only scan newly arrived bytes.
pub fn find_header_end(buf: &[u8], from: usize) -> Option<usize> {
    let start = from.saturating_sub(HEADER_END.len() - 1).min(buf.len());
    memmem::find(&buf[start..], HEADER_END).map(|pos| start + pos + HEADER_END.len())
}

/// Lines of a header block, CRLF (or bare LF) terminated.
pub fn lines(block: &[u8]) -> impl Iterator<Item = &[u8]> {
    block
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: Method,
    pub path: String,
    pub version: String,
}

/// `GET /index.html HTTP/1.1`
pub fn parse_request_line(line: &[u8]) -> Result<RequestLine, ParseError> {
    let line = std::str::from_utf8(line).map_err(|_| ParseError::NotUtf8)?;
    let mut parts = line.split([' ', '\t']).filter(|s| !s.is_empty());

    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ParseError::BadRequestLine);
    };

    let method = Method::from_bytes(method.as_bytes()).ok_or(ParseError::UnsupportedMethod)?;
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(ParseError::UnsupportedVersion);
    }

    Ok(RequestLine {
        method,
        path: normalize_target(target)?,
        version: version.to_ascii_uppercase(),
    })
}

/// Reduce a request target to a decoded absolute path.
///
/// `http://host:port/a/b?q` becomes `/a/b`; anything not starting with `/`
/// afterwards is rejected.
fn normalize_target(target: &str) -> Result<String, ParseError> {
    let mut target = target;
    if target
        .get(..7)
        .is_some_and(|scheme| scheme.eq_ignore_ascii_case("http://"))
    {
        let rest = &target[7..];
        target = rest.find('/').map(|i| &rest[i..]).ok_or(ParseError::BadTarget)?;
    }

    let target = match target.find(['?', '#']) {
        Some(i) => &target[..i],
        None => target,
    };
    if !target.starts_with('/') {
        return Err(ParseError::BadTarget);
    }

    percent_decode_str(target)
        .decode_utf8()
        .map(|path| path.into_owned())
        .map_err(|_| ParseError::NotUtf8)
}

/// Apply one header line to `req`. Unknown headers are ignored.
pub fn parse_header_line(line: &[u8], req: &mut Request) -> Result<(), ParseError> {
    let colon = memchr::memchr(b':', line).ok_or(ParseError::BadHeader)?;
    let name = line[..colon].trim_ascii();
    let value = line[colon + 1..].trim_ascii();
    if name.is_empty() {
        return Err(ParseError::BadHeader);
    }

    if name.eq_ignore_ascii_case(b"Connection") {
        req.keep_alive = value
            .split(|&b| b == b',')
            .any(|token| token.trim_ascii().eq_ignore_ascii_case(b"keep-alive"));
    } else if name.eq_ignore_ascii_case(b"Content-Length") {
        req.content_length = std::str::from_utf8(value)
            .ok()
            .filter(|v| !v.is_empty() && v.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or(ParseError::BadContentLength)?;
    } else if name.eq_ignore_ascii_case(b"Host") {
        req.host = Some(utf8(value)?.to_string());
    } else if name.eq_ignore_ascii_case(b"Content-Type") {
        let value = utf8(value)?;
        if value.to_ascii_lowercase().contains("multipart/form-data") {
            req.boundary = Some(boundary_param(value).ok_or(ParseError::MissingBoundary)?);
        }
        req.content_type = Some(value.to_string());
    } else {
        tracing::trace!(header = %String::from_utf8_lossy(name), "ignoring header");
    }
    Ok(())
}

fn utf8(bytes: &[u8]) -> Result<&str, ParseError> {
    std::str::from_utf8(bytes).map_err(|_| ParseError::NotUtf8)
}

/// `multipart/form-data; boundary="----abc"` -> `----abc`
pub fn boundary_param(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let (key, value) = param.split_once('=')?;
        if !key.trim().eq_ignore_ascii_case("boundary") {
            return None;
        }
        let value = value.trim().trim_matches('"');
        (!value.is_empty()).then(|| value.to_string())
    })
}

#[derive(Deserialize)]
struct DeleteForm {
    filename: String,
}

/// Decode the `filename=<value>` field of a form-url-encoded delete request
/// (`+` is a space, `%XX` a byte).
pub fn decode_delete_form(body: &[u8]) -> Option<String> {
    serde_urlencoded::from_bytes::<DeleteForm>(body)
        .ok()
        .map(|form| form.filename)
        .filter(|name| !name.is_empty())
}
