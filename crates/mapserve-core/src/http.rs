// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    /// Only GET and POST are served; anything else is a bad request.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        if b.eq_ignore_ascii_case(b"GET") {
            Some(Method::Get)
        } else if b.eq_ignore_ascii_case(b"POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

/// Where the per-connection state machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    AwaitingRequest,
    GotRequestLine,
    GotHeaders,
    AwaitingBody,
    Resolved(HttpCode),
}

/// Result of one `process` step.
///
/// `NoRequest` is not an error: it means more bytes are needed and the
/// connection goes back to waiting for read readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    NoRequest,
    BadRequest,
    NoResource,
    Forbidden,
    FileReady,
    UploadHandled,
    InternalError,
}

impl HttpCode {
    pub fn status(self) -> u16 {
        match self {
            HttpCode::FileReady | HttpCode::UploadHandled => 200,
            HttpCode::BadRequest | HttpCode::NoRequest => 400,
            HttpCode::Forbidden => 403,
            HttpCode::NoResource => 404,
            HttpCode::InternalError => 500,
        }
    }

    pub fn title(self) -> &'static str {
        match self.status() {
            200 => OK_200_TITLE,
            400 => ERROR_400_TITLE,
            403 => ERROR_403_TITLE,
            404 => ERROR_404_TITLE,
            _ => ERROR_500_TITLE,
        }
    }

    /// Fixed body for error outcomes; `None` for successful ones.
    pub fn error_form(self) -> Option<&'static str> {
        match self {
            HttpCode::FileReady | HttpCode::UploadHandled => None,
            HttpCode::BadRequest | HttpCode::NoRequest => Some(ERROR_400_FORM),
            HttpCode::Forbidden => Some(ERROR_403_FORM),
            HttpCode::NoResource => Some(ERROR_404_FORM),
            HttpCode::InternalError => Some(ERROR_500_FORM),
        }
    }
}

pub const OK_200_TITLE: &str = "OK";
pub const ERROR_400_TITLE: &str = "Bad Request";
pub const ERROR_400_FORM: &str =
    "Your request has bad syntax or is inherently impossible to satisfy.\n";
pub const ERROR_403_TITLE: &str = "Forbidden";
pub const ERROR_403_FORM: &str = "You do not have permission to get file from this server.\n";
pub const ERROR_404_TITLE: &str = "Not Found";
pub const ERROR_404_FORM: &str = "The requested file was not found on this server.\n";
pub const ERROR_500_TITLE: &str = "Internal Error";
pub const ERROR_500_FORM: &str = "There was an unusual problem serving the requested file.\n";

/// Request fields extracted from the request line and headers.
///
/// Owned because the read buffer underneath is reused across keep-alive cycles.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub version: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
    pub content_type: Option<String>,
    /// Set when `Content-Type` is `multipart/form-data`.
    pub boundary: Option<String>,
    /// Filled in once an upload has been written to disk.
    pub upload_filename: Option<String>,
}

impl Request {
    #[inline]
    pub fn is_upload(&self) -> bool {
        self.boundary.is_some()
    }
}
