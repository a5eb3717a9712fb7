use memchr::memmem;
use std::collections::HashMap;

/// Name given to a file part whose `filename` is missing or unusable.
pub const PLACEHOLDER_FILENAME: &str = "unnamed_upload";

#[derive(Debug)]
pub struct Part<'a> {
    pub name: Option<&'a str>,
    pub filename: Option<&'a str>,
    pub content_type: Option<&'a str>,
    pub body: &'a [u8],
}

impl Part<'_> {
    /// A part is a file field when its disposition carries `filename=`.
    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

/// Iterator over the parts of a `multipart/form-data` body.
///
/// Stops at the closing `--boundary--`, or at a part whose terminating
/// boundary never arrives.
pub struct Multipart<'a> {
    body: &'a [u8],
    finder: memmem::Finder<'static>,
}

impl<'a> Multipart<'a> {
    pub fn new(body: &'a [u8], boundary: &str) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self {
            body,
            finder: memmem::Finder::new(&marker).into_owned(),
        }
    }

    fn marker_len(&self) -> usize {
        self.finder.needle().len()
    }
}

impl<'a> Iterator for Multipart<'a> {
    type Item = Part<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.body.is_empty() {
                return None;
            }

            let mut start = self.finder.find(self.body)? + self.marker_len();

            // `--` right after the marker closes the body.
            if self.body[start..].starts_with(b"--") {
                self.body = &[];
                return None;
            }
            if self.body[start..].starts_with(b"\r\n") {
                start += 2;
            }

            let Some(header_end) = memmem::find(&self.body[start..], b"\r\n\r\n") else {
                self.body = &[];
                return None;
            };
            let header_slice = &self.body[start..start + header_end];
            let body_start = start + header_end + 4;

            let Some(next) = self.finder.find(&self.body[body_start..]) else {
                self.body = &[];
                return None;
            };
            let body_end = body_start + next;

            // The CRLF in front of the next boundary belongs to the delimiter.
            let content_end = if self.body[body_start..body_end].ends_with(b"\r\n") {
                body_end - 2
            } else {
                body_end
            };
            let content = &self.body[body_start..content_end];
            self.body = &self.body[body_end..];

            // Skip parts whose headers are not text rather than ending the stream.
            let Ok(headers) = std::str::from_utf8(header_slice) else {
                continue;
            };
            return Some(parse_part(headers, content));
        }
    }
}

fn parse_part<'a>(headers: &'a str, body: &'a [u8]) -> Part<'a> {
    let mut part = Part {
        name: None,
        filename: None,
        content_type: None,
        body,
    };

    for line in headers.split("\r\n") {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        if key.eq_ignore_ascii_case("Content-Disposition") {
            for param in value.split(';').skip(1) {
                let Some((k, v)) = param.split_once('=') else {
                    continue;
                };
                let k = k.trim();
                if k.eq_ignore_ascii_case("name") {
                    part.name = Some(quoted(v).unwrap_or(""));
                } else if k.eq_ignore_ascii_case("filename") {
                    // Present but unquoted or empty still marks a file field.
                    part.filename = Some(quoted(v).unwrap_or(""));
                }
            }
        } else if key.eq_ignore_ascii_case("Content-Type") {
            part.content_type = Some(value.trim());
        }
    }
    part
}

fn quoted(value: &str) -> Option<&str> {
    let value = value.trim();
    let inner = value.strip_prefix('"')?;
    let end = inner.find('"')?;
    Some(&inner[..end])
}

/// The one file a multipart upload carries.
#[derive(Debug, PartialEq, Eq)]
pub struct FileField<'a> {
    pub filename: String,
    pub content_type: Option<&'a str>,
    pub content: &'a [u8],
}

/// Decoded multipart body: plain fields by name plus the first file field.
#[derive(Debug, Default)]
pub struct MultipartForm<'a> {
    pub fields: HashMap<String, String>,
    pub file: Option<FileField<'a>>,
}

/// Decode `body`; `None` when the boundary never occurs in it.
pub fn parse_form<'a>(body: &'a [u8], boundary: &str) -> Option<MultipartForm<'a>> {
    let parts = Multipart::new(body, boundary);
    parts.finder.find(body)?;

    let mut form = MultipartForm::default();
    for part in parts {
        if part.is_file() {
            if form.file.is_none() {
                form.file = Some(FileField {
                    filename: sanitize_filename(part.filename.unwrap_or("")),
                    content_type: part.content_type,
                    content: part.body,
                });
            }
        } else if let Some(name) = part.name {
            form.fields
                .insert(name.to_string(), String::from_utf8_lossy(part.body).into_owned());
        }
    }
    Some(form)
}

/// Keep only the final path component of a client-supplied filename.
pub fn sanitize_filename(raw: &str) -> String {
    let base = raw.rsplit(['/', '\\']).next().unwrap_or("").trim();
    match base {
        "" | "." | ".." => PLACEHOLDER_FILENAME.to_string(),
        name if name.contains('\0') => PLACEHOLDER_FILENAME.to_string(),
        name => name.to_string(),
    }
}
