//! Index page composition.
//!
//! The index template carries a placeholder region between
//! [`LIST_START`] and [`LIST_END`]. Each request for the index replaces
//! whatever sits between the markers with a fresh listing of the upload
//! directory, entirely in memory.

use memchr::memmem;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::fmt::Write as _;
use std::fs::{self, DirEntry};
use std::io;
use std::path::Path;

pub const LIST_START: &str = "<!-- FILE_LIST_START -->";
pub const LIST_END: &str = "<!-- FILE_LIST_END -->";

/// Characters escaped inside a single `/uploads/<name>` path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'.')
    .remove(b'-')
    .remove(b'_')
    .remove(b'~');

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub size: u64,
}

/// Prefix of upload files still being written; never listed.
pub const PARTIAL_PREFIX: &str = ".partial-";

/// Regular files directly inside `dir`, sorted by name.
///
/// A directory that does not exist yet simply has no entries. Names that are
/// not valid UTF-8 cannot be linked and are skipped, as are files removed
/// while the scan runs.
pub fn scan(dir: &Path) -> io::Result<Vec<Entry>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    collect(dir, read)
}

fn collect(dir: &Path, items: impl Iterator<Item = io::Result<DirEntry>>) -> io::Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for item in items {
        match entry(&item?) {
            Ok(Some(entry)) => entries.push(entry),
            Ok(None) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::trace!(dir = %dir.display(), "entry vanished during scan");
            }
            Err(e) => return Err(e),
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn entry(item: &DirEntry) -> io::Result<Option<Entry>> {
    if !item.file_type()?.is_file() {
        return Ok(None);
    }
    let Ok(name) = item.file_name().into_string() else {
        tracing::debug!(path = %item.path().display(), "skipping non UTF-8 file name");
        return Ok(None);
    };
    if name.starts_with(PARTIAL_PREFIX) {
        return Ok(None);
    }
    let size = item.metadata()?.len();
    Ok(Some(Entry { name, size }))
}

/// `512 B`, `1.5 KB`, `3.0 MB`, `1.2 GB`
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 3] = ["KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.1} {}", UNITS[unit])
}

pub fn render_entries(entries: &[Entry]) -> String {
    if entries.is_empty() {
        return "<li class=\"empty\">No files uploaded yet</li>\n".to_string();
    }

    let mut out = String::with_capacity(entries.len() * 256);
    for entry in entries {
        let href = utf8_percent_encode(&entry.name, SEGMENT);
        let text = html_escape::encode_text(&entry.name);
        let value = html_escape::encode_double_quoted_attribute(&entry.name);
        let _ = writeln!(
            out,
            "<li><a href=\"/uploads/{href}\">{text}</a> <span class=\"size\">{size}</span> \
             <form method=\"post\" action=\"/delete\" class=\"delete\">\
             <input type=\"hidden\" name=\"filename\" value=\"{value}\">\
             <button type=\"submit\">Delete</button></form></li>",
            size = human_size(entry.size),
        );
    }
    out
}

/// Replace the region between the markers (markers kept) with `list`.
/// A template lacking either marker comes back unchanged.
pub fn compose(template: &[u8], list: &str) -> Vec<u8> {
    let Some(start) = memmem::find(template, LIST_START.as_bytes()) else {
        return template.to_vec();
    };
    let open_end = start + LIST_START.len();
    let Some(close) = memmem::find(&template[open_end..], LIST_END.as_bytes()) else {
        return template.to_vec();
    };
    let close = open_end + close;

    let mut page = Vec::with_capacity(template.len() + list.len() + 2);
    page.extend_from_slice(&template[..open_end]);
    page.push(b'\n');
    page.extend_from_slice(list.as_bytes());
    page.extend_from_slice(&template[close..]);
    page
}

/// Full index page for the current contents of `upload_dir`.
pub fn render_index(template: &[u8], upload_dir: &Path) -> io::Result<Vec<u8>> {
    let entries = scan(upload_dir)?;
    Ok(compose(template, &render_entries(&entries)))
}
