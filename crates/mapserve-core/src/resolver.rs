//! Maps a parsed request onto the document root and the upload directory.
//!
//! Every outcome is an [`HttpCode`] plus, for successful ones, the body that
//! goes out with it. All filesystem work here (stat, open, mmap, directory
//! scans, upload writes, deletes) runs on a worker thread.

use crate::http::{HttpCode, Method, Request};
use crate::listing;
use crate::mmap::MappedFile;
use crate::multipart::{self, FileField};
use crate::parser;
use crate::response::{self, Body};
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const INDEX_DOC: &str = "index.html";
pub const UPLOAD_SUCCESS_DOC: &str = "upload_success.html";
pub const DELETE_SUCCESS_DOC: &str = "delete_success.html";

/// URL prefix under which uploaded files are served.
pub const UPLOADS_PREFIX: &str = "/uploads/";

const WORLD_READABLE: u32 = 0o004;
const UPLOAD_MODE: u32 = 0o644;

/// What a request resolved to.
#[derive(Debug)]
pub struct Resolution {
    pub code: HttpCode,
    pub body: Body,
    pub content_type: &'static str,
    /// Set for `.txt` files from the upload directory so browsers download them.
    pub attachment: Option<String>,
}

impl Resolution {
    pub fn failed(code: HttpCode) -> Self {
        Self {
            code,
            body: Body::Empty,
            content_type: "text/html",
            attachment: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolver {
    doc_root: PathBuf,
    upload_dir: PathBuf,
}

impl Resolver {
    pub fn new(doc_root: impl Into<PathBuf>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            doc_root: doc_root.into(),
            upload_dir: upload_dir.into(),
        }
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    /// Resolve a complete request. `body` is exactly `Content-Length` bytes.
    pub fn resolve(&self, req: &mut Request, body: &[u8]) -> Resolution {
        match req.method {
            Method::Get => self.get(&req.path),
            Method::Post => match req.path.as_str() {
                "/upload" => self.upload(req, body),
                "/delete" => self.delete(body),
                other => {
                    tracing::debug!(path = other, "POST to unknown path");
                    Resolution::failed(HttpCode::BadRequest)
                }
            },
        }
    }

    fn get(&self, path: &str) -> Resolution {
        if path == "/" || path == "/index.html" {
            return self.index();
        }

        if let Some(name) = path.strip_prefix(UPLOADS_PREFIX) {
            if name.is_empty() {
                return self.serve_file(&self.upload_dir, true);
            }
            return match single_component(name) {
                Some(name) => self.serve_file(&self.upload_dir.join(name), true),
                None => Resolution::failed(HttpCode::Forbidden),
            };
        }

        match relative_path(path) {
            Some(rel) => self.serve_file(&self.doc_root.join(rel), false),
            None => Resolution::failed(HttpCode::Forbidden),
        }
    }

    /// The index template with the upload listing substituted in.
    fn index(&self) -> Resolution {
        let path = self.doc_root.join(INDEX_DOC);
        if let Err(code) = check_servable(&path) {
            return Resolution::failed(code);
        }
        let template = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "cannot read index template");
                return Resolution::failed(HttpCode::InternalError);
            }
        };

        let page = match listing::render_index(&template, &self.upload_dir) {
            Ok(page) => page,
            Err(e) => {
                tracing::warn!(dir = %self.upload_dir.display(), error = %e, "cannot list uploads");
                listing::compose(&template, &listing::render_entries(&[]))
            }
        };

        Resolution {
            code: HttpCode::FileReady,
            body: Body::Rendered(page),
            content_type: "text/html",
            attachment: None,
        }
    }

    fn upload(&self, req: &mut Request, body: &[u8]) -> Resolution {
        let Some(boundary) = req.boundary.as_deref() else {
            return Resolution::failed(HttpCode::BadRequest);
        };
        let Some(form) = multipart::parse_form(body, boundary) else {
            tracing::debug!("multipart boundary not found in body");
            return Resolution::failed(HttpCode::BadRequest);
        };
        let Some(file) = form.file else {
            tracing::debug!(fields = form.fields.len(), "upload without a file part");
            return Resolution::failed(HttpCode::BadRequest);
        };

        if let Err(e) = self.persist_upload(&file) {
            tracing::error!(file = %file.filename, error = %e, "failed to store upload");
            return Resolution::failed(HttpCode::InternalError);
        }
        tracing::info!(file = %file.filename, bytes = file.content.len(), "upload stored");
        req.upload_filename = Some(file.filename);

        let mut done = self.serve_file(&self.doc_root.join(UPLOAD_SUCCESS_DOC), false);
        if done.code == HttpCode::FileReady {
            done.code = HttpCode::UploadHandled;
        }
        done
    }

    /// Write an uploaded file into the upload directory, replacing any file
    /// with the same name.
    ///
    /// The bytes land in a temporary file next to the target, which is then
    /// renamed over it. Responses still sending the old file keep mapping the
    /// old inode.
    pub fn persist_upload(&self, file: &FileField<'_>) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.upload_dir)?;
        let path = self.upload_dir.join(&file.filename);
        let mut out = tempfile::Builder::new()
            .prefix(listing::PARTIAL_PREFIX)
            .tempfile_in(&self.upload_dir)?;
        // Exact mode, regardless of umask.
        out.as_file()
            .set_permissions(fs::Permissions::from_mode(UPLOAD_MODE))?;
        out.write_all(file.content)?;
        out.persist(&path)?;
        Ok(path)
    }

    fn delete(&self, body: &[u8]) -> Resolution {
        let Some(name) = parser::decode_delete_form(body) else {
            return Resolution::failed(HttpCode::BadRequest);
        };
        let Some(name) = single_component(&name) else {
            tracing::warn!(file = %name, "rejected delete outside the upload directory");
            return Resolution::failed(HttpCode::Forbidden);
        };

        let target = self.upload_dir.join(name);
        match fs::symlink_metadata(&target) {
            Ok(meta) if meta.file_type().is_file() => match fs::remove_file(&target) {
                Ok(()) => tracing::info!(file = name, "upload deleted"),
                Err(e) => tracing::warn!(file = name, error = %e, "delete failed"),
            },
            Ok(_) => tracing::warn!(file = name, "delete target is not a regular file"),
            Err(e) => tracing::warn!(file = name, error = %e, "delete target missing"),
        }

        self.serve_file(&self.doc_root.join(DELETE_SUCCESS_DOC), false)
    }

    /// Stat, open and map `path`.
    fn serve_file(&self, path: &Path, in_uploads: bool) -> Resolution {
        if let Err(code) = check_servable(path) {
            return Resolution::failed(code);
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "open failed after stat");
                return Resolution::failed(HttpCode::InternalError);
            }
        };
        let map = match MappedFile::map(&file) {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "mmap failed");
                return Resolution::failed(HttpCode::InternalError);
            }
        };

        let attachment = (in_uploads && has_extension(path, "txt"))
            .then(|| path.file_name().map(|n| n.to_string_lossy().into_owned()))
            .flatten();

        Resolution {
            code: HttpCode::FileReady,
            body: Body::Mapped(map),
            content_type: response::content_type(path, in_uploads),
            attachment,
        }
    }
}

/// Missing => 404, not world-readable => 403, directory => 400.
fn check_servable(path: &Path) -> Result<(), HttpCode> {
    let meta = fs::metadata(path).map_err(|_| HttpCode::NoResource)?;
    if meta.permissions().mode() & WORLD_READABLE == 0 {
        return Err(HttpCode::Forbidden);
    }
    if meta.is_dir() {
        return Err(HttpCode::BadRequest);
    }
    Ok(())
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

/// `name` if it is exactly one ordinary path component.
fn single_component(name: &str) -> Option<&str> {
    let ok = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0']);
    ok.then_some(name)
}

/// A request path made relative to the document root, or `None` if any
/// segment would step outside it.
fn relative_path(path: &str) -> Option<PathBuf> {
    let mut rel = PathBuf::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains(['\\', '\0']) {
            return None;
        }
        rel.push(segment);
    }
    Some(rel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::Permissions;

    struct Site {
        _dir: tempfile::TempDir,
        resolver: Resolver,
    }

    fn site() -> Site {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("root");
        fs::create_dir_all(root.join("css")).unwrap();
        fs::write(
            root.join(INDEX_DOC),
            "<ul><!-- FILE_LIST_START --><!-- FILE_LIST_END --></ul>",
        )
        .unwrap();
        fs::write(root.join(UPLOAD_SUCCESS_DOC), "uploaded").unwrap();
        fs::write(root.join(DELETE_SUCCESS_DOC), "deleted").unwrap();
        fs::write(root.join("css/site.css"), "body{}").unwrap();
        for name in [INDEX_DOC, UPLOAD_SUCCESS_DOC, DELETE_SUCCESS_DOC, "css/site.css"] {
            fs::set_permissions(root.join(name), Permissions::from_mode(0o644)).unwrap();
        }
        let uploads = root.join("uploads");
        Site {
            resolver: Resolver::new(&root, &uploads),
            _dir: dir,
        }
    }

    fn get(path: &str) -> Request {
        Request {
            method: Method::Get,
            path: path.to_string(),
            ..Request::default()
        }
    }

    #[test]
    fn serves_static_files_with_content_type() {
        let site = site();
        let res = site.resolver.resolve(&mut get("/css/site.css"), b"");
        assert_eq!(res.code, HttpCode::FileReady);
        assert_eq!(res.body.as_slice(), b"body{}");
        assert_eq!(res.content_type, "text/css");
    }

    #[test]
    fn stat_outcomes() {
        let site = site();
        let root = site.resolver.doc_root().to_path_buf();

        assert_eq!(site.resolver.resolve(&mut get("/nope"), b"").code, HttpCode::NoResource);
        assert_eq!(site.resolver.resolve(&mut get("/css"), b"").code, HttpCode::BadRequest);

        fs::write(root.join("secret.txt"), "x").unwrap();
        fs::set_permissions(root.join("secret.txt"), Permissions::from_mode(0o600)).unwrap();
        assert_eq!(site.resolver.resolve(&mut get("/secret.txt"), b"").code, HttpCode::Forbidden);
    }

    #[test]
    fn traversal_is_forbidden() {
        let site = site();
        for path in ["/../etc/passwd", "/css/../index.html", "/./index.html", "/uploads/..", "/uploads/a/b"] {
            assert_eq!(
                site.resolver.resolve(&mut get(path), b"").code,
                HttpCode::Forbidden,
                "{path}"
            );
        }
    }

    #[test]
    fn index_lists_uploads() {
        let site = site();
        let res = site.resolver.resolve(&mut get("/"), b"");
        assert_eq!(res.code, HttpCode::FileReady);
        assert!(String::from_utf8_lossy(res.body.as_slice()).contains("No files uploaded yet"));

        fs::create_dir_all(site.resolver.upload_dir()).unwrap();
        fs::write(site.resolver.upload_dir().join("one.txt"), "1").unwrap();
        let res = site.resolver.resolve(&mut get("/index.html"), b"");
        let page = String::from_utf8_lossy(res.body.as_slice()).into_owned();
        assert!(page.contains("/uploads/one.txt"));
        assert!(page.starts_with("<ul><!-- FILE_LIST_START -->"));
        assert!(page.ends_with("<!-- FILE_LIST_END --></ul>"));
    }

    #[test]
    fn upload_then_serve_then_delete() {
        let site = site();
        let boundary = "XyZ";
        let body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
             Content-Type: text/plain\r\n\r\nhello upload\r\n--{boundary}--\r\n"
        );
        let mut req = Request {
            method: Method::Post,
            path: "/upload".to_string(),
            boundary: Some(boundary.to_string()),
            content_length: body.len(),
            ..Request::default()
        };

        let res = site.resolver.resolve(&mut req, body.as_bytes());
        assert_eq!(res.code, HttpCode::UploadHandled);
        assert_eq!(res.body.as_slice(), b"uploaded");
        assert_eq!(req.upload_filename.as_deref(), Some("notes.txt"));

        let stored = site.resolver.upload_dir().join("notes.txt");
        let mode = fs::metadata(&stored).unwrap().permissions().mode();
        assert_eq!(mode & 0o004, 0o004);

        let res = site.resolver.resolve(&mut get("/uploads/notes.txt"), b"");
        assert_eq!(res.code, HttpCode::FileReady);
        assert_eq!(res.body.as_slice(), b"hello upload");
        assert_eq!(res.attachment.as_deref(), Some("notes.txt"));

        let mut del = Request {
            method: Method::Post,
            path: "/delete".to_string(),
            ..Request::default()
        };
        let res = site.resolver.resolve(&mut del, b"filename=notes.txt");
        assert_eq!(res.body.as_slice(), b"deleted");
        assert!(!stored.exists());
        assert_eq!(
            site.resolver.resolve(&mut get("/uploads/notes.txt"), b"").code,
            HttpCode::NoResource
        );
    }

    #[test]
    fn reupload_does_not_change_a_body_already_resolved() {
        let site = site();
        let upload = |byte: u8, len: usize| {
            let content = vec![byte; len];
            site.resolver
                .persist_upload(&FileField {
                    filename: "a.bin".to_string(),
                    content_type: None,
                    content: &content,
                })
                .unwrap();
        };

        upload(b'A', 8192);
        let served = site.resolver.resolve(&mut get("/uploads/a.bin"), b"");
        assert_eq!(served.code, HttpCode::FileReady);

        // Same length, then shorter: neither may reach the held mapping.
        upload(b'B', 8192);
        upload(b'C', 16);
        assert_eq!(served.body.as_slice().len(), 8192);
        assert!(served.body.as_slice().iter().all(|&b| b == b'A'));

        let fresh = site.resolver.resolve(&mut get("/uploads/a.bin"), b"");
        assert_eq!(fresh.body.as_slice(), &[b'C'; 16][..]);

        let stored = site.resolver.upload_dir().join("a.bin");
        assert_eq!(fs::metadata(&stored).unwrap().permissions().mode() & 0o777, 0o644);
        let leftovers = fs::read_dir(site.resolver.upload_dir())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(listing::PARTIAL_PREFIX))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn delete_is_best_effort_but_confined() {
        let site = site();
        let mut del = Request {
            method: Method::Post,
            path: "/delete".to_string(),
            ..Request::default()
        };
        let res = site.resolver.resolve(&mut del, b"filename=missing.bin");
        assert_eq!(res.code, HttpCode::FileReady);

        let res = site.resolver.resolve(&mut del, b"filename=..%2Findex.html");
        assert_eq!(res.code, HttpCode::Forbidden);
        assert!(site.resolver.doc_root().join(INDEX_DOC).exists());

        assert_eq!(site.resolver.resolve(&mut del, b"").code, HttpCode::BadRequest);
    }

    #[test]
    fn upload_without_file_or_to_other_paths_is_bad() {
        let site = site();
        let body = "--b\r\nContent-Disposition: form-data; name=\"note\"\r\n\r\nhi\r\n--b--\r\n";
        let mut req = Request {
            method: Method::Post,
            path: "/upload".to_string(),
            boundary: Some("b".to_string()),
            ..Request::default()
        };
        assert_eq!(site.resolver.resolve(&mut req, body.as_bytes()).code, HttpCode::BadRequest);

        req.path = "/elsewhere".to_string();
        assert_eq!(site.resolver.resolve(&mut req, body.as_bytes()).code, HttpCode::BadRequest);

        req.path = "/upload".to_string();
        req.boundary = None;
        assert_eq!(site.resolver.resolve(&mut req, body.as_bytes()).code, HttpCode::BadRequest);
    }
}
