//! Owned read-only file mappings.
//!
//! A [`MappedFile`] is the zero-copy body of a response. It belongs to exactly
//! one connection and is unmapped exactly once, when it is dropped: after the
//! write completes, when an error aborts the response, or when the connection
//! is reset or closed.

use crate::syscalls;
use libc::c_void;
use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::ptr::NonNull;

pub struct MappedFile {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: the mapping is private and read-only; the pointer is never handed
// out mutably and the region outlives every slice borrowed from it.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    /// Map the whole of `file`. Its length is read from the open descriptor so
    /// the mapping matches what was opened, not an earlier `stat`.
    pub fn map(file: &File) -> io::Result<Self> {
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file too large to map"))?;

        if len == 0 {
            // mmap rejects zero-length mappings; an empty body needs none.
            return Ok(Self {
                ptr: NonNull::dangling(),
                len: 0,
            });
        }

        let addr = syscalls::mmap_readonly(file.as_raw_fd(), len)?;
        let ptr = NonNull::new(addr as *mut u8)
            .ok_or_else(|| io::Error::other("mmap returned a null address"))?;
        Ok(Self { ptr, len })
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr/len describe a live mapping (or a dangling, empty one).
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if self.len > 0 {
            // Safety: created by mmap_readonly with this exact length, and
            // dropping consumes the only owner.
            unsafe { syscalls::munmap(self.ptr.as_ptr() as *mut c_void, self.len) };
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn maps_file_contents() {
        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(b"mapped bytes").unwrap();
        let file = File::open(tmp.path()).unwrap();

        let mapped = MappedFile::map(&file).unwrap();
        assert_eq!(mapped.len(), 12);
        assert_eq!(mapped.as_slice(), b"mapped bytes");
    }

    #[test]
    fn empty_file_maps_to_empty_region() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let file = File::open(tmp.path()).unwrap();

        let mapped = MappedFile::map(&file).unwrap();
        assert!(mapped.is_empty());
        assert_eq!(mapped.as_slice(), b"");
    }
}
