// src/syscalls.rs
use crate::error::ServerResult;
use libc::{c_int, c_void};
use std::io;
use std::ptr;

// ---- Epoll Operations (Linux Only) ----

pub use libc::epoll_event;

/// Flags every connection registration carries: edge-triggered, disarmed after
/// one delivery, and told about peer half-close.
pub const CONN_FLAGS: u32 = (libc::EPOLLET | libc::EPOLLONESHOT | libc::EPOLLRDHUP) as u32;

/// Readiness bits that mean the peer is gone or the socket is broken.
pub const HANGUP_FLAGS: u32 = (libc::EPOLLRDHUP | libc::EPOLLHUP | libc::EPOLLERR) as u32;

pub const EPOLLIN: u32 = libc::EPOLLIN as u32;
pub const EPOLLOUT: u32 = libc::EPOLLOUT as u32;

/// The single direction a connection is armed for at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
}

impl Interest {
    /// Full one-shot event mask for a connection armed in this direction.
    #[inline]
    pub fn one_shot(self) -> u32 {
        let dir = match self {
            Interest::Read => EPOLLIN,
            Interest::Write => EPOLLOUT,
        };
        dir | CONN_FLAGS
    }
}

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> ServerResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register a descriptor with the exact event mask given.
    pub fn add(&self, fd: c_int, token: u64, events: u32) -> ServerResult<()> {
        let mut event = epoll_event { events, u64: token };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Replace a descriptor's event mask. For one-shot registrations this is
    /// the re-arm; the kernel re-checks readiness immediately.
    pub fn modify(&self, fd: c_int, token: u64, events: u32) -> ServerResult<()> {
        let mut event = epoll_event { events, u64: token };

        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn delete(&self, fd: c_int) -> ServerResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> ServerResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Memory Mapping ----

/// Map `len` bytes of `fd` read-only and private. `len` must be non-zero.
pub fn mmap_readonly(fd: c_int, len: usize) -> io::Result<*mut c_void> {
    unsafe {
        let addr = libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ,
            libc::MAP_PRIVATE,
            fd,
            0,
        );
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(addr)
    }
}

/// # Safety
/// `addr`/`len` must be exactly a live mapping returned by [`mmap_readonly`],
/// and nothing may reference it afterwards.
pub unsafe fn munmap(addr: *mut c_void, len: usize) {
    unsafe {
        libc::munmap(addr, len);
    }
}

// ---- Process ----

/// Writes to a reset socket must surface as `EPIPE`, not kill the process.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}
