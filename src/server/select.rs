// src/server/select.rs
//! Thin wrapper around the `select(2)` readiness machinery. This is the
//! only place the event loop touches the raw multiplexing syscall.

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// A `select(2)` descriptor set. Descriptors must stay below
/// `FD_SETSIZE`; a handful of listeners never gets near it.
pub struct FdSet {
    raw: libc::fd_set,
}

impl FdSet {
    pub fn new() -> Self {
        let mut raw = unsafe { std::mem::zeroed::<libc::fd_set>() };
        unsafe { libc::FD_ZERO(&mut raw) };
        Self { raw }
    }

    pub fn insert(&mut self, fd: RawFd) {
        // FD_SET past FD_SETSIZE writes out of bounds; refuse outright
        assert!(
            fd >= 0 && (fd as usize) < libc::FD_SETSIZE,
            "descriptor {fd} does not fit a select(2) set"
        );
        unsafe { libc::FD_SET(fd, &mut self.raw) };
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &self.raw) }
    }

    pub(crate) fn as_mut_ptr(&mut self) -> *mut libc::fd_set {
        &mut self.raw
    }
}

impl Default for FdSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Level-triggered wait for readability on the descriptors in `read_set`,
/// for at most `timeout` (or forever when `None`). On return, `read_set`
/// holds only the descriptors that are ready.
///
/// Returns the number of ready descriptors; zero means the timeout
/// elapsed. `EINTR` comes back as `ErrorKind::Interrupted` so the caller
/// can re-check its shutdown flag.
pub fn wait_readable(
    read_set: &mut FdSet,
    max_fd: RawFd,
    timeout: Option<Duration>,
) -> io::Result<usize> {
    let mut tv = timeout.map(|t| libc::timeval {
        tv_sec: t.as_secs() as libc::time_t,
        tv_usec: t.subsec_micros() as libc::suseconds_t,
    });
    let tv_ptr = tv
        .as_mut()
        .map_or(std::ptr::null_mut(), |tv| tv as *mut libc::timeval);

    let rc = unsafe {
        libc::select(
            max_fd + 1,
            read_set.as_mut_ptr(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            tv_ptr,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(rc as usize)
}
