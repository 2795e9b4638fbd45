// src/listener/registry.rs

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use tracing::debug;

use super::resolver::SocketFamily;

/// The address a listening socket actually bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BoundAddr {
    Inet(SocketAddr),
    Local(PathBuf),
}

impl fmt::Display for BoundAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundAddr::Inet(addr) => write!(f, "{addr}"),
            BoundAddr::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A successfully bound and listening socket. Owned by the registry from
/// the moment `listen` succeeds until `close_all` releases it; nothing
/// else closes the descriptor.
#[derive(Debug)]
pub struct ListenSocket {
    fd: RawFd,
    family: SocketFamily,
    addr: BoundAddr,
}

impl ListenSocket {
    pub(crate) fn new(fd: RawFd, family: SocketFamily, addr: BoundAddr) -> Self {
        Self { fd, family, addr }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn family(&self) -> SocketFamily {
        self.family
    }

    pub fn addr(&self) -> &BoundAddr {
        &self.addr
    }
}

/// Descriptors for the event loop's multiplexing wait, plus the highest
/// descriptor value held.
#[derive(Debug, Default)]
pub struct ReadinessTargets {
    pub fds: Vec<RawFd>,
    pub max_fd: Option<RawFd>,
}

impl ReadinessTargets {
    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }
}

/// Ordered collection of listening sockets, unique by descriptor.
/// Append-only during startup; emptied only by [`close_all`].
///
/// Intended to be owned by the single event-loop thread.
///
/// [`close_all`]: ListenerRegistry::close_all
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    sockets: Vec<ListenSocket>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a socket that completed bind+listen. A descriptor that
    /// failed any setup step never gets here.
    pub fn register(&mut self, socket: ListenSocket) {
        debug_assert!(self.sockets.iter().all(|s| s.fd() != socket.fd()));
        debug!(
            fd = socket.fd(),
            family = %socket.family(),
            addr = %socket.addr(),
            "listener registered"
        );
        self.sockets.push(socket);
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    pub fn sockets(&self) -> &[ListenSocket] {
        &self.sockets
    }

    pub fn readiness_targets(&self) -> ReadinessTargets {
        let fds: Vec<RawFd> = self.sockets.iter().map(ListenSocket::fd).collect();
        let max_fd = fds.iter().copied().max();
        ReadinessTargets { fds, max_fd }
    }

    /// Close every held descriptor, then clear the collection. A close
    /// interrupted by a signal is retried until it completes. Calling
    /// this on an already-empty registry is a no-op.
    pub fn close_all(&mut self) {
        debug!(count = self.sockets.len(), "closing listen sockets");
        for socket in &self.sockets {
            close_retrying(socket.fd());
        }
        self.reset();
    }

    /// Clear bookkeeping without touching descriptors. Used after
    /// `close_all`, or to recover from partial construction.
    pub fn reset(&mut self) {
        self.sockets.clear();
    }
}

/// Close a connection descriptor the dispatcher handed out. Session
/// handlers that do not keep the connection use this to release it.
pub fn close_connection(fd: RawFd) {
    close_retrying(fd);
}

/// Close a descriptor, retrying while a signal interrupts the call.
pub(crate) fn close_retrying(fd: RawFd) {
    loop {
        if unsafe { libc::close(fd) } == 0 {
            return;
        }
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINTR) {
            debug!(fd, %err, "close failed");
            return;
        }
    }
}
