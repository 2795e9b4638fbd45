// src/session/mod.rs
//! The session layer's doorstep. The acceptor hands every new connection
//! to a [`SessionHandler`] and never touches the descriptor again.

use std::fmt;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;

use tracing::info;

use crate::listener::close_connection;

/// Where an accepted connection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerAddr {
    /// TCP peer, IPv4 or IPv6.
    Inet(SocketAddr),
    /// Local-domain peer. The kernel rarely reports a usable path for
    /// these, so none is carried.
    Local,
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddr::Inet(addr) => write!(f, "{addr}"),
            PeerAddr::Local => f.write_str("local"),
        }
    }
}

/// OS-supplied identity of the peer process. Only local-domain
/// connections on credential-capable platforms carry a uid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerIdentity {
    Uid(u32),
    Unknown,
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerIdentity::Uid(uid) => write!(f, "uid {uid}"),
            PeerIdentity::Unknown => f.write_str("unknown"),
        }
    }
}

/// Collaborator that takes ownership of accepted connections.
pub trait SessionHandler {
    /// Called once per accepted connection. Ownership of `fd` transfers
    /// to the handler, which must eventually close it.
    fn create_session(&mut self, fd: RawFd, peer: PeerAddr, identity: PeerIdentity);
}

/// Stand-in session layer for the daemon binary: logs each connection,
/// counts it, and closes the descriptor.
#[derive(Debug, Default)]
pub struct ConnectionLogger {
    accepted: u64,
}

impl ConnectionLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }
}

impl SessionHandler for ConnectionLogger {
    fn create_session(&mut self, fd: RawFd, peer: PeerAddr, identity: PeerIdentity) {
        self.accepted += 1;
        info!(fd, %peer, %identity, total = self.accepted, "connection accepted");
        close_connection(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_identity_display() {
        assert_eq!(PeerIdentity::Uid(1000).to_string(), "uid 1000");
        assert_eq!(PeerIdentity::Unknown.to_string(), "unknown");
    }

    #[test]
    fn connection_logger_counts_and_closes() {
        let mut logger = ConnectionLogger::new();
        let fd = unsafe { libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY) };
        assert!(fd >= 0);
        logger.create_session(fd, PeerAddr::Local, PeerIdentity::Unknown);
        assert_eq!(logger.accepted(), 1);

        // the descriptor must be gone
        let rc = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        assert_eq!(rc, -1);
    }
}
