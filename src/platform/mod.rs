// src/platform/mod.rs
//! Runtime capability probing.
//!
//! Family and feature selection is a runtime decision: the resolver asks
//! whether IPv6 sockets can be created at all, and the socket factory asks
//! whether the platform can deliver peer credentials on local sockets.

use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    ipv6: bool,
    peer_credentials: bool,
}

impl Capabilities {
    /// Probe the running system once, at startup.
    pub fn detect() -> Self {
        let caps = Self {
            ipv6: probe_ipv6(),
            peer_credentials: cfg!(any(target_os = "linux", target_os = "android")),
        };
        debug!(
            ipv6 = caps.ipv6,
            peer_credentials = caps.peer_credentials,
            "platform capabilities detected"
        );
        caps
    }

    /// Construct fixed capabilities, bypassing the probe. Useful in tests
    /// and for embedders that want to force a single stack.
    pub fn assume(ipv6: bool, peer_credentials: bool) -> Self {
        Self {
            ipv6,
            peer_credentials,
        }
    }

    pub fn supports_ipv6(&self) -> bool {
        self.ipv6
    }

    pub fn supports_peer_credentials(&self) -> bool {
        self.peer_credentials
    }
}

/// An IPv6 stream socket either can be created or it cannot; that is the
/// whole probe.
fn probe_ipv6() -> bool {
    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return false;
    }
    unsafe { libc::close(fd) };
    true
}
