// src/listener/resolver.rs

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

use tracing::debug;

use crate::platform::Capabilities;

/// Address family of a bind target or bound socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketFamily {
    Ipv4,
    Ipv6,
    Local,
}

impl fmt::Display for SocketFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketFamily::Ipv4 => f.write_str("IPv4"),
            SocketFamily::Ipv6 => f.write_str("IPv6"),
            SocketFamily::Local => f.write_str("local"),
        }
    }
}

/// One intended binding. Produced by [`resolve`], consumed exactly once by
/// the socket factory, and not retained afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindTarget {
    /// IPv4 or IPv6 address plus port; a wildcard bind carries the
    /// unspecified address of its family.
    Inet(SocketAddr),
    /// Local-domain socket addressed by filesystem path; no port.
    Local(PathBuf),
}

impl BindTarget {
    pub fn family(&self) -> SocketFamily {
        match self {
            BindTarget::Inet(addr) if addr.is_ipv4() => SocketFamily::Ipv4,
            BindTarget::Inet(_) => SocketFamily::Ipv6,
            BindTarget::Local(_) => SocketFamily::Local,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            BindTarget::Inet(addr) => Some(addr.port()),
            BindTarget::Local(_) => None,
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, BindTarget::Inet(addr) if addr.ip().is_unspecified())
    }
}

impl fmt::Display for BindTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindTarget::Inet(addr) => write!(f, "{addr}"),
            BindTarget::Local(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("local socket path {path:?} exceeds the platform limit of {limit} bytes")]
    PathTooLong { path: PathBuf, limit: usize },

    #[error("cannot look up host {host:?}: {source}")]
    HostLookup {
        host: String,
        source: std::io::Error,
    },

    #[error("host {host:?} did not resolve to any address")]
    NoAddresses { host: String },
}

/// Turn one configured bind entry (or its absence) plus a port into the
/// concrete targets to bind, in the order they must be attempted.
///
/// - absent or `"any"`: the IPv6 wildcard first (when the platform has
///   IPv6 at all), then always the IPv4 wildcard;
/// - a string starting with `/`: a single local-domain target, checked
///   against the platform path limit before anything touches the
///   filesystem;
/// - anything else: system name resolution, one target per address of any
///   family, each carrying the configured port.
pub fn resolve(
    bind_spec: Option<&str>,
    port: u16,
    caps: &Capabilities,
) -> Result<Vec<BindTarget>, ResolveError> {
    match bind_spec {
        None | Some("any") => {
            debug!("binding to any address");
            let mut targets = Vec::with_capacity(2);
            if caps.supports_ipv6() {
                targets.push(BindTarget::Inet(SocketAddr::new(
                    IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                    port,
                )));
            }
            targets.push(BindTarget::Inet(SocketAddr::new(
                IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port,
            )));
            Ok(targets)
        }
        Some(path) if path.starts_with('/') => {
            let limit = local_path_limit();
            // one byte of sun_path stays reserved for the terminating NUL
            if path.len() >= limit {
                return Err(ResolveError::PathTooLong {
                    path: PathBuf::from(path),
                    limit,
                });
            }
            Ok(vec![BindTarget::Local(PathBuf::from(path))])
        }
        Some(host) => {
            debug!(host, "resolving bind address");
            let addrs: Vec<SocketAddr> = (host, port)
                .to_socket_addrs()
                .map_err(|source| ResolveError::HostLookup {
                    host: host.to_string(),
                    source,
                })?
                .collect();
            if addrs.is_empty() {
                return Err(ResolveError::NoAddresses {
                    host: host.to_string(),
                });
            }
            Ok(addrs.into_iter().map(BindTarget::Inet).collect())
        }
    }
}

/// Capacity of `sockaddr_un.sun_path` on this platform.
pub(crate) fn local_path_limit() -> usize {
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}
