// src/listener/factory.rs

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::RawFd;

use tracing::{debug, warn};

use crate::platform::Capabilities;

use super::registry::{close_retrying, BoundAddr, ListenSocket};
use super::resolver::{BindTarget, SocketFamily};
use super::sockaddr;

/// Pending-connection queue depth for every listening socket.
const LISTEN_BACKLOG: libc::c_int = 5;

/// Setup failures, classified. Only [`SocketError::Bind`] is recoverable:
/// the dual-stack wildcard logic may tolerate it. Everything else means
/// the environment cannot support the configured transport and the caller
/// is expected to treat it as fatal.
#[derive(Debug, thiserror::Error)]
pub enum SocketError {
    #[error("cannot create {family} socket: {source}")]
    Create {
        family: SocketFamily,
        source: io::Error,
    },

    #[error("cannot set listen socket nonblocking: {source}")]
    Nonblocking { source: io::Error },

    #[error("cannot enable address reuse: {source}")]
    Reuse { source: io::Error },

    #[error("cannot bind to {target}: {source}")]
    Bind {
        target: BindTarget,
        source: io::Error,
    },

    #[error("cannot listen on {target}: {source}")]
    Listen {
        target: BindTarget,
        source: io::Error,
    },

    #[error("local socket path {path:?} exceeds the platform limit")]
    PathTooLong { path: std::path::PathBuf },
}

impl SocketError {
    /// True for the one failure the caller may tolerate.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, SocketError::Bind { .. })
    }
}

/// Allocate, configure, bind, and start listening on exactly one socket.
///
/// The descriptor never escapes on failure: every error path closes it,
/// so a socket that failed any setup step cannot reach the registry.
pub fn create_and_bind(
    target: &BindTarget,
    caps: &Capabilities,
) -> Result<ListenSocket, SocketError> {
    let family = target.family();
    let domain = match family {
        SocketFamily::Ipv4 => libc::AF_INET,
        SocketFamily::Ipv6 => libc::AF_INET6,
        SocketFamily::Local => libc::AF_UNIX,
    };

    // the resolver checks this too, but BindTarget is public: a path that
    // cannot fit sun_path must never bind truncated
    if let BindTarget::Local(path) = target {
        if path.as_os_str().len() >= super::resolver::local_path_limit() {
            return Err(SocketError::PathTooLong { path: path.clone() });
        }
    }

    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(SocketError::Create {
            family,
            source: io::Error::last_os_error(),
        });
    }

    if let Err(source) = set_nonblocking(fd) {
        close_retrying(fd);
        return Err(SocketError::Nonblocking { source });
    }

    if let Err(source) = enable_reuse(fd) {
        close_retrying(fd);
        return Err(SocketError::Reuse { source });
    }

    if let BindTarget::Local(path) = target {
        // a stale socket file from a previous run is expected; anything we
        // genuinely cannot reclaim surfaces as a bind failure right after
        let _ = fs::remove_file(path);
    }

    let (storage, len) = sockaddr::encode(target);
    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if rc < 0 {
        let source = io::Error::last_os_error();
        close_retrying(fd);
        return Err(SocketError::Bind {
            target: target.clone(),
            source,
        });
    }

    if unsafe { libc::listen(fd, LISTEN_BACKLOG) } < 0 {
        let source = io::Error::last_os_error();
        close_retrying(fd);
        return Err(SocketError::Listen {
            target: target.clone(),
            source,
        });
    }

    if let BindTarget::Local(path) = target {
        // allow everybody to connect
        if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o666)) {
            warn!(path = %path.display(), %err, "cannot relax socket file permissions");
        }
        if caps.supports_peer_credentials() {
            enable_peer_credentials(fd);
        }
    }

    let addr = match target {
        BindTarget::Inet(requested) => BoundAddr::Inet(
            sockaddr::bound_inet_addr(fd, family)
                .ok()
                .flatten()
                .unwrap_or(*requested),
        ),
        BindTarget::Local(path) => BoundAddr::Local(path.clone()),
    };

    debug!(fd, %addr, %family, "listening");
    Ok(ListenSocket::new(fd, family, addr))
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn enable_reuse(fd: RawFd) -> io::Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Best-effort: ask the kernel to attach peer credentials to the local
/// socket. Failing to enable this is not a setup error.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn enable_peer_credentials(fd: RawFd) {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PASSCRED,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        debug!(fd, err = %io::Error::last_os_error(), "cannot enable peer credentials");
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn enable_peer_credentials(_fd: RawFd) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps() -> Capabilities {
        Capabilities::assume(true, cfg!(any(target_os = "linux", target_os = "android")))
    }

    fn is_nonblocking(fd: RawFd) -> bool {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        flags >= 0 && (flags & libc::O_NONBLOCK) != 0
    }

    #[test]
    fn tcp_socket_is_bound_listening_and_nonblocking() {
        let target = BindTarget::Inet("127.0.0.1:0".parse().unwrap());
        let socket = create_and_bind(&target, &caps()).unwrap();

        assert_eq!(socket.family(), SocketFamily::Ipv4);
        assert!(is_nonblocking(socket.fd()));
        match socket.addr() {
            BoundAddr::Inet(addr) => assert_ne!(addr.port(), 0),
            other => panic!("unexpected bound address {other}"),
        }

        close_retrying(socket.fd());
    }

    #[test]
    fn local_socket_creates_world_accessible_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let target = BindTarget::Local(path.clone());

        let socket = create_and_bind(&target, &caps()).unwrap();
        assert_eq!(socket.family(), SocketFamily::Local);
        assert!(path.exists());

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        close_retrying(socket.fd());
    }

    #[test]
    fn rebinding_over_a_stale_socket_file_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let target = BindTarget::Local(path.clone());

        let first = create_and_bind(&target, &caps()).unwrap();
        close_retrying(first.fd());
        assert!(path.exists(), "stale socket file left behind on purpose");

        let second = create_and_bind(&target, &caps()).unwrap();
        assert!(path.exists());
        close_retrying(second.fd());
    }

    #[test]
    fn overlong_local_path_is_refused_not_truncated() {
        let path = std::path::PathBuf::from(format!(
            "/{}",
            "x".repeat(crate::listener::resolver::local_path_limit() + 16)
        ));
        let err = create_and_bind(&BindTarget::Local(path.clone()), &caps()).unwrap_err();
        assert!(matches!(err, SocketError::PathTooLong { .. }));
        assert!(!err.is_recoverable());
        // nothing may appear on the filesystem, truncated or otherwise
        assert!(!path.exists());
    }

    #[test]
    fn bind_conflict_is_the_recoverable_failure() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let target = BindTarget::Inet(format!("127.0.0.1:{port}").parse().unwrap());
        let err = create_and_bind(&target, &caps()).unwrap_err();
        assert!(err.is_recoverable());
        assert!(matches!(err, SocketError::Bind { .. }));
    }
}
