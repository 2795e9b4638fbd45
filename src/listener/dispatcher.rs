// src/listener/dispatcher.rs

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use tracing::{error, trace};

use crate::platform::Capabilities;
use crate::server::FdSet;
use crate::session::{PeerAddr, PeerIdentity, SessionHandler};

use super::registry::ListenerRegistry;
use super::resolver::SocketFamily;
use super::sockaddr;

/// Accepts pending connections on the registered sockets the multiplexer
/// reported readable and forwards each to the session collaborator.
pub struct AcceptDispatcher {
    caps: Capabilities,
}

impl AcceptDispatcher {
    pub fn new(caps: Capabilities) -> Self {
        Self { caps }
    }

    /// One event-loop iteration's worth of accepting: at most one accept
    /// per ready socket, visited in registry order. Never blocks, since
    /// every listening socket is nonblocking.
    ///
    /// "Nothing pending" and "interrupted" just mean a socket contributes
    /// no connection this iteration. Any other accept failure is logged
    /// and the loop moves on.
    ///
    /// Returns the number of connections handed to the session layer.
    pub fn dispatch(
        &self,
        registry: &ListenerRegistry,
        readable: &FdSet,
        sessions: &mut dyn SessionHandler,
    ) -> usize {
        let mut accepted = 0;

        for socket in registry.sockets() {
            if !readable.contains(socket.fd()) {
                continue;
            }

            let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept(
                    socket.fd(),
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                )
            };

            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                    _ => error!(listener = %socket.addr(), %err, "accept failed"),
                }
                continue;
            }

            let peer = peer_addr(&storage, socket.family());
            let identity = if socket.family() == SocketFamily::Local {
                peer_identity(fd, &self.caps)
            } else {
                PeerIdentity::Unknown
            };

            trace!(fd, %peer, %identity, listener = %socket.addr(), "connection accepted");
            sessions.create_session(fd, peer, identity);
            accepted += 1;
        }

        accepted
    }
}

fn peer_addr(storage: &libc::sockaddr_storage, family: SocketFamily) -> PeerAddr {
    match sockaddr::decode_inet(storage, family) {
        Some(addr) => PeerAddr::Inet(addr),
        None => PeerAddr::Local,
    }
}

/// Peer uid of a local-domain connection, when the platform can say.
fn peer_identity(fd: RawFd, caps: &Capabilities) -> PeerIdentity {
    if !caps.supports_peer_credentials() {
        return PeerIdentity::Unknown;
    }
    match peer_uid(fd) {
        Some(uid) => PeerIdentity::Uid(uid),
        None => PeerIdentity::Unknown,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn peer_uid(fd: RawFd) -> Option<u32> {
    let mut cred: libc::ucred = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut cred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return None;
    }
    Some(cred.uid)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn peer_uid(_fd: RawFd) -> Option<u32> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::factory::create_and_bind;
    use crate::listener::registry::close_retrying;
    use crate::listener::resolver::BindTarget;
    use crate::session::{PeerAddr, PeerIdentity};
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Recorder {
        sessions: Vec<(RawFd, PeerAddr, PeerIdentity)>,
    }

    impl SessionHandler for Recorder {
        fn create_session(&mut self, fd: RawFd, peer: PeerAddr, identity: PeerIdentity) {
            self.sessions.push((fd, peer, identity));
        }
    }

    fn caps() -> Capabilities {
        Capabilities::assume(true, cfg!(any(target_os = "linux", target_os = "android")))
    }

    #[test]
    fn empty_readable_set_accepts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = BindTarget::Local(dir.path().join("control.sock"));
        let socket = create_and_bind(&target, &caps()).unwrap();
        let fd = socket.fd();

        let mut registry = ListenerRegistry::new();
        registry.register(socket);

        // a connection is pending, but the readable set says nothing is
        let _client = UnixStream::connect(dir.path().join("control.sock")).unwrap();

        let mut recorder = Recorder::default();
        let dispatcher = AcceptDispatcher::new(caps());
        let accepted = dispatcher.dispatch(&registry, &FdSet::new(), &mut recorder);

        assert_eq!(accepted, 0);
        assert!(recorder.sessions.is_empty());

        close_retrying(fd);
        registry.reset();
    }

    #[test]
    fn local_connection_carries_peer_uid_when_supported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let socket = create_and_bind(&BindTarget::Local(path.clone()), &caps()).unwrap();
        let listen_fd = socket.fd();

        let mut registry = ListenerRegistry::new();
        registry.register(socket);

        let _client = UnixStream::connect(&path).unwrap();

        let mut readable = FdSet::new();
        readable.insert(listen_fd);

        let mut recorder = Recorder::default();
        let dispatcher = AcceptDispatcher::new(caps());
        let accepted = dispatcher.dispatch(&registry, &readable, &mut recorder);

        assert_eq!(accepted, 1);
        let (fd, peer, identity) = &recorder.sessions[0];
        assert_eq!(*peer, PeerAddr::Local);
        if cfg!(any(target_os = "linux", target_os = "android")) {
            let uid = unsafe { libc::getuid() };
            assert_eq!(*identity, PeerIdentity::Uid(uid));
        } else {
            assert_eq!(*identity, PeerIdentity::Unknown);
        }

        close_retrying(*fd);
        registry.close_all();
    }

    #[test]
    fn ready_socket_with_no_pending_connection_is_skipped_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let socket =
            create_and_bind(&BindTarget::Local(dir.path().join("x.sock")), &caps()).unwrap();
        let listen_fd = socket.fd();

        let mut registry = ListenerRegistry::new();
        registry.register(socket);

        // claim readability without any client; accept must see EAGAIN and
        // move on without an error
        let mut readable = FdSet::new();
        readable.insert(listen_fd);

        let mut recorder = Recorder::default();
        let accepted = AcceptDispatcher::new(caps()).dispatch(&registry, &readable, &mut recorder);

        assert_eq!(accepted, 0);
        assert!(recorder.sessions.is_empty());
        registry.close_all();
    }
}
