// src/server/mod.rs
//! Startup wiring and the single-threaded accept loop.
//!
//! Everything fatal happens in [`ServerBuilder::bind`], before the loop
//! starts serving. Once [`Server::serve`] runs, the listener set is fixed
//! and the only errors left are transient or logged accept errors.

mod select;

pub use select::{wait_readable, FdSet};

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::listener::{
    create_and_bind, resolve, AcceptDispatcher, ListenerRegistry, SocketError, SocketFamily,
};
use crate::platform::Capabilities;
use crate::session::SessionHandler;

/// How long one multiplexing wait may last before the loop re-checks the
/// shutdown flag.
const WAIT_INTERVAL: Duration = Duration::from_secs(1);

/// Set from the signal handler, the only thing a signal handler may
/// safely do here.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn request_shutdown(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Builder so `main.rs` can inject its session handler.
pub struct ServerBuilder<H: SessionHandler> {
    config: Config,
    handler: Option<H>,
}

impl<H: SessionHandler> ServerBuilder<H> {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            handler: None,
        }
    }

    /// Inject the collaborator that takes ownership of accepted
    /// connections.
    pub fn with_handler(mut self, handler: H) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Perform every piece of fatal startup work: capability probe, stdin
    /// hygiene, address resolution, and socket setup. Any error returned
    /// here is a startup error; the caller decides to terminate, nothing
    /// below it does.
    pub fn bind(self) -> Result<Server<H>> {
        let handler = self
            .handler
            .context("handler must be set via with_handler()")?;

        let caps = Capabilities::detect();
        redirect_stdin()?;

        let port = self.config.port;
        let entries: Vec<Option<&str>> = if self.config.bind_addresses.is_empty() {
            vec![None]
        } else {
            self.config
                .bind_addresses
                .iter()
                .map(|s| Some(s.as_str()))
                .collect()
        };

        let mut registry = ListenerRegistry::new();
        for spec in entries {
            if let Err(err) = bind_entry(spec, port, &caps, &mut registry) {
                registry.close_all();
                return Err(err);
            }
        }

        info!(listeners = registry.len(), port, "startup complete");
        Ok(Server {
            registry,
            dispatcher: AcceptDispatcher::new(caps),
            handler,
            port,
        })
    }
}

/// Bind every target one configured entry resolves to.
///
/// Wildcard entries get the dual-stack tolerance rules: a failed IPv6
/// wildcard bind is tolerated (the IPv4 attempt follows), and a failed
/// IPv4 wildcard bind is tolerated only when IPv6 already bound. Both
/// failing is fatal. Every other target must bind.
fn bind_entry(
    spec: Option<&str>,
    port: u16,
    caps: &Capabilities,
    registry: &mut ListenerRegistry,
) -> Result<()> {
    let targets = resolve(spec, port, caps)?;
    let wildcard = matches!(spec, None | Some("any"));
    let mut ipv6_bound = false;

    for target in targets {
        let family = target.family();
        match create_and_bind(&target, caps) {
            Ok(socket) => {
                if family == SocketFamily::Ipv6 {
                    ipv6_bound = true;
                }
                registry.register(socket);
            }
            Err(err) => {
                let recoverable = wildcard && err.is_recoverable();
                if recoverable && family == SocketFamily::Ipv6 {
                    debug!(%err, "IPv6 wildcard bind failed, trying IPv4");
                    continue;
                }
                if recoverable && family == SocketFamily::Ipv4 && ipv6_bound {
                    debug!(%err, "IPv4 wildcard bind failed, already listening on IPv6");
                    continue;
                }
                if wildcard && matches!(err, SocketError::Bind { .. }) {
                    return Err(anyhow::Error::new(err).context(format!(
                        "unable to bind port {port} (is harmonyd already running?)"
                    )));
                }
                return Err(err.into());
            }
        }
    }

    Ok(())
}

/// Single-threaded accept server: owns the listener registry and drives
/// the level-triggered readiness loop.
pub struct Server<H: SessionHandler> {
    registry: ListenerRegistry,
    dispatcher: AcceptDispatcher,
    handler: H,
    port: u16,
}

impl<H: SessionHandler> Server<H> {
    /// The configured port every non-local listener shares.
    pub fn bound_port(&self) -> u16 {
        self.port
    }

    pub fn listener_count(&self) -> usize {
        self.registry.len()
    }

    /// Run until a termination signal arrives, then close every listener.
    pub fn serve(mut self) -> Result<()> {
        install_signal_handlers()?;
        info!("serving");

        while !SHUTDOWN.load(Ordering::SeqCst) {
            let targets = self.registry.readiness_targets();
            let Some(max_fd) = targets.max_fd else {
                break;
            };

            let mut read_set = FdSet::new();
            for fd in &targets.fds {
                read_set.insert(*fd);
            }

            match wait_readable(&mut read_set, max_fd, Some(WAIT_INTERVAL)) {
                // timeout: nothing ready, re-check the shutdown flag
                Ok(0) => continue,
                Ok(_) => {
                    self.dispatcher
                        .dispatch(&self.registry, &read_set, &mut self.handler);
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(%err, "select failed");
                    self.shutdown();
                    return Err(err.into());
                }
            }
        }

        info!("shutting down");
        self.shutdown();
        Ok(())
    }

    /// Close every listener. Idempotent; after this,
    /// `readiness_targets()` is empty.
    pub fn shutdown(&mut self) {
        self.registry.close_all();
        self.registry.reset();
    }
}

fn install_signal_handlers() -> io::Result<()> {
    for sig in [libc::SIGINT, libc::SIGTERM] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        unsafe { libc::sigemptyset(&mut action.sa_mask) };
        let handler = request_shutdown as extern "C" fn(libc::c_int);
        action.sa_sigaction = handler as libc::sighandler_t;
        // no SA_RESTART: select must come back with EINTR so the loop
        // notices the flag
        if unsafe { libc::sigaction(sig, &action, std::ptr::null_mut()) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Keep fd 0 pointing somewhere harmless so no library (or our own code)
/// ever mistakes a freshly accepted connection descriptor for stdin.
fn redirect_stdin() -> Result<()> {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(libc::STDIN_FILENO, &mut stat) } < 0 {
        // stdin is closed; claim fd 0 before the first socket does
        let fd = unsafe {
            libc::open(
                b"/dev/null\0".as_ptr() as *const libc::c_char,
                libc::O_RDONLY,
            )
        };
        if fd == libc::STDIN_FILENO {
            debug!("stdin was closed, now reads /dev/null");
        } else if fd > libc::STDIN_FILENO {
            // something else already holds fd 0
            unsafe { libc::close(fd) };
        }
        return Ok(());
    }

    if unsafe { libc::isatty(libc::STDIN_FILENO) } == 0 {
        return Ok(());
    }

    let fd = unsafe {
        libc::open(
            b"/dev/null\0".as_ptr() as *const libc::c_char,
            libc::O_RDONLY,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error()).context("cannot open /dev/null");
    }
    if unsafe { libc::dup2(fd, libc::STDIN_FILENO) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err).context("cannot redirect stdin to /dev/null");
    }
    if fd != libc::STDIN_FILENO {
        unsafe { libc::close(fd) };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::RawFd;

    fn caps() -> Capabilities {
        Capabilities::detect()
    }

    /// Occupy the IPv6 wildcard on an ephemeral port with a V6ONLY
    /// socket, leaving the IPv4 wildcard on that port free. Returns the
    /// holder descriptor and the port.
    fn hold_v6only_wildcard() -> Option<(RawFd, u16)> {
        let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return None;
        }
        let on: libc::c_int = 1;
        let rc = unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);

        let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(unsafe { libc::listen(fd, 1) }, 0);

        let mut bound: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(fd, &mut bound as *mut _ as *mut libc::sockaddr, &mut len)
        };
        assert_eq!(rc, 0);
        Some((fd, u16::from_be(bound.sin6_port)))
    }

    #[test]
    fn wildcard_entry_binds_one_socket_per_available_family() {
        let caps = caps();
        let mut registry = ListenerRegistry::new();
        bind_entry(None, 0, &caps, &mut registry).unwrap();

        let expected = if caps.supports_ipv6() { 2 } else { 1 };
        assert_eq!(registry.len(), expected);
        registry.close_all();
    }

    #[test]
    fn wildcard_without_ipv6_still_binds_ipv4() {
        let caps = Capabilities::assume(false, false);
        let mut registry = ListenerRegistry::new();
        bind_entry(Some("any"), 0, &caps, &mut registry).unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sockets()[0].family(), SocketFamily::Ipv4);
        registry.close_all();
    }

    #[test]
    fn explicit_address_entry_keeps_the_configured_port() {
        let caps = caps();
        let mut registry = ListenerRegistry::new();
        bind_entry(Some("127.0.0.1"), 0, &caps, &mut registry).unwrap();
        assert_eq!(registry.len(), 1);
        registry.close_all();
    }

    #[test]
    fn ipv6_wildcard_conflict_falls_back_to_ipv4() {
        let caps = caps();
        if !caps.supports_ipv6() {
            return;
        }
        let (holder, port) = hold_v6only_wildcard().unwrap();

        // the IPv6 wildcard is taken, the IPv4 wildcard is free: the
        // entry must still bind, with exactly one IPv4 listener
        let mut registry = ListenerRegistry::new();
        bind_entry(None, port, &caps, &mut registry).unwrap();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.sockets()[0].family(), SocketFamily::Ipv4);

        registry.close_all();
        unsafe { libc::close(holder) };
    }

    #[test]
    fn wildcard_bind_is_fatal_when_both_families_fail() {
        let caps = caps();
        if !caps.supports_ipv6() {
            return;
        }

        // occupy both wildcards on the same port
        let held_v4 = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = held_v4.local_addr().unwrap().port();
        let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        let on: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &on as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
        let mut addr: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(unsafe { libc::listen(fd, 1) }, 0);

        let mut registry = ListenerRegistry::new();
        let err = bind_entry(None, port, &caps, &mut registry).unwrap_err();
        assert!(err.to_string().contains(&port.to_string()));
        assert!(registry.is_empty());

        unsafe { libc::close(fd) };
    }

    #[test]
    fn conflicting_explicit_bind_is_fatal() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let caps = caps();
        let mut registry = ListenerRegistry::new();
        let err = bind_entry(Some("127.0.0.1"), port, &caps, &mut registry).unwrap_err();
        assert!(err.to_string().contains("bind"));
        assert!(registry.is_empty());
    }

    #[test]
    fn builder_without_handler_refuses_to_bind() {
        let builder: ServerBuilder<crate::session::ConnectionLogger> =
            ServerBuilder::new(Config::default());
        assert!(builder.bind().is_err());
    }

    #[test]
    fn bound_server_reports_port_and_listeners() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let config = Config {
            bind_addresses: vec![path.to_string_lossy().into_owned()],
            port: 6600,
        };

        let mut server = ServerBuilder::new(config)
            .with_handler(crate::session::ConnectionLogger::new())
            .bind()
            .unwrap();

        assert_eq!(server.bound_port(), 6600);
        assert_eq!(server.listener_count(), 1);
        assert!(path.exists());

        server.shutdown();
        assert_eq!(server.listener_count(), 0);
        server.shutdown();
    }
}
