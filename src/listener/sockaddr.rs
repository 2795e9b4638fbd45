// src/listener/sockaddr.rs
//! Conversions between the typed address model and the raw sockaddr
//! structures the syscalls speak.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

use super::resolver::{BindTarget, SocketFamily};

/// Encode a bind target as a `sockaddr_storage` plus the length the
/// syscall expects. The resolver guarantees local paths fit `sun_path`.
pub(crate) fn encode(target: &BindTarget) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    match target {
        BindTarget::Inet(SocketAddr::V4(v4)) => {
            let sin = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in) };
            sin.sin_family = libc::AF_INET as libc::sa_family_t;
            sin.sin_port = v4.port().to_be();
            sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
            (storage, mem::size_of::<libc::sockaddr_in>() as libc::socklen_t)
        }
        BindTarget::Inet(SocketAddr::V6(v6)) => {
            let sin6 = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_in6) };
            sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
            sin6.sin6_port = v6.port().to_be();
            sin6.sin6_addr.s6_addr = v6.ip().octets();
            sin6.sin6_flowinfo = v6.flowinfo();
            sin6.sin6_scope_id = v6.scope_id();
            (storage, mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t)
        }
        BindTarget::Local(path) => {
            let sun = unsafe { &mut *(&mut storage as *mut _ as *mut libc::sockaddr_un) };
            sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
            let bytes = path.as_os_str().as_bytes();
            debug_assert!(bytes.len() < sun.sun_path.len(), "callers must reject overlong paths");
            for (dst, src) in sun.sun_path.iter_mut().zip(bytes) {
                *dst = *src as libc::c_char;
            }
            (storage, mem::size_of::<libc::sockaddr_un>() as libc::socklen_t)
        }
    }
}

/// Decode the inet address a syscall filled in. Returns `None` for the
/// local family, which has no meaningful socket address here.
pub(crate) fn decode_inet(
    storage: &libc::sockaddr_storage,
    family: SocketFamily,
) -> Option<SocketAddr> {
    match family {
        SocketFamily::Ipv4 => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        SocketFamily::Ipv6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        SocketFamily::Local => None,
    }
}

/// Ask the kernel what an inet socket actually bound to. Needed when the
/// configured port was 0 and the kernel picked one.
pub(crate) fn bound_inet_addr(fd: RawFd, family: SocketFamily) -> io::Result<Option<SocketAddr>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(decode_inet(&storage, family))
}
