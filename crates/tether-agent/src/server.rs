//! TCP listener and per-connection worker spawner.
//!
//! One accept loop on the calling thread; every accepted connection gets a
//! dedicated worker thread that owns the socket for its lifetime. The
//! listener is IPv6 with IPv4-mapped acceptance, so a single socket serves
//! both address families.

use std::io;
use std::mem;
use std::net::TcpStream;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::thread;

use tracing::{info, warn};

use tether_protocol::LISTEN_BACKLOG;

use crate::session;

/// Dual-stack TCP listener bound to the unspecified address.
pub struct Listener {
    fd: OwnedFd,
}

impl Listener {
    /// Bind to the given port. Port 0 picks an ephemeral port; see
    /// [`Listener::local_port`].
    pub fn bind(port: u16) -> io::Result<Self> {
        // SAFETY: socket(2) with constant arguments.
        let raw = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a fresh fd we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_cloexec(fd.as_raw_fd())?;

        let yes: libc::c_int = 1;
        // SAFETY: option value points at a live c_int of the stated length.
        if unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &yes as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }

        // IPv4 clients appear as v4-mapped v6 addresses.
        let no: libc::c_int = 0;
        // SAFETY: as above.
        if unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &no as *const libc::c_int as *const libc::c_void,
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: sockaddr_in6 is plain data; the all-zero address is "any".
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        // SAFETY: addr is a valid sockaddr_in6 of the stated length.
        if unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_in6 as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: listen(2) on a bound socket.
        if unsafe { libc::listen(fd.as_raw_fd(), LISTEN_BACKLOG) } < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { fd })
    }

    /// Port the socket is actually bound to.
    pub fn local_port(&self) -> io::Result<u16> {
        // SAFETY: sockaddr_in6 is plain data.
        let mut addr: libc::sockaddr_in6 = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
        // SAFETY: addr and len describe a valid out-buffer.
        if unsafe {
            libc::getsockname(
                self.fd.as_raw_fd(),
                &mut addr as *mut libc::sockaddr_in6 as *mut libc::sockaddr,
                &mut len,
            )
        } < 0
        {
            return Err(io::Error::last_os_error());
        }
        Ok(u16::from_be(addr.sin6_port))
    }

    /// Accept one connection.
    pub fn accept(&self) -> io::Result<TcpStream> {
        // SAFETY: accept(2) on a listening socket; peer address discarded.
        let raw = unsafe { libc::accept(self.fd.as_raw_fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: raw is a fresh fd we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        set_cloexec(fd.as_raw_fd())?;
        Ok(TcpStream::from(fd))
    }

    /// Accept loop: serve every connection on its own worker thread, forever.
    ///
    /// Accept failures are logged and do not stop the loop.
    pub fn run(self) -> io::Result<()> {
        info!(port = self.local_port()?, "listening");
        loop {
            match self.accept() {
                Ok(stream) => {
                    let peer = stream
                        .peer_addr()
                        .map(|addr| addr.to_string())
                        .unwrap_or_else(|_| "unknown".to_string());
                    info!(peer = %peer, fd = stream.as_raw_fd(), "accepted connection");
                    thread::spawn(move || {
                        let mut stream = stream;
                        session::serve(&mut stream);
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    // SAFETY: fcntl(2) on a valid fd.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
