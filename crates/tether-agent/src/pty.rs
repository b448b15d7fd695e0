//! Pseudoterminal allocation for foreground exec sessions.
//!
//! A foreground child gets the slave side of a fresh pty as its stdin,
//! stdout, and stderr; the session worker keeps the master and relays bytes
//! between it and the controller socket. The pty intrinsically merges the
//! child's stdout and stderr.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

use nix::fcntl::{self, FcntlArg, FdFlag, OFlag};
use nix::pty::{grantpt, posix_openpt, unlockpt};
use nix::sys::stat::Mode;
use tracing::debug;

/// Master side of a pseudoterminal pair.
///
/// The fd is closed on drop. Reads and writes go straight through the fd;
/// no buffering.
pub struct PtyMaster {
    fd: OwnedFd,
}

impl PtyMaster {
    /// Read available bytes from the master.
    ///
    /// Returns `Ok(0)` at end-of-stream. The caller decides how to treat
    /// EIO, which the kernel reports once the slave side is fully closed.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: fd is a valid open pty master for the lifetime of self.
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    /// Write the whole buffer to the master, looping over partial writes.
    pub fn write_all(&self, mut buf: &[u8]) -> io::Result<()> {
        while !buf.is_empty() {
            // SAFETY: fd is a valid open pty master for the lifetime of self.
            let n = unsafe {
                libc::write(
                    self.fd.as_raw_fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                )
            };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            buf = &buf[n as usize..];
        }
        Ok(())
    }
}

impl AsRawFd for PtyMaster {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Open a pseudoterminal pair.
///
/// Grants and unlocks the master, opens the slave end, and marks the master
/// close-on-exec so spawned children never inherit it. The returned slave
/// fd is dup'd onto the child's stdio by the caller and closed in the
/// parent after spawn.
pub fn open_pty() -> io::Result<(PtyMaster, OwnedFd)> {
    let master = posix_openpt(OFlag::O_RDWR | OFlag::O_NOCTTY)?;
    grantpt(&master)?;
    unlockpt(&master)?;

    let slave_path = slave_name(&master)?;
    debug!(slave = %slave_path, "opened pty");

    let slave_raw = fcntl::open(
        slave_path.as_str(),
        OFlag::O_RDWR | OFlag::O_NOCTTY,
        Mode::empty(),
    )?;
    // SAFETY: open returned a fresh fd we now own.
    let slave = unsafe { OwnedFd::from_raw_fd(slave_raw) };

    // SAFETY: into_raw_fd transfers ownership of the master fd.
    let master = unsafe { OwnedFd::from_raw_fd(master.into_raw_fd()) };
    fcntl::fcntl(master.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;

    Ok((PtyMaster { fd: master }, slave))
}

#[cfg(target_os = "linux")]
fn slave_name(master: &nix::pty::PtyMaster) -> io::Result<String> {
    Ok(nix::pty::ptsname_r(master)?)
}

#[cfg(not(target_os = "linux"))]
fn slave_name(master: &nix::pty::PtyMaster) -> io::Result<String> {
    // ptsname returns a static buffer; the copy into String happens before
    // any other pty call on this thread.
    // SAFETY: master is a valid pty master fd.
    Ok(unsafe { nix::pty::ptsname(master) }?)
}
