//! Child spawning and the foreground exec pump.
//!
//! Foreground children run on a fresh pseudoterminal; the worker relays
//! bytes between the controller socket and the pty master until either
//! side closes, then reaps the child and forwards its wait status as a
//! final exit chunk. Background children get /dev/null stdio and a
//! detached reaper thread.

use std::ffi::{OsStr, OsString};
use std::io::{self, Read};
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::thread;

use tracing::{debug, warn};

use tether_protocol::{wire, ChunkKind, ExecChunkHeader, INVALID_PID, PUMP_BUF_SIZE};

use crate::error::{AgentError, Result};
use crate::pty::{self, PtyMaster};
use crate::session::ReadWrite;

/// Handle one EXEC request.
///
/// A spawn failure is reported to the controller with the sentinel pid and
/// leaves the session usable; only framing failures propagate.
pub fn handle_exec(stream: &mut impl ReadWrite) -> Result<()> {
    let background = wire::read_u8(stream)? != 0;

    let argc = wire::read_u32(stream)?;
    if argc == 0 {
        return Err(AgentError::EmptyArgv);
    }
    let argv = read_string_list(stream, argc)?;
    let envc = wire::read_u32(stream)?;
    let envp = read_string_list(stream, envc)?;

    let (child, master) = match spawn_child(background, &argv, &envp) {
        Ok(pair) => pair,
        Err(e) => {
            warn!(program = ?argv[0], error = %e, "spawn failed");
            stream.write_all(&INVALID_PID.to_le_bytes())?;
            return Ok(());
        }
    };

    let pid = child.id();
    debug!(pid, background, "spawned");
    stream.write_all(&pid.to_le_bytes())?;

    if background {
        reap_in_background(child);
    } else {
        let master = master.expect("foreground spawn allocates a pty");
        pump(stream, &master, child)?;
    }
    Ok(())
}

/// Read `count` length-prefixed byte strings off the wire.
///
/// `count` and every length prefix come from the peer, so all allocation
/// is fallible: an absurd size fails this session instead of aborting the
/// agent and every other session with it.
fn read_string_list(stream: &mut impl Read, count: u32) -> Result<Vec<OsString>> {
    let mut list = Vec::new();
    list.try_reserve(count as usize)
        .map_err(|_| AgentError::Allocation(count as usize))?;
    for _ in 0..count {
        let len = wire::read_u32(stream)? as usize;
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| AgentError::Allocation(len))?;
        buf.resize(len, 0);
        stream.read_exact(&mut buf)?;
        list.push(OsString::from_vec(buf));
    }
    Ok(list)
}

/// Spawn the requested child.
///
/// `argv[0]` is resolved against `PATH`. The child starts its own session
/// so control characters on the pty never reach the agent's process group.
/// With a non-empty `envp` the child sees exactly the supplied environment;
/// otherwise it inherits the agent's.
fn spawn_child(
    background: bool,
    argv: &[OsString],
    envp: &[OsString],
) -> io::Result<(Child, Option<PtyMaster>)> {
    let mut cmd = Command::new(&argv[0]);
    cmd.args(&argv[1..]);

    if !envp.is_empty() {
        cmd.env_clear();
        for entry in envp {
            let bytes = entry.as_bytes();
            if let Some(eq) = bytes.iter().position(|&b| b == b'=') {
                cmd.env(
                    OsStr::from_bytes(&bytes[..eq]),
                    OsStr::from_bytes(&bytes[eq + 1..]),
                );
            }
        }
    }

    // SAFETY: setsid is async-signal-safe and cannot fail in a fresh child.
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    if background {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::null());
        let child = cmd.spawn()?;
        Ok((child, None))
    } else {
        let (master, slave) = pty::open_pty()?;
        let slave_raw = slave.as_raw_fd();

        // Each stdio handle needs its own fd; Stdio::from_raw_fd takes
        // ownership.
        // SAFETY: slave_raw is a valid open fd from open_pty.
        unsafe {
            cmd.stdin(Stdio::from_raw_fd(dup_fd(slave_raw)?));
            cmd.stdout(Stdio::from_raw_fd(dup_fd(slave_raw)?));
            cmd.stderr(Stdio::from_raw_fd(dup_fd(slave_raw)?));
        }

        let child = cmd.spawn()?;
        // The child holds its own copies now; the parent keeps only the
        // master (closed on drop by every caller path).
        drop(slave);
        Ok((child, Some(master)))
    }
}

fn dup_fd(fd: RawFd) -> io::Result<RawFd> {
    // SAFETY: dup(2) on a valid fd.
    let duped = unsafe { libc::dup(fd) };
    if duped < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(duped)
}

/// Reap a background child from a detached thread; no status is reported.
fn reap_in_background(mut child: Child) {
    thread::spawn(move || {
        let pid = child.id();
        match child.wait() {
            Ok(status) => debug!(pid, status = ?status, "background child reaped"),
            Err(e) => warn!(pid, error = %e, "background reap failed"),
        }
    });
}

/// Relay bytes until either side closes, then reap and send the exit chunk.
fn pump(stream: &mut impl ReadWrite, master: &PtyMaster, mut child: Child) -> Result<()> {
    if let Err(e) = relay(stream, master) {
        // The child may outlive the session; reap it off-thread.
        reap_in_background(child);
        return Err(e);
    }

    debug!(pid = child.id(), "waiting for child");
    let status = child.wait()?;

    let chunk = ExecChunkHeader {
        kind: ChunkKind::Exit as u32,
        size: 4,
    };
    stream.write_all(&chunk.encode())?;
    stream.write_all(&status.into_raw().to_le_bytes())?;
    debug!(status = status.into_raw(), "exec finished");
    Ok(())
}

/// The bidirectional relay between the socket and the pty master.
///
/// Master output goes to the controller as stdout chunks; controller bytes
/// go to the master verbatim. A read of zero (or EIO from a fully closed
/// slave side) on either fd ends the relay.
fn relay(stream: &mut impl ReadWrite, master: &PtyMaster) -> Result<()> {
    let mut buf = vec![0u8; PUMP_BUF_SIZE];
    let master_fd = master.as_raw_fd();
    let sock_fd = stream.as_raw_fd();

    loop {
        let mut fds = [
            libc::pollfd {
                fd: master_fd,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: sock_fd,
                events: libc::POLLIN,
                revents: 0,
            },
        ];

        // SAFETY: fds is a valid array for the duration of the call.
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err.into());
        }

        if fds[0].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            let n = match master.read(&mut buf) {
                Ok(0) => 0,
                Ok(n) => n,
                Err(e) if e.raw_os_error() == Some(libc::EIO) => 0,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "pty master read failed");
                    0
                }
            };
            if n == 0 {
                debug!("child closed its terminal");
                return Ok(());
            }

            let chunk = ExecChunkHeader {
                kind: ChunkKind::Stdout as u32,
                size: n as u32,
            };
            stream.write_all(&chunk.encode())?;
            stream.write_all(&buf[..n])?;
        }

        if fds[1].revents & (libc::POLLIN | libc::POLLHUP) != 0 {
            let n = match stream.read(&mut buf) {
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!(error = %e, "socket read failed");
                    0
                }
            };
            if n == 0 {
                debug!("controller detached");
                return Ok(());
            }
            master.write_all(&buf[..n])?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode_string(s: &[u8]) -> Vec<u8> {
        let mut out = (s.len() as u32).to_le_bytes().to_vec();
        out.extend_from_slice(s);
        out
    }

    #[test]
    fn string_list_round_trips_without_terminators() {
        let mut body = Vec::new();
        body.extend_from_slice(&encode_string(b"/bin/echo"));
        body.extend_from_slice(&encode_string(b"hello world"));

        let list = read_string_list(&mut Cursor::new(body), 2).unwrap();
        assert_eq!(list[0], OsString::from("/bin/echo"));
        assert_eq!(list[1], OsString::from("hello world"));
    }

    #[test]
    fn oversized_argument_count_fails_instead_of_aborting() {
        // Whether the reservation is refused or the follow-up read hits
        // end-of-stream, the handler reports an error; it never dies.
        let result = read_string_list(&mut Cursor::new(Vec::new()), u32::MAX);
        assert!(result.is_err());
    }

    #[test]
    fn string_list_handles_empty_entries() {
        let body = encode_string(b"");
        let list = read_string_list(&mut Cursor::new(body), 1).unwrap();
        assert_eq!(list[0], OsString::new());
    }

    #[test]
    fn background_spawn_has_no_master() {
        let argv = vec![OsString::from("/bin/true")];
        let (child, master) = spawn_child(true, &argv, &[]).unwrap();
        assert!(master.is_none());
        reap_in_background(child);
    }

    #[test]
    fn foreground_spawn_streams_output_through_the_master() {
        let argv = vec![OsString::from("/bin/echo"), OsString::from("hi")];
        let (mut child, master) = spawn_child(false, &argv, &[]).unwrap();
        let master = master.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        // The pty cooks the newline into \r\n.
        assert!(collected.starts_with(b"hi\r\n"));

        let status = child.wait().unwrap();
        assert_eq!(status.code(), Some(0));
    }

    #[test]
    fn explicit_environment_replaces_the_inherited_one() {
        let argv = vec![
            OsString::from("/bin/sh"),
            OsString::from("-c"),
            OsString::from("echo $TETHER_TEST_MARKER"),
        ];
        let envp = vec![
            OsString::from("TETHER_TEST_MARKER=present"),
            OsString::from("PATH=/usr/bin:/bin"),
        ];
        let (mut child, master) = spawn_child(false, &argv, &envp).unwrap();
        let master = master.unwrap();

        let mut collected = Vec::new();
        let mut buf = [0u8; 256];
        loop {
            match master.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
                Err(e) => panic!("unexpected read error: {e}"),
            }
        }
        assert!(collected.starts_with(b"present"));
        child.wait().unwrap();
    }

    #[test]
    fn spawn_failure_surfaces_as_an_error() {
        let argv = vec![OsString::from("/definitely/not/a/real/binary")];
        assert!(spawn_child(true, &argv, &[]).is_err());
    }
}
