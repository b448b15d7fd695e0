//! Per-connection session: banner, command loop, teardown.
//!
//! A session owns its socket exclusively. Commands are strictly serial:
//! the next header is not read until the previous command's reply has been
//! fully written. Any framing failure, protocol violation, or handler
//! error ends the session; nothing a single session does can take down the
//! server process.

use std::ffi::CStr;
use std::io::{Read, Write};
use std::mem;
use std::os::unix::io::AsRawFd;

use tracing::{debug, warn};

use tether_protocol::{
    wire, CommandHeader, CommandKind, COMMAND_MAGIC, SERVER_MAGIC_VERSION, SYSNAME_LEN,
};

use crate::error::{AgentError, Result};
use crate::{block, dynlink, exec, memory};

/// Read+write byte stream with raw-fd access (the exec pump polls the fd).
pub trait ReadWrite: Read + Write + AsRawFd {}
impl<T: Read + Write + AsRawFd> ReadWrite for T {}

/// Serve one connected controller until it disconnects, asks to close, or
/// violates the protocol. The socket is closed when this returns.
pub fn serve(stream: &mut impl ReadWrite) {
    match run(stream) {
        Ok(()) => debug!(fd = stream.as_raw_fd(), "session closed"),
        Err(AgentError::Disconnected) => debug!(fd = stream.as_raw_fd(), "peer disconnected"),
        Err(e) => warn!(fd = stream.as_raw_fd(), error = %e, "session ended"),
    }
}

fn run(stream: &mut impl ReadWrite) -> Result<()> {
    send_banner(stream)?;

    loop {
        let mut buf = [0u8; CommandHeader::SIZE];
        if !wire::read_exact_or_eof(stream, &mut buf)? {
            return Err(AgentError::Disconnected);
        }
        let header = CommandHeader::decode(&buf);
        if header.magic != COMMAND_MAGIC {
            return Err(AgentError::BadMagic(header.magic));
        }
        let kind = CommandKind::from_u32(header.kind)
            .ok_or(AgentError::UnknownCommand(header.kind))?;

        debug!(fd = stream.as_raw_fd(), kind = ?kind, "command");

        match kind {
            CommandKind::Exec => exec::handle_exec(stream)?,
            CommandKind::Dlopen => dynlink::handle_dlopen(stream)?,
            CommandKind::Dlclose => dynlink::handle_dlclose(stream)?,
            CommandKind::Dlsym => dynlink::handle_dlsym(stream)?,
            CommandKind::Call => dynlink::handle_call(stream)?,
            CommandKind::Peek => memory::handle_peek(stream)?,
            CommandKind::Poke => memory::handle_poke(stream)?,
            CommandKind::GetDummyBlock => block::handle_get_dummy_block(stream)?,
            CommandKind::Close => {
                debug!(fd = stream.as_raw_fd(), "close requested");
                return Ok(());
            }
            CommandKind::ReplyError | CommandKind::ReplyPeek | CommandKind::ReplyPoke => {
                // Reply kinds only travel agent-to-controller.
                return Err(AgentError::UnknownCommand(header.kind));
            }
        }
    }
}

/// Send the 260-byte banner: magic/version word, then the OS name
/// zero-padded to [`SYSNAME_LEN`].
///
/// The system name is looked up first so a uname failure aborts before any
/// banner byte reaches the wire.
fn send_banner(stream: &mut impl Write) -> Result<()> {
    let sysname = uname_sysname()?;

    stream.write_all(&SERVER_MAGIC_VERSION.to_le_bytes())?;

    let mut field = [0u8; SYSNAME_LEN];
    let n = sysname.len().min(SYSNAME_LEN - 1);
    field[..n].copy_from_slice(&sysname[..n]);
    stream.write_all(&field)?;
    Ok(())
}

fn uname_sysname() -> Result<Vec<u8>> {
    // SAFETY: utsname is plain data; uname fills it or fails.
    let mut uts: libc::utsname = unsafe { mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    // SAFETY: the kernel NUL-terminates sysname.
    let sysname = unsafe { CStr::from_ptr(uts.sysname.as_ptr()) };
    Ok(sysname.to_bytes().to_vec())
}
