//! Arbitrary memory reads and writes.
//!
//! Two shapes. On Mach hosts the range is checked through the task port
//! first and a failure gets an in-protocol error reply. Everywhere else
//! the supplied address is dereferenced directly: an unmapped range kills
//! the agent process, and that is the contract.

use std::io::Write;

use tether_protocol::{CommandHeader, CommandKind, MemoryRange};

use crate::error::Result;
use crate::session::ReadWrite;

fn send_reply(stream: &mut impl Write, kind: CommandKind) -> Result<()> {
    stream.write_all(&CommandHeader::new(kind).encode())?;
    Ok(())
}

#[cfg(not(target_os = "macos"))]
mod generic {
    use super::*;

    /// Handle PEEK: reply header, then the bytes read straight from the
    /// supplied address.
    pub fn handle_peek(stream: &mut impl ReadWrite) -> Result<()> {
        let range = MemoryRange::read_from(stream)?;
        send_reply(stream, CommandKind::ReplyPeek)?;
        // SAFETY: no validation by contract; an unmapped range is fatal.
        let bytes =
            unsafe { std::slice::from_raw_parts(range.address as *const u8, range.size as usize) };
        stream.write_all(bytes)?;
        Ok(())
    }

    /// Handle POKE: read the payload straight into the supplied address,
    /// then reply.
    pub fn handle_poke(stream: &mut impl ReadWrite) -> Result<()> {
        let range = MemoryRange::read_from(stream)?;
        // SAFETY: no validation by contract; an unmapped range is fatal.
        let target = unsafe {
            std::slice::from_raw_parts_mut(range.address as *mut u8, range.size as usize)
        };
        stream.read_exact(target)?;
        send_reply(stream, CommandKind::ReplyPoke)?;
        Ok(())
    }
}

#[cfg(not(target_os = "macos"))]
pub use generic::{handle_peek, handle_poke};

#[cfg(target_os = "macos")]
mod mach {
    use super::*;
    use crate::error::AgentError;
    use tracing::debug;

    pub type MachPort = u32;
    pub type KernReturn = i32;

    pub const KERN_SUCCESS: KernReturn = 0;

    extern "C" {
        pub static mach_task_self_: MachPort;

        pub fn task_for_pid(target: MachPort, pid: libc::pid_t, task: *mut MachPort)
            -> KernReturn;

        pub fn vm_read(
            task: MachPort,
            address: usize,
            size: usize,
            data: *mut usize,
            data_count: *mut u32,
        ) -> KernReturn;

        pub fn vm_write(task: MachPort, address: usize, data: usize, data_count: u32)
            -> KernReturn;

        pub fn vm_deallocate(task: MachPort, address: usize, size: usize) -> KernReturn;
    }

    /// Task port for the agent process itself.
    fn self_task() -> Result<MachPort> {
        let mut task: MachPort = 0;
        // SAFETY: out-param is a valid MachPort slot.
        let kr = unsafe { task_for_pid(mach_task_self_, libc::getpid(), &mut task) };
        if kr != KERN_SUCCESS {
            return Err(AgentError::TaskPort(kr));
        }
        Ok(task)
    }

    /// Handle PEEK with a checked read through the task port.
    ///
    /// The bytes sent are the ones vm_read returned; the kernel copy is
    /// deallocated after sending.
    pub fn handle_peek(stream: &mut impl ReadWrite) -> Result<()> {
        let range = MemoryRange::read_from(stream)?;
        let task = self_task()?;

        let mut data: usize = 0;
        let mut count: u32 = 0;
        // SAFETY: out-params are valid; vm_read maps the copy into our
        // address space on success.
        let kr = unsafe {
            vm_read(
                task,
                range.address as usize,
                range.size as usize,
                &mut data,
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            debug!(address = format_args!("{:#x}", range.address), size = range.size, kr, "vm_read failed");
            return send_reply(stream, CommandKind::ReplyError);
        }

        send_reply(stream, CommandKind::ReplyPeek)?;
        // SAFETY: vm_read returned `count` readable bytes at `data`.
        let bytes = unsafe { std::slice::from_raw_parts(data as *const u8, count as usize) };
        let sent = stream.write_all(bytes);
        // SAFETY: releasing the mapping vm_read created.
        unsafe { vm_deallocate(task, data, count as usize) };
        sent?;
        Ok(())
    }

    /// Handle POKE with a checked write through the task port.
    pub fn handle_poke(stream: &mut impl ReadWrite) -> Result<()> {
        let range = MemoryRange::read_from(stream)?;
        let task = self_task()?;

        // The size is peer-supplied; a failed allocation must end only this
        // session, never the process.
        let size = range.size as usize;
        let mut payload = Vec::new();
        payload
            .try_reserve_exact(size)
            .map_err(|_| AgentError::Allocation(size))?;
        payload.resize(size, 0);
        stream.read_exact(&mut payload)?;

        // SAFETY: payload is a live buffer of exactly `size` bytes.
        let kr = unsafe {
            vm_write(
                task,
                range.address as usize,
                payload.as_ptr() as usize,
                range.size as u32,
            )
        };
        if kr != KERN_SUCCESS {
            debug!(address = format_args!("{:#x}", range.address), size = range.size, kr, "vm_write failed");
            return send_reply(stream, CommandKind::ReplyError);
        }
        send_reply(stream, CommandKind::ReplyPoke)?;
        Ok(())
    }
}

#[cfg(target_os = "macos")]
pub use mach::{handle_peek, handle_poke};
