//! Wire protocol for the tether remote agent.
//!
//! This crate defines the binary protocol spoken between a controller and
//! the agent over a plain TCP connection.
//!
//! # Protocol overview
//!
//! On connect the agent sends an unsolicited 260-byte banner:
//!
//! ```text
//! +----------------------+----------------------------------+
//! | magic/version (4 LE) | uname sysname, zero-padded (256) |
//! +----------------------+----------------------------------+
//! ```
//!
//! After the banner the controller drives a strictly serial command stream.
//! Every command starts with an 8-byte header:
//!
//! ```text
//! +--------------+------------------+
//! | magic (4 LE) | command kind (4) |
//! +--------------+------------------+
//! ```
//!
//! followed by a kind-specific body. Replies that need a typed header
//! (`REPLY_ERROR`, `REPLY_PEEK`, `REPLY_POKE`) reuse the same 8-byte shape.
//!
//! # Byte order
//!
//! Every multi-byte integer on the wire is **little-endian**, on every
//! target. Pointers, handles, and sizes are 64 bits wide; pids are 32 bits.
//! Fixed 1024-byte string fields are NUL-terminated within the field;
//! variable-length strings carry a 4-byte length prefix and no terminator.

#![deny(missing_docs)]

use std::io::{self, Read, Write};

/// Banner magic/version constant, first four bytes the agent ever sends.
pub const SERVER_MAGIC_VERSION: u32 = 0x8888_8800;

/// Magic carried by every command header in both directions.
pub const COMMAND_MAGIC: u32 = 0x1234_5678;

/// Size of the zero-padded system-name field in the banner.
pub const SYSNAME_LEN: usize = 256;

/// Size of the fixed string fields in DLOPEN/DLSYM bodies.
pub const PATH_FIELD_LEN: usize = 1024;

/// Highest function-call arity the CALL trampoline supports.
pub const MAX_CALL_ARGS: u64 = 11;

/// Sentinel pid reported when a spawn fails.
pub const INVALID_PID: u32 = 0xffff_ffff;

/// Port the agent listens on when none is configured.
pub const DEFAULT_PORT: u16 = 5910;

/// Listen backlog for the agent's TCP socket, passed straight to listen(2).
pub const LISTEN_BACKLOG: i32 = 1024;

/// Buffer size used by the foreground exec pump.
pub const PUMP_BUF_SIZE: usize = 64 * 1024;

/// Command kinds, carried in the second word of a command header.
///
/// The reply kinds (`ReplyError`, `ReplyPeek`, `ReplyPoke`) are only ever
/// sent agent-to-controller; a controller sending one is a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandKind {
    /// Spawn a child process, optionally on a pseudoterminal.
    Exec = 0,
    /// Load a shared library into the agent process.
    Dlopen = 1,
    /// Unload a previously loaded library.
    Dlclose = 2,
    /// Resolve a symbol in a loaded library.
    Dlsym = 3,
    /// Invoke a function pointer with up to [`MAX_CALL_ARGS`] words.
    Call = 4,
    /// Read agent memory.
    Peek = 5,
    /// Write agent memory.
    Poke = 6,
    /// Reply header: the preceding PEEK/POKE failed, no payload follows.
    ReplyError = 7,
    /// Reply header: PEEK succeeded, the requested bytes follow.
    ReplyPeek = 8,
    /// Fetch the agent's dummy block pointer.
    GetDummyBlock = 9,
    /// Close the connection.
    Close = 10,
    /// Reply header: POKE succeeded.
    ReplyPoke = 11,
}

impl CommandKind {
    /// Decode a raw command-kind word.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Exec),
            1 => Some(Self::Dlopen),
            2 => Some(Self::Dlclose),
            3 => Some(Self::Dlsym),
            4 => Some(Self::Call),
            5 => Some(Self::Peek),
            6 => Some(Self::Poke),
            7 => Some(Self::ReplyError),
            8 => Some(Self::ReplyPeek),
            9 => Some(Self::GetDummyBlock),
            10 => Some(Self::Close),
            11 => Some(Self::ReplyPoke),
            _ => None,
        }
    }
}

/// Chunk kinds streamed during a foreground exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ChunkKind {
    /// Output captured from the child's pseudoterminal.
    Stdout = 0,
    /// Final chunk: the payload is the 32-bit wait status.
    Exit = 1,
}

impl ChunkKind {
    /// Decode a raw chunk-kind word.
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Stdout),
            1 => Some(Self::Exit),
            _ => None,
        }
    }
}

/// The 8-byte header framing every command and typed reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandHeader {
    /// Must equal [`COMMAND_MAGIC`].
    pub magic: u32,
    /// Raw command kind; see [`CommandKind`].
    pub kind: u32,
}

impl CommandHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Build a header for the given kind; the same shape frames commands
    /// and typed replies.
    pub fn new(kind: CommandKind) -> Self {
        Self {
            magic: COMMAND_MAGIC,
            kind: kind as u32,
        }
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..].copy_from_slice(&self.kind.to_le_bytes());
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Header preceding each chunk streamed during a foreground exec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecChunkHeader {
    /// Raw chunk kind; see [`ChunkKind`].
    pub kind: u32,
    /// Payload length in bytes.
    pub size: u32,
}

impl ExecChunkHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 8;

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..].copy_from_slice(&self.size.to_le_bytes());
        buf
    }

    /// Decode from wire bytes.
    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            kind: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            size: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Body of a PEEK or POKE command: an address/size pair.
///
/// For POKE, `size` bytes of payload follow the pair on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    /// Target address in the agent's address space.
    pub address: u64,
    /// Length of the region in bytes.
    pub size: u64,
}

impl MemoryRange {
    /// Read an address/size pair off the wire.
    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            address: wire::read_u64(reader)?,
            size: wire::read_u64(reader)?,
        })
    }

    /// Encode to wire bytes.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[..8].copy_from_slice(&self.address.to_le_bytes());
        buf[8..].copy_from_slice(&self.size.to_le_bytes());
        buf
    }
}

/// Low-level framing helpers shared by the agent and its tests.
pub mod wire {
    use super::*;

    /// Fill `buf` exactly, distinguishing a clean peer shutdown.
    ///
    /// Returns `Ok(false)` when the very first read hits end-of-stream
    /// (the peer closed between commands). A short read after partial data
    /// is an [`io::ErrorKind::UnexpectedEof`] error like any other framing
    /// failure.
    pub fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match reader.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed mid-frame",
                    ))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read one byte.
    pub fn read_u8(reader: &mut impl Read) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        reader.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    /// Read a little-endian u32.
    pub fn read_u32(reader: &mut impl Read) -> io::Result<u32> {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a little-endian u64.
    pub fn read_u64(reader: &mut impl Read) -> io::Result<u64> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a little-endian u32.
    pub fn write_u32(writer: &mut impl Write, value: u32) -> io::Result<()> {
        writer.write_all(&value.to_le_bytes())
    }

    /// Write a little-endian u64.
    pub fn write_u64(writer: &mut impl Write, value: u64) -> io::Result<()> {
        writer.write_all(&value.to_le_bytes())
    }
}
