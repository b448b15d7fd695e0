//! Error types for the tether agent.
//!
//! Messages are lowercase and follow the `"<operation> failed: <reason>"`
//! form. Only conditions that end a session are errors here; failures with
//! an in-protocol reply (spawn sentinel, Mach memory error reply) are
//! ordinary handler outcomes.

use thiserror::Error;

/// Result type alias using the agent's error type.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Session-terminating failures.
#[derive(Error, Debug)]
pub enum AgentError {
    /// The peer shut the connection down cleanly between commands.
    #[error("peer disconnected")]
    Disconnected,

    /// A command header carried the wrong magic.
    #[error("bad command magic: {0:#010x}")]
    BadMagic(u32),

    /// A command header carried a kind the agent does not serve.
    #[error("unknown command kind: {0}")]
    UnknownCommand(u32),

    /// An EXEC request arrived with an empty argv.
    #[error("exec request rejected: argv is empty")]
    EmptyArgv,

    /// A CALL request asked for more arguments than the trampoline has
    /// signatures for.
    #[error("call arity {0} exceeds maximum 11")]
    CallArity(u64),

    /// A fixed-size string field had no NUL terminator.
    #[error("string field missing nul terminator")]
    UnterminatedString,

    /// A wire-supplied size was too large to buffer. The failure ends this
    /// session only; the allocator must never abort the whole process over
    /// one request.
    #[error("request allocation failed: {0} bytes")]
    Allocation(usize),

    /// The agent could not obtain a task port for itself.
    #[cfg(target_os = "macos")]
    #[error("task port acquisition failed: kernel status {0}")]
    TaskPort(i32),

    /// Socket or pseudoterminal I/O failed.
    #[error("i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
