//! tether agent: a remote in-process agent.
//!
//! The agent is a long-running TCP server on a target host. A connected
//! controller drives a small binary command protocol to:
//!
//! - spawn child processes, optionally on a pseudoterminal with
//!   bidirectional I/O and exit-status reporting
//! - load and unload shared libraries and resolve symbols inside the agent
//!   process
//! - invoke arbitrary function pointers with up to eleven machine-word
//!   arguments
//! - read and write arbitrary process memory
//!
//! There is no authentication, encryption, or sandboxing: any controller
//! that can connect runs with the agent's full privileges. Deployments must
//! sit behind a trusted transport.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │  server   accept loop, one thread per client │
//! ├──────────────────────────────────────────────┤
//! │  session  banner + command dispatch          │
//! ├───────────┬──────────┬──────────┬────────────┤
//! │  exec     │ dynlink  │ memory   │ block      │
//! │  PTY pump │ dlopen + │ peek/    │ dummy      │
//! │  + reaper │ call     │ poke     │ block ptr  │
//! └───────────┴──────────┴──────────┴────────────┘
//! ```
//!
//! Wire formats live in the `tether-protocol` crate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block;
pub mod dynlink;
pub mod error;
pub mod exec;
pub mod logging;
pub mod memory;
pub mod pty;
pub mod server;
pub mod session;

pub use error::{AgentError, Result};
pub use server::Listener;
