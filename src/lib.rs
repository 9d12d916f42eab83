//! Tether - pipe-connected coprocess channel
//!
//! This library launches an external program and talks to it over pipes:
//! bytes are written to the child's stdin, and its stdout and stderr are read
//! back from one merged pipe. It is built for driving long-running
//! interactive tools such as SMT solvers, where the caller sends a query,
//! waits until output is available and collects the reply.
//!
//! - Unix: `pipe` + fork/exec, readiness through a poller on the output pipe
//! - Windows: anonymous pipes + `CreateProcessW`, readiness by peeking
//!
//! # Example
//!
//! ```rust,ignore
//! use std::time::Duration;
//! use tether::{Coprocess, ProcessState, SendOutcome};
//!
//! fn check() -> tether::Result<()> {
//!     let mut solver = Coprocess::spawn(["z3", "-in"])?;
//!
//!     if solver.send("(check-sat)\n") == SendOutcome::Succeeded {
//!         solver.wait_receivable(Duration::from_millis(50));
//!         if solver.status() == ProcessState::Ready {
//!             let reply = solver.receive();
//!             println!("{}", String::from_utf8_lossy(&reply));
//!         }
//!     }
//!
//!     // Dropping `solver` closes the pipes and terminates z3.
//!     Ok(())
//! }
//! ```
//!
//! # States
//!
//! A coprocess is [`ProcessState::Ready`] after a successful launch. It
//! becomes [`ProcessState::Exited`] when the output pipe reaches
//! end-of-stream or [`Coprocess::terminate`] is called, and
//! [`ProcessState::Faulted`] when readiness polling fails. Neither state can
//! be left again.

mod command;
mod config;
mod coprocess;
mod error;
mod platform;

pub use command::{CommandLine, quote_windows_arg};
pub use config::{
    CoprocessConfig, CoprocessConfigBuilder, DEFAULT_PEEK_INTERVAL, DEFAULT_READ_CHUNK_SIZE,
};
pub use coprocess::{Coprocess, ProcessState, SendOutcome};
pub use error::{Error, Result};
