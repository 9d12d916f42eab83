use std::io;
use std::time::Duration;

use crate::command::CommandLine;
use crate::config::CoprocessConfig;
use crate::error::Result;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

#[cfg(unix)]
pub(crate) type NativeChannel = unix::UnixChannel;

#[cfg(windows)]
pub(crate) type NativeChannel = windows::WindowsChannel;

/// How a drain of the output pipe ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DrainEnd {
    /// Nothing more is buffered right now
    Empty,
    /// The child closed its end of the output pipe
    EndOfStream,
}

/// Internal trait for the platform-specific process and pipe plumbing
///
/// Implementations own the child process and the parent's two pipe
/// endpoints. Every handle is released when the implementation is dropped,
/// pipes first, then the termination request to the child.
pub(crate) trait Channel: Sized {
    /// Create both pipes and launch the child with stdin on the first and
    /// stdout plus stderr on the second
    fn spawn(command: &CommandLine, config: &CoprocessConfig) -> Result<Self>;

    fn pid(&self) -> u32;

    /// Write all of `bytes` to the child's stdin and flush
    fn send(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Append whatever output is buffered right now to `out`, never blocking
    ///
    /// On error, `out` keeps every byte read before the failure.
    fn drain(&mut self, out: &mut Vec<u8>) -> io::Result<DrainEnd>;

    /// Wait until the output pipe has data or has hung up
    ///
    /// `None` waits without limit, a zero duration checks and returns.
    /// `Ok(false)` means the wait timed out.
    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool>;

    /// Close both endpoints and ask the child to terminate, once
    fn shutdown(&mut self);
}
