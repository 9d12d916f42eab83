//! POSIX backend: pipes, fork/exec through `std::process`, and a poller on
//! the output pipe

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use polling::{Event, Events, Poller};

use crate::command::CommandLine;
use crate::config::CoprocessConfig;
use crate::error::{Error, Result};
use crate::platform::{Channel, DrainEnd};

const OUTPUT_KEY: usize = 0;

/// Parent's read end of the merged stdout/stderr pipe
struct OutputEndpoint {
    file: File,
    poller: Poller,
    events: Events,
}

impl OutputEndpoint {
    fn new(fd: OwnedFd) -> io::Result<Self> {
        let file = File::from(fd);
        let poller = Poller::new()?;
        // SAFETY: the file is removed from the poller in `Drop` before it closes.
        unsafe {
            #[allow(clippy::needless_borrows_for_generic_args)]
            poller.add(&file, Event::readable(OUTPUT_KEY))?;
        }
        Ok(Self {
            file,
            poller,
            events: Events::new(),
        })
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        // A timeout too large to represent waits without limit.
        let deadline = timeout.and_then(|timeout| Instant::now().checked_add(timeout));
        loop {
            // Interest is oneshot and has to be re-armed before every wait.
            #[allow(clippy::needless_borrows_for_generic_args)]
            self.poller
                .modify(&self.file, Event::readable(OUTPUT_KEY))?;
            self.events.clear();
            let remaining = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
            match self.poller.wait(&mut self.events, remaining) {
                Ok(_) => {}
                // A signal is not a timeout; wait again for what is left.
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let readable = self
                .events
                .iter()
                .any(|event| event.key == OUTPUT_KEY && event.readable);
            if readable || deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(readable);
            }
        }
    }
}

impl Drop for OutputEndpoint {
    fn drop(&mut self) {
        #[allow(clippy::needless_borrows_for_generic_args)]
        let _ = self.poller.delete(&self.file);
    }
}

/// Terminated children that had not exited yet when they were torn down
///
/// Pruned with `try_wait` on every spawn and teardown, so each one is reaped
/// the next time the crate touches a process after it dies.
static UNREAPED: Mutex<Vec<Child>> = Mutex::new(Vec::new());

/// Reap every parked child that has exited since the last call
pub(crate) fn reap_exited() {
    let mut unreaped = UNREAPED.lock().unwrap_or_else(PoisonError::into_inner);
    unreaped.retain_mut(|child| match child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            tracing::debug!(pid = child.id(), %status, "reaped coprocess");
            false
        }
        Err(e) => {
            tracing::debug!(pid = child.id(), error = %e, "failed to reap coprocess");
            false
        }
    });
}

fn park_unreaped(child: Child) {
    UNREAPED
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(child);
}

/// The launched child, sent SIGTERM at most once
struct ChildProcess {
    pid: u32,
    /// `None` once terminated
    child: Option<Child>,
}

impl ChildProcess {
    fn new(child: Child) -> Self {
        Self {
            pid: child.id(),
            child: Some(child),
        }
    }

    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = self.pid;

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid, %status, "coprocess already exited");
                reap_exited();
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::debug!(pid, error = %e, "failed to query coprocess status");
                return;
            }
        }

        // SAFETY: kill has no memory-safety preconditions. The child has not
        // been reaped, so `pid` still names it.
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } != 0 {
            tracing::debug!(
                pid,
                error = %io::Error::last_os_error(),
                "failed to signal coprocess"
            );
        } else {
            tracing::debug!(pid, "sent SIGTERM to coprocess");
        }

        // Not waited on here; a later spawn or teardown reaps it.
        park_unreaped(child);
        reap_exited();
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Pipe channel to a child launched with fork/exec
pub struct UnixChannel {
    // Declaration order is drop order: both pipes close before the child is
    // signalled.
    input: Option<File>,
    output: Option<OutputEndpoint>,
    child: ChildProcess,
    read_chunk_size: usize,
    #[cfg(test)]
    fail_next_wait: bool,
}

impl UnixChannel {
    /// Make the next readiness wait fail as if the OS had reported an error
    #[cfg(test)]
    pub(crate) fn fail_next_wait(&mut self) {
        self.fail_next_wait = true;
    }
}

impl Channel for UnixChannel {
    fn spawn(command: &CommandLine, config: &CoprocessConfig) -> Result<Self> {
        reap_exited();

        let (input_read, input_write) = cloexec_pipe().map_err(Error::PipeCreation)?;
        let (output_read, output_write) = cloexec_pipe().map_err(Error::PipeCreation)?;
        let error_write = output_write.try_clone().map_err(Error::PipeCreation)?;

        set_nonblocking(&output_read).map_err(Error::PipeConfiguration)?;
        let output = OutputEndpoint::new(output_read).map_err(Error::PipeConfiguration)?;

        let mut process = Command::new(command.program());
        process
            .args(command.arguments())
            .stdin(Stdio::from(input_read))
            .stdout(Stdio::from(output_write))
            .stderr(Stdio::from(error_write))
            .envs(config.envs().iter().map(|(k, v)| (k, v)));
        if let Some(dir) = config.working_dir() {
            process.current_dir(dir);
        }

        let child = process.spawn().map_err(|source| Error::Spawn {
            program: command.program().to_string(),
            source,
        })?;
        // `process` still holds the child's ends of both pipes. End-of-stream
        // only reaches us once they are closed on this side.
        drop(process);

        Ok(Self {
            input: Some(File::from(input_write)),
            output: Some(output),
            child: ChildProcess::new(child),
            read_chunk_size: config.read_chunk_size(),
            #[cfg(test)]
            fail_next_wait: false,
        })
    }

    fn pid(&self) -> u32 {
        self.child.pid
    }

    fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let input = self
            .input
            .as_mut()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        input.write_all(bytes)?;
        input.flush()
    }

    fn drain(&mut self, out: &mut Vec<u8>) -> io::Result<DrainEnd> {
        let Some(output) = self.output.as_mut() else {
            return Ok(DrainEnd::EndOfStream);
        };

        let mut chunk = vec![0u8; self.read_chunk_size];
        loop {
            match output.file.read(&mut chunk) {
                Ok(0) => return Ok(DrainEnd::EndOfStream),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(DrainEnd::Empty),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        #[cfg(test)]
        if std::mem::take(&mut self.fail_next_wait) {
            return Err(io::Error::other("injected readiness failure"));
        }

        match self.output.as_mut() {
            Some(output) => output.wait_readable(timeout),
            None => Ok(false),
        }
    }

    fn shutdown(&mut self) {
        self.input.take();
        self.output.take();
        self.child.terminate();
    }
}

/// Create a pipe whose ends are not inherited across exec
///
/// The child's ends are later installed as its stdio with dup2, which clears
/// the flag on the copies it actually uses.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe2 writes.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and unowned.
    Ok(unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) })
}

/// Create a pipe whose ends are not inherited across exec
///
/// Without pipe2 the flag is set after the fact. A fork+exec on another
/// thread between the two calls inherits both ends, and end-of-stream is
/// then delayed until that unrelated child exits.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds: [RawFd; 2] = [-1; 2];
    // SAFETY: `fds` has room for the two descriptors pipe writes.
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe succeeded, so both descriptors are open and unowned.
    let (read, write) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };
    set_cloexec(&read)?;
    set_cloexec(&write)?;
    Ok((read, write))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn set_cloexec(fd: &OwnedFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: `fd` is open for as long as the borrowed OwnedFd lives.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    let fd = fd.as_raw_fd();
    // SAFETY: `fd` is open for as long as the borrowed OwnedFd lives.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
