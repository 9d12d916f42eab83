use std::fmt;
use std::time::Duration;

use crate::command::CommandLine;
use crate::config::CoprocessConfig;
use crate::error::Result;
use crate::platform::{Channel, DrainEnd, NativeChannel};

/// Shortest pause `wait_receivable` will use between readiness checks
const MIN_WAIT_INTERVAL: Duration = Duration::from_millis(1);

/// Lifecycle state of a coprocess channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    /// No child has been launched yet
    Uninitialized,
    /// The child was launched and the channel is usable
    Ready,
    /// Readiness polling failed at the OS level; the output pipe must not be
    /// read again
    Faulted,
    /// The output pipe reached end-of-stream, or the coprocess was terminated
    Exited,
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProcessState::Uninitialized => "uninitialized",
            ProcessState::Ready => "ready",
            ProcessState::Faulted => "faulted",
            ProcessState::Exited => "exited",
        })
    }
}

/// Result of [`Coprocess::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[must_use]
pub enum SendOutcome {
    /// Every byte was written and flushed
    Succeeded,
    /// The write failed, typically because the child closed its stdin
    Failed,
    /// Nothing was written because the coprocess is not [`ProcessState::Ready`]
    Errored,
}

/// An external process driven over a pair of pipes
///
/// The child's stdin is fed by [`send`](Self::send). Its stdout and stderr
/// share one pipe, read by [`receive`](Self::receive) and friends. The bytes
/// are opaque: framing messages is up to the caller.
///
/// All operations run on the calling thread. Dropping the coprocess closes
/// both pipes and then asks the child to terminate without waiting for it.
///
/// # Example
///
/// ```rust,ignore
/// use tether::{Coprocess, SendOutcome};
///
/// let mut solver = Coprocess::spawn(["z3", "-in"])?;
/// assert_eq!(solver.send("(check-sat)\n"), SendOutcome::Succeeded);
/// let reply = solver.wait_receive();
/// assert_eq!(reply, b"sat\n");
/// ```
pub struct Coprocess {
    channel: NativeChannel,
    command: CommandLine,
    state: ProcessState,
}

impl Coprocess {
    /// Launch a coprocess from a command vector with the default configuration
    ///
    /// Element 0 is the executable, the rest are passed as literal arguments.
    pub fn spawn(command: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        Self::with_config(CommandLine::new(command)?, CoprocessConfig::default())
    }

    /// Launch a coprocess with custom configuration
    ///
    /// Either returns a [`ProcessState::Ready`] coprocess or an error; every
    /// pipe created along the way is closed again on failure.
    pub fn with_config(command: CommandLine, config: CoprocessConfig) -> Result<Self> {
        tracing::debug!(command = %command, "launching coprocess");

        let channel = match NativeChannel::spawn(&command, &config) {
            Ok(channel) => channel,
            Err(e) => {
                tracing::debug!(command = %command, error = %e, "coprocess launch failed");
                return Err(e);
            }
        };

        tracing::debug!(command = %command, pid = channel.pid(), "coprocess ready");
        Ok(Self {
            channel,
            command,
            state: ProcessState::Ready,
        })
    }

    pub fn status(&self) -> ProcessState {
        self.state
    }

    pub fn pid(&self) -> u32 {
        self.channel.pid()
    }

    pub fn command(&self) -> &CommandLine {
        &self.command
    }

    /// Write `message` to the child's stdin and flush it
    ///
    /// Returns [`SendOutcome::Errored`] without writing anything unless the
    /// coprocess is ready. A failed write does not change the state.
    pub fn send(&mut self, message: impl AsRef<[u8]>) -> SendOutcome {
        if self.state != ProcessState::Ready {
            return SendOutcome::Errored;
        }

        match self.channel.send(message.as_ref()) {
            Ok(()) => SendOutcome::Succeeded,
            Err(e) => {
                tracing::debug!(pid = self.pid(), error = %e, "send to coprocess failed");
                SendOutcome::Failed
            }
        }
    }

    /// Drain the output the child has produced so far, without blocking
    ///
    /// The result may be empty. If the drain reaches end-of-stream, the bytes
    /// read before it are still returned and the state becomes
    /// [`ProcessState::Exited`].
    ///
    /// # Panics
    ///
    /// Panics unless the state is [`ProcessState::Ready`]. Receiving from a
    /// faulted or exited coprocess is a bug in the caller.
    pub fn receive(&mut self) -> Vec<u8> {
        assert!(
            self.state == ProcessState::Ready,
            "can only receive from a ready coprocess, but `{}` is {}",
            self.command,
            self.state
        );

        let mut response = Vec::new();
        match self.channel.drain(&mut response) {
            Ok(DrainEnd::Empty) => {}
            Ok(DrainEnd::EndOfStream) => self.transition(ProcessState::Exited),
            Err(e) => {
                tracing::warn!(pid = self.pid(), error = %e, "reading coprocess output failed");
            }
        }
        response
    }

    /// Block until output is available, then [`receive`](Self::receive) once
    ///
    /// # Panics
    ///
    /// Panics like `receive` when the coprocess is not ready by the time the
    /// wait ends, e.g. because readiness polling faulted.
    pub fn wait_receive(&mut self) -> Vec<u8> {
        self.can_receive_within(None);
        self.receive()
    }

    /// Check whether output is available right now
    pub fn can_receive(&mut self) -> bool {
        self.can_receive_within(Some(Duration::ZERO))
    }

    /// Wait up to `timeout` for output to become available
    ///
    /// `None` waits without limit. A hung-up pipe counts as available, so the
    /// next `receive` can observe end-of-stream. Returns `false` on timeout,
    /// when the coprocess is not ready, and when the OS readiness check fails;
    /// the last case also moves the state to [`ProcessState::Faulted`].
    pub fn can_receive_within(&mut self, timeout: Option<Duration>) -> bool {
        if self.state != ProcessState::Ready {
            return false;
        }

        match self.channel.wait_readable(timeout) {
            Ok(ready) => ready,
            Err(e) => {
                tracing::warn!(pid = self.pid(), error = %e, "readiness poll failed");
                self.transition(ProcessState::Faulted);
                false
            }
        }
    }

    /// Wait until output is available or the coprocess stops being ready
    ///
    /// Readiness is rechecked at least every `interval`, and the wait ends as
    /// soon as data arrives rather than at the next interval boundary.
    pub fn wait_receivable(&mut self, interval: Duration) {
        let interval = interval.max(MIN_WAIT_INTERVAL);
        while self.state == ProcessState::Ready && !self.can_receive_within(Some(interval)) {}
    }

    /// Close both pipes and ask the child to terminate
    ///
    /// Does not wait for the child to exit. Calling it again does nothing.
    /// A ready coprocess becomes [`ProcessState::Exited`].
    pub fn terminate(&mut self) {
        self.channel.shutdown();
        if self.state == ProcessState::Ready {
            self.transition(ProcessState::Exited);
        }
    }

    fn transition(&mut self, next: ProcessState) {
        tracing::debug!(
            pid = self.pid(),
            from = %self.state,
            to = %next,
            "coprocess state changed"
        );
        self.state = next;
    }
}

impl fmt::Debug for Coprocess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coprocess")
            .field("pid", &self.pid())
            .field("command", &self.command)
            .field("state", &self.state)
            .finish()
    }
}

impl Drop for Coprocess {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::error::Error;
    use crate::platform::unix::reap_exited;

    fn cat() -> Coprocess {
        Coprocess::spawn(["cat"]).unwrap()
    }

    fn read_to_end(coprocess: &mut Coprocess) -> Vec<u8> {
        let mut output = Vec::new();
        while coprocess.status() == ProcessState::Ready {
            output.extend(coprocess.wait_receive());
        }
        output
    }

    #[test]
    fn test_spawn_is_ready() {
        let coprocess = cat();
        assert_eq!(coprocess.status(), ProcessState::Ready);
        assert!(coprocess.pid() > 0);
        assert_eq!(coprocess.command().program(), "cat");
    }

    #[test]
    fn test_spawn_missing_executable_fails() {
        let result = Coprocess::spawn(["/nonexistent/tether-missing-solver", "-in"]);
        match result {
            Err(Error::Spawn { program, source }) => {
                assert_eq!(program, "/nonexistent/tether-missing-solver");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("expected spawn error, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_spawns_do_not_leak_descriptors() {
        for _ in 0..512 {
            assert!(Coprocess::spawn(["/nonexistent/tether-missing-solver"]).is_err());
        }
        // Would fail with EMFILE if the loop above leaked pipes.
        let mut coprocess = cat();
        assert_eq!(coprocess.send("ok\n"), SendOutcome::Succeeded);
    }

    #[test]
    fn test_spawn_empty_command_fails() {
        let result = Coprocess::spawn(Vec::<String>::new());
        assert!(matches!(result, Err(Error::EmptyCommand)));
    }

    #[test]
    fn test_send_to_live_child_succeeds() {
        let mut coprocess = cat();
        assert_eq!(coprocess.send("(check-sat)\n"), SendOutcome::Succeeded);
        assert_eq!(coprocess.send(b"\x00\xff binary"), SendOutcome::Succeeded);
        assert_eq!(coprocess.status(), ProcessState::Ready);
    }

    #[test]
    fn test_send_after_child_exit_fails() {
        let mut coprocess = Coprocess::spawn(["true"]).unwrap();
        // Hang-up on the output pipe means the child is gone.
        assert!(coprocess.can_receive_within(Some(Duration::from_secs(10))));

        let mut outcome = SendOutcome::Succeeded;
        for _ in 0..100 {
            outcome = coprocess.send("(exit)\n");
            if outcome == SendOutcome::Failed {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(outcome, SendOutcome::Failed);
        assert_eq!(coprocess.status(), ProcessState::Ready);
    }

    #[test]
    fn test_echo_round_trip() {
        let mut coprocess = cat();
        assert_eq!(coprocess.send("ping\n"), SendOutcome::Succeeded);
        assert_eq!(coprocess.wait_receive(), b"ping\n");
    }

    #[test]
    fn test_large_message_round_trip() {
        let mut coprocess = cat();
        // Small enough to fit in the echo pipe without a concurrent reader.
        let message: Vec<u8> = (0..32 * 1024).map(|i| b'a' + (i % 26) as u8).collect();
        assert_eq!(coprocess.send(&message), SendOutcome::Succeeded);

        let mut received = Vec::new();
        while received.len() < message.len() {
            received.extend(coprocess.wait_receive());
        }
        assert_eq!(received, message);
    }

    #[test]
    fn test_can_receive_without_data_returns_immediately() {
        let mut coprocess = cat();
        let start = Instant::now();
        assert!(!coprocess.can_receive_within(Some(Duration::ZERO)));
        assert!(start.elapsed() < Duration::from_millis(50));
        assert_eq!(coprocess.status(), ProcessState::Ready);
    }

    #[test]
    fn test_can_receive_matches_zero_timeout() {
        let mut coprocess = cat();
        assert_eq!(coprocess.can_receive(), coprocess.can_receive_within(Some(Duration::ZERO)));
        assert!(!coprocess.can_receive());

        assert_eq!(coprocess.send("x\n"), SendOutcome::Succeeded);
        coprocess.wait_receivable(Duration::from_millis(10));
        assert!(coprocess.can_receive());
        assert!(coprocess.can_receive_within(Some(Duration::ZERO)));
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let mut coprocess = cat();
        let start = Instant::now();
        assert!(!coprocess.can_receive_within(Some(Duration::from_millis(100))));
        assert!(start.elapsed() >= Duration::from_millis(90));
        assert_eq!(coprocess.status(), ProcessState::Ready);
    }

    #[test]
    fn test_wait_receivable_returns_when_data_arrives() {
        let mut coprocess = Coprocess::spawn(["sh", "-c", "sleep 0.2; echo ready; sleep 30"]).unwrap();
        let start = Instant::now();
        coprocess.wait_receivable(Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(coprocess.receive(), b"ready\n");
    }

    #[test]
    fn test_wait_receivable_returns_when_child_exits() {
        let mut coprocess = Coprocess::spawn(["true"]).unwrap();
        coprocess.wait_receivable(Duration::from_secs(60));
        assert!(coprocess.receive().is_empty());
        assert_eq!(coprocess.status(), ProcessState::Exited);
        // Not ready any more, so this must return immediately.
        coprocess.wait_receivable(Duration::from_secs(60));
    }

    #[test]
    fn test_receive_after_drain_is_empty() {
        let mut coprocess = cat();
        assert_eq!(coprocess.send("a\n"), SendOutcome::Succeeded);
        assert_eq!(coprocess.wait_receive(), b"a\n");
        assert!(coprocess.receive().is_empty());
        assert!(coprocess.receive().is_empty());
        assert_eq!(coprocess.status(), ProcessState::Ready);
    }

    #[test]
    fn test_receive_preserves_order_across_calls() {
        let mut coprocess = cat();
        let mut output = Vec::new();
        for line in ["one\n", "two\n", "three\n"] {
            assert_eq!(coprocess.send(line), SendOutcome::Succeeded);
            output.extend(coprocess.wait_receive());
        }
        assert_eq!(output, b"one\ntwo\nthree\n");
    }

    #[test]
    fn test_stdout_and_stderr_are_merged() {
        let mut coprocess =
            Coprocess::spawn(["sh", "-c", "echo out; sleep 0.05; echo err 1>&2"]).unwrap();
        let output = read_to_end(&mut coprocess);
        assert_eq!(output, b"out\nerr\n");
    }

    #[test]
    fn test_end_of_stream_moves_to_exited() {
        let mut coprocess = Coprocess::spawn(["sh", "-c", "printf 'unsat\\n'"]).unwrap();
        let output = read_to_end(&mut coprocess);
        assert_eq!(output, b"unsat\n");
        assert_eq!(coprocess.status(), ProcessState::Exited);
        assert_eq!(coprocess.send("(exit)\n"), SendOutcome::Errored);
        assert!(!coprocess.can_receive());
    }

    #[test]
    fn test_arguments_are_not_shell_interpreted() {
        let mut coprocess =
            Coprocess::spawn(["printf", "%s|", "$HOME", "two words", "*"]).unwrap();
        let output = read_to_end(&mut coprocess);
        assert_eq!(output, b"$HOME|two words|*|");
    }

    #[test]
    fn test_working_dir() {
        let command = CommandLine::new(["pwd"]).unwrap();
        let config = CoprocessConfig::builder().working_dir("/").build();
        let mut coprocess = Coprocess::with_config(command, config).unwrap();
        assert_eq!(read_to_end(&mut coprocess), b"/\n");
    }

    #[test]
    fn test_environment_overrides() {
        let command = CommandLine::new(["sh", "-c", "printf %s \"$TETHER_MODE\""]).unwrap();
        let config = CoprocessConfig::builder().env("TETHER_MODE", "smt2").build();
        let mut coprocess = Coprocess::with_config(command, config).unwrap();
        assert_eq!(read_to_end(&mut coprocess), b"smt2");
    }

    #[test]
    #[should_panic(expected = "can only receive from a ready coprocess")]
    fn test_receive_after_exit_panics() {
        let mut coprocess = Coprocess::spawn(["true"]).unwrap();
        read_to_end(&mut coprocess);
        coprocess.receive();
    }

    #[test]
    #[should_panic(expected = "can only receive from a ready coprocess")]
    fn test_receive_after_terminate_panics() {
        let mut coprocess = cat();
        coprocess.terminate();
        coprocess.receive();
    }

    #[test]
    fn test_terminate_is_idempotent() {
        let mut coprocess = cat();
        coprocess.terminate();
        assert_eq!(coprocess.status(), ProcessState::Exited);
        coprocess.terminate();
        assert_eq!(coprocess.status(), ProcessState::Exited);
        assert_eq!(coprocess.send("x\n"), SendOutcome::Errored);
        assert!(!coprocess.can_receive_within(None));
    }

    #[test]
    fn test_repeated_spawn_and_drop_releases_resources() {
        for _ in 0..256 {
            let mut coprocess = cat();
            assert_eq!(coprocess.status(), ProcessState::Ready);
            let _ = coprocess.send("x\n");
        }
        let mut coprocess = cat();
        assert_eq!(coprocess.send("still ok\n"), SendOutcome::Succeeded);
        assert_eq!(coprocess.wait_receive(), b"still ok\n");
    }

    #[test]
    fn test_drop_terminates_child() {
        let coprocess = Coprocess::spawn(["sleep", "30"]).unwrap();
        let pid = coprocess.pid() as libc::pid_t;
        drop(coprocess);

        // A zombie still answers signal 0, so this only ends once the child
        // has exited and been reaped.
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            reap_exited();
            // SAFETY: signal 0 only checks that the process exists.
            if unsafe { libc::kill(pid, 0) } != 0 {
                break;
            }
            assert!(Instant::now() < deadline, "child {pid} not reaped after drop");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn faulted_cat() -> Coprocess {
        let mut coprocess = cat();
        coprocess.channel.fail_next_wait();
        assert!(!coprocess.can_receive());
        coprocess
    }

    #[test]
    fn test_readiness_error_moves_to_faulted() {
        let mut coprocess = faulted_cat();
        assert_eq!(coprocess.status(), ProcessState::Faulted);
        assert!(!coprocess.can_receive());
        assert!(!coprocess.can_receive_within(None));
        assert_eq!(coprocess.status(), ProcessState::Faulted);
    }

    #[test]
    fn test_send_while_faulted_is_errored() {
        let mut coprocess = faulted_cat();
        assert_eq!(coprocess.send("(check-sat)\n"), SendOutcome::Errored);
    }

    #[test]
    #[should_panic(expected = "can only receive from a ready coprocess")]
    fn test_receive_while_faulted_panics() {
        let mut coprocess = faulted_cat();
        coprocess.receive();
    }

    #[test]
    fn test_wait_receivable_stops_on_fault() {
        let mut coprocess = cat();
        coprocess.channel.fail_next_wait();
        let start = Instant::now();
        coprocess.wait_receivable(Duration::from_secs(60));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(coprocess.status(), ProcessState::Faulted);
    }

    #[test]
    fn test_terminate_keeps_faulted() {
        let mut coprocess = faulted_cat();
        coprocess.terminate();
        assert_eq!(coprocess.status(), ProcessState::Faulted);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ProcessState::Ready.to_string(), "ready");
        assert_eq!(ProcessState::Faulted.to_string(), "faulted");
        assert_eq!(ProcessState::Exited.to_string(), "exited");
        assert_eq!(ProcessState::Uninitialized.to_string(), "uninitialized");
    }
}
