//! Windows backend: anonymous pipes, CreateProcessW, and PeekNamedPipe
//!
//! Windows has no readiness wait for anonymous pipes, so readiness is a
//! peek loop that sleeps `peek_interval` between checks. Reads are only
//! issued for bytes a peek reported, which keeps them from blocking.

use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString, c_void};
use std::fs::File;
use std::io::{self, Read, Write};
use std::iter;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr;
use std::thread;
use std::time::{Duration, Instant};

use windows::Win32::Foundation::{
    ERROR_BROKEN_PIPE, HANDLE, HANDLE_FLAG_INHERIT, HANDLE_FLAGS, SetHandleInformation, TRUE,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::System::Pipes::{CreatePipe, PeekNamedPipe};
use windows::Win32::System::Threading::{
    CREATE_UNICODE_ENVIRONMENT, CreateProcessW, PROCESS_CREATION_FLAGS, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
    STARTUPINFOW, TerminateProcess,
};
use windows::core::{PCWSTR, PWSTR};

use crate::command::CommandLine;
use crate::config::CoprocessConfig;
use crate::error::{Error, Result};
use crate::platform::{Channel, DrainEnd};

/// Suggested pipe buffer size, matching the default read chunk
const PIPE_BUFFER_SIZE: u32 = 2048;

/// Outcome of peeking the output pipe
enum Peek {
    Available(usize),
    Closed,
}

/// The launched process, terminated at most once
struct ChildProcess {
    handle: OwnedHandle,
    pid: u32,
    signalled: bool,
}

impl ChildProcess {
    fn terminate(&mut self) {
        if mem::replace(&mut self.signalled, true) {
            return;
        }
        // SAFETY: the process handle stays open for the lifetime of `self`.
        match unsafe { TerminateProcess(raw(&self.handle), 1) } {
            Ok(()) => tracing::debug!(pid = self.pid, "terminated coprocess"),
            // Fails with access denied once the process has already exited.
            Err(e) => tracing::debug!(pid = self.pid, error = %e, "failed to terminate coprocess"),
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Pipe channel to a child launched with CreateProcessW
pub struct WindowsChannel {
    // Declaration order is drop order: both pipes close before the child is
    // terminated.
    input: Option<File>,
    output: Option<File>,
    child: ChildProcess,
    read_chunk_size: usize,
    peek_interval: Duration,
}

impl WindowsChannel {
    fn peek(output: &File) -> io::Result<Peek> {
        let mut available = 0u32;
        // SAFETY: the handle is open while `output` is borrowed and
        // `available` outlives the call.
        let peeked = unsafe {
            PeekNamedPipe(
                raw(output),
                None,
                0,
                None,
                Some(&mut available as *mut u32),
                None,
            )
        };
        match peeked {
            Ok(()) => Ok(Peek::Available(available as usize)),
            Err(e) if e.code() == ERROR_BROKEN_PIPE.to_hresult() => Ok(Peek::Closed),
            Err(e) => Err(io::Error::from(e)),
        }
    }
}

impl Channel for WindowsChannel {
    fn spawn(command: &CommandLine, config: &CoprocessConfig) -> Result<Self> {
        let (input_read, input_write) = inheritable_pipe().map_err(Error::PipeCreation)?;
        let (output_read, output_write) = inheritable_pipe().map_err(Error::PipeCreation)?;
        // Only the child's ends may be inherited.
        disable_inherit(&input_write).map_err(Error::PipeConfiguration)?;
        disable_inherit(&output_read).map_err(Error::PipeConfiguration)?;

        let mut command_line = wide(OsStr::new(&command.to_windows_command_line()));
        let working_dir = config.working_dir().map(|dir| wide(dir.as_os_str()));
        let environment = environment_block(config.envs());
        let creation_flags = if environment.is_some() {
            CREATE_UNICODE_ENVIRONMENT
        } else {
            PROCESS_CREATION_FLAGS(0)
        };

        let startup_info = STARTUPINFOW {
            cb: mem::size_of::<STARTUPINFOW>() as u32,
            dwFlags: STARTF_USESTDHANDLES,
            hStdInput: raw(&input_read),
            hStdOutput: raw(&output_write),
            hStdError: raw(&output_write),
            ..Default::default()
        };
        let mut process_info = PROCESS_INFORMATION::default();

        // SAFETY: every pointer passed in outlives the call, and
        // `command_line` is the mutable nul-terminated buffer CreateProcessW
        // may write into.
        let launched = unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                TRUE,
                creation_flags,
                environment
                    .as_ref()
                    .map(|block| block.as_ptr() as *const c_void),
                working_dir
                    .as_ref()
                    .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
                &startup_info,
                &mut process_info,
            )
        };
        launched.map_err(|e| Error::Spawn {
            program: command.program().to_string(),
            source: io::Error::from(e),
        })?;

        // SAFETY: CreateProcessW succeeded, so both handles are open and ours.
        let (process, thread) = unsafe {
            (
                OwnedHandle::from_raw_handle(process_info.hProcess.0),
                OwnedHandle::from_raw_handle(process_info.hThread.0),
            )
        };
        drop(thread);
        // The child holds its own copies. Ours have to close for
        // end-of-stream to be observable.
        drop(input_read);
        drop(output_write);

        Ok(Self {
            input: Some(File::from(input_write)),
            output: Some(File::from(output_read)),
            child: ChildProcess {
                handle: process,
                pid: process_info.dwProcessId,
                signalled: false,
            },
            read_chunk_size: config.read_chunk_size(),
            peek_interval: config.peek_interval(),
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
            let available = match Self::peek(output)? {
                Peek::Closed => return Ok(DrainEnd::EndOfStream),
                Peek::Available(0) => return Ok(DrainEnd::Empty),
                Peek::Available(n) => n.min(chunk.len()),
            };
            match output.read(&mut chunk[..available]) {
                Ok(0) => return Ok(DrainEnd::EndOfStream),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn wait_readable(&mut self, timeout: Option<Duration>) -> io::Result<bool> {
        let Some(output) = self.output.as_ref() else {
            return Ok(false);
        };

        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        loop {
            match Self::peek(output)? {
                Peek::Closed => return Ok(true),
                Peek::Available(n) if n > 0 => return Ok(true),
                Peek::Available(_) => {}
            }

            let nap = match deadline {
                None => self.peek_interval,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(false);
                    }
                    (deadline - now).min(self.peek_interval)
                }
            };
            thread::sleep(nap);
        }
    }

    fn shutdown(&mut self) {
        self.input.take();
        self.output.take();
        self.child.terminate();
    }
}

fn raw(handle: &impl AsRawHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle())
}

fn wide(value: &OsStr) -> Vec<u16> {
    value.encode_wide().chain(iter::once(0)).collect()
}

/// Build a UTF-16 environment block: the inherited variables with
/// `overrides` applied, `None` when there is nothing to override
///
/// Variable names are case-insensitive on Windows, so they are matched by
/// their uppercased form.
fn environment_block(overrides: &[(String, String)]) -> Option<Vec<u16>> {
    if overrides.is_empty() {
        return None;
    }

    let mut vars: BTreeMap<String, (OsString, OsString)> = env::vars_os()
        .map(|(k, v)| (k.to_string_lossy().to_uppercase(), (k, v)))
        .collect();
    for (k, v) in overrides {
        vars.insert(k.to_uppercase(), (k.into(), v.into()));
    }

    let mut block = Vec::new();
    for (k, v) in vars.values() {
        block.extend(k.encode_wide());
        block.push(u16::from(b'='));
        block.extend(v.encode_wide());
        block.push(0);
    }
    block.push(0);
    Some(block)
}

fn inheritable_pipe() -> io::Result<(OwnedHandle, OwnedHandle)> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    // SAFETY: all pointers refer to locals that outlive the call.
    unsafe {
        CreatePipe(
            &mut read,
            &mut write,
            Some(&attributes as *const SECURITY_ATTRIBUTES),
            PIPE_BUFFER_SIZE,
        )
    }
    .map_err(io::Error::from)?;
    // SAFETY: CreatePipe succeeded, so both handles are open and unowned.
    Ok(unsafe {
        (
            OwnedHandle::from_raw_handle(read.0),
            OwnedHandle::from_raw_handle(write.0),
        )
    })
}

fn disable_inherit(handle: &OwnedHandle) -> io::Result<()> {
    // SAFETY: the handle is open while borrowed.
    unsafe { SetHandleInformation(raw(handle), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0)) }
        .map_err(io::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wide_is_nul_terminated() {
        assert_eq!(wide(OsStr::new("z3")), [b'z' as u16, b'3' as u16, 0]);
    }

    #[test]
    fn test_environment_block() {
        assert!(environment_block(&[]).is_none());

        let block = environment_block(&[("TETHER_TEST_VAR".into(), "on".into())]).unwrap();
        assert_eq!(block[block.len() - 2..], [0, 0]);
        let text = String::from_utf16_lossy(&block);
        assert!(text.split('\0').any(|entry| entry == "TETHER_TEST_VAR=on"));
    }

    #[test]
    fn test_peek_reports_buffered_bytes_and_hangup() {
        let (read, write) = inheritable_pipe().unwrap();
        let read = File::from(read);
        let mut write = File::from(write);
        assert!(matches!(WindowsChannel::peek(&read).unwrap(), Peek::Available(0)));

        write.write_all(b"unsat\n").unwrap();
        assert!(matches!(WindowsChannel::peek(&read).unwrap(), Peek::Available(6)));

        drop(write);
        let mut buf = [0u8; 6];
        (&read).read_exact(&mut buf).unwrap();
        assert!(matches!(WindowsChannel::peek(&read).unwrap(), Peek::Closed));
    }
}
