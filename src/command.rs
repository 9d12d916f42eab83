use std::borrow::Cow;
use std::fmt;
use std::iter;

use crate::error::{Error, Result};

/// The command vector a coprocess is launched from
///
/// Element 0 is the executable, every further element is one literal
/// argument. Nothing here is ever handed to a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: String,
    args: Vec<String>,
}

impl CommandLine {
    /// Build a command line from a full command vector
    ///
    /// Fails with [`Error::EmptyCommand`] when the vector has no elements and
    /// with [`Error::InvalidArgument`] when an element contains a nul byte,
    /// which no OS accepts in a process argument.
    pub fn new(command: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        let mut elements = command.into_iter().map(Into::into);
        let program = elements.next().ok_or(Error::EmptyCommand)?;
        let line = Self {
            program,
            args: elements.collect(),
        };
        line.validate()?;
        Ok(line)
    }

    /// Add a single argument
    pub fn arg(mut self, arg: impl Into<String>) -> Result<Self> {
        self.args.push(arg.into());
        self.validate()?;
        Ok(self)
    }

    /// Add multiple arguments
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Result<Self> {
        self.args.extend(args.into_iter().map(Into::into));
        self.validate()?;
        Ok(self)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    /// Join the command into a single Windows command-line string
    ///
    /// Arguments are quoted with [`quote_windows_arg`]. The program is only
    /// wrapped in quotes when it contains whitespace, since the first token
    /// of a Windows command line is split on whitespace alone.
    pub fn to_windows_command_line(&self) -> String {
        let mut line = if self.program.contains([' ', '\t']) {
            format!("\"{}\"", self.program)
        } else {
            self.program.clone()
        };
        for arg in &self.args {
            line.push(' ');
            line.push_str(&quote_windows_arg(arg));
        }
        line
    }

    fn validate(&self) -> Result<()> {
        let elements = iter::once(&self.program).chain(&self.args);
        match elements.enumerate().find(|(_, element)| element.contains('\0')) {
            Some((index, _)) => Err(Error::InvalidArgument { index }),
            None => Ok(()),
        }
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<Cow<'_, str>> = iter::once(&self.program)
            .chain(&self.args)
            .map(|element| shell_escape::escape(Cow::Borrowed(element.as_str())))
            .collect();
        f.write_str(&rendered.join(" "))
    }
}

/// Quote one argument so the MSVC runtime splits it back out unchanged
///
/// Arguments without whitespace or quotes pass through untouched. Otherwise
/// the argument is wrapped in quotes, embedded quotes are escaped, and runs
/// of backslashes are doubled wherever they precede a quote (including the
/// closing one).
pub fn quote_windows_arg(arg: &str) -> Cow<'_, str> {
    if !arg.is_empty() && !arg.contains([' ', '\t', '\n', '\x0b', '"']) {
        return Cow::Borrowed(arg);
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => backslashes += 1,
            '"' => {
                quoted.extend(iter::repeat_n('\\', backslashes * 2 + 1));
                quoted.push('"');
                backslashes = 0;
            }
            _ => {
                quoted.extend(iter::repeat_n('\\', backslashes));
                quoted.push(c);
                backslashes = 0;
            }
        }
    }
    quoted.extend(iter::repeat_n('\\', backslashes * 2));
    quoted.push('"');
    Cow::Owned(quoted)
}
