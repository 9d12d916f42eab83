use std::io;

use thiserror::Error;

/// Result type for coprocess operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up a coprocess
///
/// Only construction is fallible. Once a [`Coprocess`](crate::Coprocess) exists,
/// environmental failures are reported through [`SendOutcome`](crate::SendOutcome)
/// and [`ProcessState`](crate::ProcessState) instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("command vector is empty")]
    EmptyCommand,

    #[error("argument {index} contains an interior nul byte")]
    InvalidArgument { index: usize },

    #[error("pipe creation failed: {0}")]
    PipeCreation(#[source] io::Error),

    #[error("pipe configuration failed: {0}")]
    PipeConfiguration(#[source] io::Error),

    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}
