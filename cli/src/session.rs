use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use tether::{CommandLine, Coprocess, CoprocessConfig, ProcessState};

/// Resolve the program on PATH and launch it
pub fn spawn_coprocess(command: &[String], config: &CoprocessConfig) -> Result<Coprocess> {
    let Some((program, args)) = command.split_first() else {
        anyhow::bail!("no program given");
    };
    let resolved = which::which(program)
        .with_context(|| format!("program not found: {program}"))?;
    tracing::debug!(program, resolved = %resolved.display(), "resolved program");

    let command = CommandLine::new([resolved.to_string_lossy().into_owned()])?
        .args(args.iter().cloned())?;
    let coprocess = Coprocess::with_config(command, config.clone())
        .with_context(|| format!("failed to start {program}"))?;
    tracing::info!(pid = coprocess.pid(), "started {}", coprocess.command());
    Ok(coprocess)
}

/// Collect one reply from the coprocess
///
/// Waits up to `timeout` for the first output (forever if `None`), then keeps
/// reading until nothing new arrives for `quiet` or the coprocess stops
/// being ready. Returns an empty buffer when the first wait times out.
pub fn collect_response(
    coprocess: &mut Coprocess,
    timeout: Option<Duration>,
    quiet: Duration,
) -> Vec<u8> {
    let mut response = Vec::new();
    if !coprocess.can_receive_within(timeout) {
        return response;
    }

    let mut last_output = Instant::now();
    while coprocess.status() == ProcessState::Ready {
        let chunk = coprocess.receive();
        if !chunk.is_empty() {
            response.extend(chunk);
            last_output = Instant::now();
        }

        let remaining = quiet.saturating_sub(last_output.elapsed());
        if remaining.is_zero() || !coprocess.can_receive_within(Some(remaining)) {
            break;
        }
    }
    response
}
