use std::io::{self, BufRead, Write};

use anyhow::Context;
use tether::{ProcessState, SendOutcome};

use crate::cli::RunArgs;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::{collect_response, spawn_coprocess};

pub fn execute(args: RunArgs, config: MergedConfig) -> CliResult<()> {
    let mut coprocess = spawn_coprocess(&args.command, &config.coprocess)?;
    let mut stdout = io::stdout().lock();

    for line in io::stdin().lock().lines() {
        let line = line.context("failed to read stdin")?;

        match coprocess.send(format!("{line}\n")) {
            SendOutcome::Succeeded => {}
            SendOutcome::Failed => anyhow::bail!("{} stopped accepting input", coprocess.command()),
            SendOutcome::Errored => {
                anyhow::bail!("{} is {}", coprocess.command(), coprocess.status())
            }
        }

        let reply = collect_response(&mut coprocess, config.timeout, config.quiet);
        if reply.is_empty() {
            tracing::warn!("no reply within the timeout");
        }
        stdout.write_all(&reply)?;
        stdout.flush()?;

        if coprocess.status() != ProcessState::Ready {
            tracing::info!(status = %coprocess.status(), "coprocess is no longer ready");
            break;
        }
    }

    coprocess.terminate();
    Ok(())
}
