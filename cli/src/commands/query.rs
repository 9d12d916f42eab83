use std::io::{self, Write};

use tether::SendOutcome;

use crate::cli::QueryArgs;
use crate::config::MergedConfig;
use crate::error::CliResult;
use crate::session::{collect_response, spawn_coprocess};

pub fn execute(args: QueryArgs, config: MergedConfig) -> CliResult<()> {
    let mut coprocess = spawn_coprocess(&args.command, &config.coprocess)?;

    let outcome = coprocess.send(with_newline(&args.input));
    if outcome != SendOutcome::Succeeded {
        anyhow::bail!("failed to send input to {}", coprocess.command());
    }

    let reply = collect_response(&mut coprocess, config.timeout, config.quiet);
    if reply.is_empty() {
        anyhow::bail!("{} did not reply", coprocess.command());
    }

    let mut stdout = io::stdout().lock();
    stdout.write_all(&reply)?;
    stdout.flush()?;
    Ok(())
}

fn with_newline(input: &str) -> String {
    if input.ends_with('\n') {
        input.to_string()
    } else {
        format!("{input}\n")
    }
}
