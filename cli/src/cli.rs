use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "tether")]
#[command(version)]
#[command(about = "Drive an interactive program over pipes")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Relay stdin to a coprocess line by line and print its replies
    Run(RunArgs),

    /// Send one message to a coprocess and print the reply
    Query(QueryArgs),
}

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Program to run, followed by its arguments
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

#[derive(Args)]
pub struct QueryArgs {
    /// Message to send; a trailing newline is added if missing
    #[arg(long, short)]
    pub input: String,

    #[command(flatten)]
    pub common: CommonArgs,

    /// Program to run, followed by its arguments
    #[arg(required = true, last = true)]
    pub command: Vec<String>,
}

/// Common arguments shared across subcommands
#[derive(Args)]
pub struct CommonArgs {
    // === Process ===
    /// Directory to start the program in
    #[arg(long)]
    pub working_dir: Option<PathBuf>,

    // === Pipes ===
    /// Bytes requested per read from the output pipe
    #[arg(long)]
    pub read_chunk_size: Option<usize>,

    /// Milliseconds between pipe peeks (Windows only)
    #[arg(long)]
    pub peek_interval_ms: Option<u64>,

    // === Replies ===
    /// Give up on a reply after this many milliseconds without any output
    #[arg(long, env = "TETHER_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Consider a reply complete after this many quiet milliseconds
    #[arg(long)]
    pub quiet_ms: Option<u64>,
}
