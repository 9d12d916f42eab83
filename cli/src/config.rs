use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use tether::CoprocessConfig;

use crate::cli::CommonArgs;

/// How long a reply may stay silent before it is considered complete
pub const DEFAULT_QUIET: Duration = Duration::from_millis(100);

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Process and pipe settings
    pub coprocess: CoprocessSection,

    /// Reply collection settings
    pub session: SessionSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CoprocessSection {
    pub working_dir: Option<PathBuf>,
    pub read_chunk_size: Option<usize>,
    pub peek_interval_ms: Option<u64>,
    pub env: Option<BTreeMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub timeout_ms: Option<u64>,
    pub quiet_ms: Option<u64>,
}

/// Merged configuration from file + CLI
pub struct MergedConfig {
    pub coprocess: CoprocessConfig,
    /// Longest wait for the first byte of a reply, `None` to wait forever
    pub timeout: Option<Duration>,
    pub quiet: Duration,
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &CommonArgs) -> MergedConfig {
    let mut builder = CoprocessConfig::builder();

    if let Some(dir) = cli.working_dir.as_ref().or(file.coprocess.working_dir.as_ref()) {
        builder = builder.working_dir(dir);
    }
    if let Some(bytes) = cli.read_chunk_size.or(file.coprocess.read_chunk_size) {
        builder = builder.read_chunk_size(bytes);
    }
    if let Some(ms) = cli.peek_interval_ms.or(file.coprocess.peek_interval_ms) {
        builder = builder.peek_interval(Duration::from_millis(ms));
    }
    if let Some(env) = file.coprocess.env {
        builder = builder.envs(env);
    }

    let timeout = cli
        .timeout_ms
        .or(file.session.timeout_ms)
        .map(Duration::from_millis);
    let quiet = cli
        .quiet_ms
        .or(file.session.quiet_ms)
        .map_or(DEFAULT_QUIET, Duration::from_millis);

    MergedConfig {
        coprocess: builder.build(),
        timeout,
        quiet,
    }
}
