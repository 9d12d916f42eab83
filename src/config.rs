use std::path::{Path, PathBuf};
use std::time::Duration;

/// Bytes requested from the output pipe per read while draining
pub const DEFAULT_READ_CHUNK_SIZE: usize = 2048;

/// Sleep between peeks on backends without a blocking readiness wait
pub const DEFAULT_PEEK_INTERVAL: Duration = Duration::from_millis(10);

/// Settings for launching and talking to a coprocess
#[derive(Debug, Clone)]
pub struct CoprocessConfig {
    read_chunk_size: usize,
    peek_interval: Duration,
    working_dir: Option<PathBuf>,
    envs: Vec<(String, String)>,
}

impl Default for CoprocessConfig {
    fn default() -> Self {
        Self {
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            peek_interval: DEFAULT_PEEK_INTERVAL,
            working_dir: None,
            envs: Vec::new(),
        }
    }
}

impl CoprocessConfig {
    /// Create a new builder for CoprocessConfig
    pub fn builder() -> CoprocessConfigBuilder {
        CoprocessConfigBuilder::default()
    }

    pub fn read_chunk_size(&self) -> usize {
        self.read_chunk_size
    }

    /// Only consulted by the Windows backend, where readiness is checked by
    /// peeking the pipe in a sleep loop.
    pub fn peek_interval(&self) -> Duration {
        self.peek_interval
    }

    /// Directory the coprocess starts in, `None` to inherit ours
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Variables set for the coprocess on top of the inherited environment
    pub fn envs(&self) -> &[(String, String)] {
        &self.envs
    }
}

/// Builder for CoprocessConfig
#[derive(Debug, Default)]
pub struct CoprocessConfigBuilder {
    inner: CoprocessConfig,
}

impl CoprocessConfigBuilder {
    /// Values of zero are raised to one byte
    pub fn read_chunk_size(mut self, bytes: usize) -> Self {
        self.inner.read_chunk_size = bytes.max(1);
        self
    }

    /// Values below one millisecond are raised to one millisecond
    pub fn peek_interval(mut self, interval: Duration) -> Self {
        self.inner.peek_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.inner.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Set an environment variable; later values for the same key win
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inner.envs.push((key.into(), value.into()));
        self
    }

    pub fn envs(
        mut self,
        vars: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        self.inner
            .envs
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn build(self) -> CoprocessConfig {
        self.inner
    }
}
