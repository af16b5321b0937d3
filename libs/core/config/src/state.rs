use crate::{env_or_default, env_parse, ConfigError, FromEnv};
use std::path::PathBuf;
use std::time::Duration;

/// Where durable consumer state lives and how often it is written
#[derive(Clone, Debug)]
pub struct StateConfig {
    /// Directory holding the snapshot artifacts
    pub dir: PathBuf,
    /// Batch snapshot writes on this interval; `None` writes after every mutation
    pub persist_interval: Option<Duration>,
}

impl StateConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            persist_interval: None,
        }
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = Some(interval);
        self
    }
}

impl Default for StateConfig {
    fn default() -> Self {
        Self::new("/app")
    }
}

impl FromEnv for StateConfig {
    /// - `STATE_DIR`: snapshot directory (default `/app`)
    /// - `PERSIST_INTERVAL_MS`: batch interval, unset or `0` writes on every mutation
    fn from_env() -> Result<Self, ConfigError> {
        let dir = PathBuf::from(env_or_default("STATE_DIR", "/app"));
        let interval_ms: u64 = env_parse("PERSIST_INTERVAL_MS", 0)?;

        Ok(Self {
            dir,
            persist_interval: (interval_ms > 0).then(|| Duration::from_millis(interval_ms)),
        })
    }
}
