//! Engine configuration.
//!
//! Every field has a default, so a TOML file only needs the keys it changes:
//!
//! ```toml
//! data_dir = "/var/lib/shuttle"
//! max_reclaims = 5
//!
//! [retry]
//! max_retries = 8
//! base_delay_ms = 10
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoordError;
use crate::store::RetryPolicy;

pub const DATA_DIR_ENV: &str = "SHUTTLE_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 20,
            max_delay_ms: 2_000,
            exponential_base: 2.0,
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            exponential_base: self.exponential_base,
            jitter: self.jitter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding the board files.
    pub data_dir: PathBuf,

    pub retry: RetryConfig,

    /// How long one attempt waits for a board lock.
    pub lock_timeout_ms: u64,

    /// Releases allowed before a task is failed with MAX_RECLAIMS_EXCEEDED.
    pub max_reclaims: u32,

    /// Times `claim_next` re-selects after losing a race.
    pub claim_reselect_attempts: u32,

    /// A claim older than this is considered abandoned by the reaper.
    pub liveness_threshold_ms: u64,

    pub reaper_interval_ms: u64,

    /// Commits between board backups (journal truncation).
    pub checkpoint_interval: usize,

    pub max_message_bytes: usize,

    /// Sweep the backlog after every completion.
    pub auto_promote: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".shuttle"),
            retry: RetryConfig::default(),
            lock_timeout_ms: 2_000,
            max_reclaims: 3,
            claim_reselect_attempts: 3,
            liveness_threshold_ms: 15 * 60 * 1_000,
            reaper_interval_ms: 30_000,
            checkpoint_interval: 32,
            max_message_bytes: 64 * 1024,
            auto_promote: false,
        }
    }
}

impl EngineConfig {
    /// Read a TOML file, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, CoordError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| CoordError::Config(format!("{}: {e}", path.display())))?;
        let mut config = Self::from_toml(&raw)?;
        config.apply_env();
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self, CoordError> {
        toml::from_str(raw).map_err(|e| CoordError::Config(e.to_string()))
    }

    /// Defaults plus environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn apply_env(&mut self) {
        if let Some(dir) = std::env::var_os(DATA_DIR_ENV).filter(|d| !d.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn validate(&self) -> Result<(), CoordError> {
        let invalid = |msg: &str| Err(CoordError::Config(msg.to_string()));

        if self.retry.max_retries == 0 {
            return invalid("retry.max_retries must be at least 1");
        }
        if self.retry.exponential_base < 1.0 || !self.retry.exponential_base.is_finite() {
            return invalid("retry.exponential_base must be a finite number >= 1.0");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid("retry.base_delay_ms cannot exceed retry.max_delay_ms");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return invalid("retry.jitter must be within 0.0..=1.0");
        }
        if self.lock_timeout_ms == 0 {
            return invalid("lock_timeout_ms must be greater than 0");
        }
        if self.checkpoint_interval == 0 {
            return invalid("checkpoint_interval must be greater than 0");
        }
        if self.liveness_threshold_ms == 0 {
            return invalid("liveness_threshold_ms must be greater than 0");
        }
        if self.reaper_interval_ms == 0 {
            return invalid("reaper_interval_ms must be greater than 0");
        }
        if self.max_message_bytes == 0 {
            return invalid("max_message_bytes must be greater than 0");
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn liveness_threshold(&self) -> Duration {
        Duration::from_millis(self.liveness_threshold_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            max_reclaims = 7
            auto_promote = true

            [retry]
            base_delay_ms = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.max_reclaims, 7);
        assert!(config.auto_promote);
        assert_eq!(config.retry.base_delay_ms, 5);
        assert_eq!(config.retry.max_retries, RetryConfig::default().max_retries);
        assert_eq!(config.checkpoint_interval, 32);
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "claim_reselect_attempts = 9").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.claim_reselect_attempts, 9);
    }

    #[test]
    fn bad_toml_is_a_config_error() {
        assert!(matches!(
            EngineConfig::from_toml("max_reclaims = \"many\""),
            Err(CoordError::Config(_))
        ));
    }

    #[test]
    fn validate_rejects_nonsense() {
        let mut config = EngineConfig::default();
        config.retry.exponential_base = 0.5;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.checkpoint_interval = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.retry.base_delay_ms = 10_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_section_maps_to_a_policy() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.base_delay, Duration::from_millis(20));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }
}
