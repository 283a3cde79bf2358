use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{JobsError, Result};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

// ── Engine config ───────────────────────────────────────────────────

/// Tuning knobs for the job manager and its worker pool.
///
/// Parsed from the `[jobs]` table of a TOML file, or built from `JOBS_*`
/// environment variables. Every field has a default so an empty table is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Workers kept alive even when idle.
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,

    /// Upper bound on live worker threads.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,

    /// Idle time after which a worker may retire, in milliseconds.
    #[serde(default = "default_best_before_ms")]
    pub best_before_ms: u64,

    /// Longest single sleep of any blocking wait (join, rule wait, yield).
    #[serde(default = "default_max_wait_interval_ms")]
    pub max_wait_interval_ms: u64,

    /// How many wait intervals shutdown grants running jobs.
    #[serde(default = "default_shutdown_wait_attempts")]
    pub shutdown_wait_attempts: u32,

    /// Thread name prefix for workers.
    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,

    /// Mirror lock traffic into the deadlock detector.
    #[serde(default = "default_deadlock_detection")]
    pub deadlock_detection: bool,

    /// Extra latency per running job applied to rule-less DECORATE jobs.
    #[serde(default = "default_decorate_busy_delay_ms")]
    pub decorate_busy_delay_ms: u64,
}

fn default_min_threads() -> usize {
    1
}

fn default_max_threads() -> usize {
    50
}

fn default_best_before_ms() -> u64 {
    60_000
}

fn default_max_wait_interval_ms() -> u64 {
    100
}

fn default_shutdown_wait_attempts() -> u32 {
    3
}

fn default_worker_name_prefix() -> String {
    "stupid-jobs-worker".into()
}

fn default_deadlock_detection() -> bool {
    true
}

fn default_decorate_busy_delay_ms() -> u64 {
    100
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            best_before_ms: default_best_before_ms(),
            max_wait_interval_ms: default_max_wait_interval_ms(),
            shutdown_wait_attempts: default_shutdown_wait_attempts(),
            worker_name_prefix: default_worker_name_prefix(),
            deadlock_detection: default_deadlock_detection(),
            decorate_busy_delay_ms: default_decorate_busy_delay_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    jobs: Option<JobsConfig>,
}

// ── Loading & Validation ────────────────────────────────────────────

impl JobsConfig {
    /// Build config from environment variables (loads `.env` first).
    pub fn from_env() -> Result<Self> {
        load_dotenv();
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string containing a `[jobs]` table.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(toml_str)?;
        let mut config = file.jobs.unwrap_or_default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Apply environment variable overrides.
    ///
    /// Convention: `JOBS_KEY` overrides `key`, e.g. `JOBS_MAX_THREADS`.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("JOBS_MIN_THREADS") {
            self.min_threads = v;
        }
        if let Some(v) = env_parse("JOBS_MAX_THREADS") {
            self.max_threads = v;
        }
        if let Some(v) = env_parse("JOBS_BEST_BEFORE_MS") {
            self.best_before_ms = v;
        }
        if let Some(v) = env_parse("JOBS_MAX_WAIT_INTERVAL_MS") {
            self.max_wait_interval_ms = v;
        }
        if let Some(v) = env_parse("JOBS_SHUTDOWN_WAIT_ATTEMPTS") {
            self.shutdown_wait_attempts = v;
        }
        if let Some(v) = env_opt("JOBS_WORKER_NAME_PREFIX") {
            self.worker_name_prefix = v;
        }
        if let Some(v) = env_parse("JOBS_DEADLOCK_DETECTION") {
            self.deadlock_detection = v;
        }
        if let Some(v) = env_parse("JOBS_DECORATE_BUSY_DELAY_MS") {
            self.decorate_busy_delay_ms = v;
        }
    }

    /// Reject pool bounds that cannot be honored.
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(JobsError::Config("max_threads must be at least 1".into()));
        }
        if self.min_threads > self.max_threads {
            return Err(JobsError::Config(format!(
                "min_threads ({}) exceeds max_threads ({})",
                self.min_threads, self.max_threads
            )));
        }
        if self.max_wait_interval_ms == 0 {
            return Err(JobsError::Config("max_wait_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn best_before(&self) -> Duration {
        Duration::from_millis(self.best_before_ms)
    }

    pub fn max_wait_interval(&self) -> Duration {
        Duration::from_millis(self.max_wait_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_match_pool_bounds() {
        let config = JobsConfig::default();
        assert_eq!(config.min_threads, 1);
        assert_eq!(config.max_threads, 50);
        assert_eq!(config.best_before(), Duration::from_secs(60));
        assert_eq!(config.max_wait_interval(), Duration::from_millis(100));
        assert!(config.deadlock_detection);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_partial_table() {
        let config = JobsConfig::from_toml(
            r#"
            [jobs]
            max_threads = 4
            worker_name_prefix = "w"
            "#,
        )
        .unwrap();
        assert_eq!(config.max_threads, 4);
        assert_eq!(config.min_threads, 1);
        assert_eq!(config.worker_name_prefix, "w");
    }

    #[test]
    fn missing_table_uses_defaults() {
        let config = JobsConfig::from_toml("").unwrap();
        assert_eq!(config, JobsConfig::default());
    }

    #[test]
    fn min_above_max_rejected() {
        let err = JobsConfig::from_toml(
            r#"
            [jobs]
            min_threads = 8
            max_threads = 2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, JobsError::Config(_)));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[jobs]\nbest_before_ms = 500\ndeadlock_detection = false").unwrap();
        let config = JobsConfig::from_file(file.path()).unwrap();
        assert_eq!(config.best_before_ms, 500);
        assert!(!config.deadlock_detection);
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = JobsConfig::from_toml("[jobs\nmax_threads = ").unwrap_err();
        assert!(matches!(err, JobsError::ConfigParse(_)));
    }
}
