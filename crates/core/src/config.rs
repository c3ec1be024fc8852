use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

/// Errors produced while loading or validating [`ScannerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

// ── Scanner scheduler config ──────────────────────────────────

/// Sizing and budget knobs for the scan scheduler, typically parsed from TOML.
///
/// Every field has a default, so an empty document is a valid config.
/// Environment variables override file values, keyed by the upper-cased field name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Threads in the local scan pool (min = max).
    #[serde(default = "default_thread_num")]
    pub scanner_thread_pool_thread_num: usize,
    /// Queue length of the local scan pool.
    #[serde(default = "default_queue_size")]
    pub scanner_thread_pool_queue_size: usize,
    /// Max threads in the remote scan pool. -1 = derive from core count.
    #[serde(default = "default_max_remote_threads")]
    pub max_remote_scanner_thread_pool_thread_num: i64,
    /// Threads the remote scan pool keeps alive when idle.
    #[serde(default = "default_min_threads")]
    pub scanner_min_thread_pool_thread_num: usize,
    /// Queue length of the remote scan pool.
    #[serde(default = "default_queue_size")]
    pub remote_scanner_thread_pool_queue_size: usize,
    /// Bytes one quantum may read before yielding.
    #[serde(default = "default_row_bytes")]
    pub scanner_row_bytes: usize,
    /// Wall time one quantum may run before yielding.
    #[serde(default = "default_max_run_time_ms")]
    pub scanner_max_run_time_ms: u64,
    /// Nice value applied to scan threads. 0 leaves priority alone.
    #[serde(default)]
    pub scan_thread_nice_value: i32,
    /// How long an elastic worker above the minimum may sit idle.
    #[serde(default = "default_idle_timeout_ms")]
    pub pool_idle_timeout_ms: u64,
}

fn default_thread_num() -> usize { 48 }
fn default_queue_size() -> usize { 102_400 }
fn default_max_remote_threads() -> i64 { -1 }
fn default_min_threads() -> usize { 8 }
fn default_row_bytes() -> usize { 10 * 1024 * 1024 }
fn default_max_run_time_ms() -> u64 { 1000 }
fn default_idle_timeout_ms() -> u64 { 60_000 }

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            scanner_thread_pool_thread_num: default_thread_num(),
            scanner_thread_pool_queue_size: default_queue_size(),
            max_remote_scanner_thread_pool_thread_num: default_max_remote_threads(),
            scanner_min_thread_pool_thread_num: default_min_threads(),
            remote_scanner_thread_pool_queue_size: default_queue_size(),
            scanner_row_bytes: default_row_bytes(),
            scanner_max_run_time_ms: default_max_run_time_ms(),
            scan_thread_nice_value: 0,
            pool_idle_timeout_ms: default_idle_timeout_ms(),
        }
    }
}

impl ScannerConfig {
    /// Parse from a TOML string, then apply env overrides and validate.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: ScannerConfig = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    /// Defaults overridden by the environment (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        env_override(
            "SCANNER_THREAD_POOL_THREAD_NUM",
            &mut self.scanner_thread_pool_thread_num,
        );
        env_override(
            "SCANNER_THREAD_POOL_QUEUE_SIZE",
            &mut self.scanner_thread_pool_queue_size,
        );
        env_override(
            "MAX_REMOTE_SCANNER_THREAD_POOL_THREAD_NUM",
            &mut self.max_remote_scanner_thread_pool_thread_num,
        );
        env_override(
            "SCANNER_MIN_THREAD_POOL_THREAD_NUM",
            &mut self.scanner_min_thread_pool_thread_num,
        );
        env_override(
            "REMOTE_SCANNER_THREAD_POOL_QUEUE_SIZE",
            &mut self.remote_scanner_thread_pool_queue_size,
        );
        env_override("SCANNER_ROW_BYTES", &mut self.scanner_row_bytes);
        env_override("SCANNER_MAX_RUN_TIME_MS", &mut self.scanner_max_run_time_ms);
        env_override("SCAN_THREAD_NICE_VALUE", &mut self.scan_thread_nice_value);
        env_override("SCANNER_POOL_IDLE_TIMEOUT_MS", &mut self.pool_idle_timeout_ms);
    }

    /// Reject configurations the scheduler cannot start with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scanner_thread_pool_thread_num == 0 {
            return Err(ConfigError::Invalid(
                "scanner_thread_pool_thread_num must be > 0".into(),
            ));
        }
        if self.scanner_min_thread_pool_thread_num == 0 {
            return Err(ConfigError::Invalid(
                "scanner_min_thread_pool_thread_num must be > 0".into(),
            ));
        }
        if self.max_remote_scanner_thread_pool_thread_num == 0
            || self.max_remote_scanner_thread_pool_thread_num < -1
        {
            return Err(ConfigError::Invalid(format!(
                "max_remote_scanner_thread_pool_thread_num must be -1 or > 0, got {}",
                self.max_remote_scanner_thread_pool_thread_num
            )));
        }
        if self.scanner_row_bytes == 0 {
            return Err(ConfigError::Invalid("scanner_row_bytes must be > 0".into()));
        }
        if !(-20..=19).contains(&self.scan_thread_nice_value) {
            return Err(ConfigError::Invalid(format!(
                "scan_thread_nice_value must be within -20..=19, got {}",
                self.scan_thread_nice_value
            )));
        }
        Ok(())
    }

    /// Max threads for the remote scan pool.
    ///
    /// Uses the explicit override when set, otherwise `max(512, 10 * cores)`.
    /// Never smaller than the local pool.
    pub fn remote_scan_thread_num(&self, num_cores: usize) -> usize {
        let derived = if self.max_remote_scanner_thread_pool_thread_num != -1 {
            self.max_remote_scanner_thread_pool_thread_num.max(1) as usize
        } else {
            512.max(num_cores * 10)
        };
        derived.max(self.scanner_thread_pool_thread_num)
    }

    /// Lower bound of the remote pool, capped by its maximum.
    pub fn remote_scan_min_thread_num(&self, num_cores: usize) -> usize {
        self.scanner_min_thread_pool_thread_num
            .min(self.remote_scan_thread_num(num_cores))
    }

    pub fn max_run_time(&self) -> Duration {
        Duration::from_millis(self.scanner_max_run_time_ms)
    }

    pub fn pool_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.pool_idle_timeout_ms)
    }

    /// Print the resolved sizing for startup logs.
    pub fn log_summary(&self, num_cores: usize) {
        tracing::info!("Scanner config loaded ({} cores):", num_cores);
        tracing::info!(
            "  local pool:  threads={}, queue={}",
            self.scanner_thread_pool_thread_num,
            self.scanner_thread_pool_queue_size
        );
        tracing::info!(
            "  remote pool: threads={}..{}, queue={}",
            self.remote_scan_min_thread_num(num_cores),
            self.remote_scan_thread_num(num_cores),
            self.remote_scanner_thread_pool_queue_size
        );
        tracing::info!(
            "  quantum:     bytes={}, max_run_time={}ms, nice={}",
            self.scanner_row_bytes,
            self.scanner_max_run_time_ms,
            self.scan_thread_nice_value
        );
    }
}

fn env_override<T: std::str::FromStr>(key: &str, slot: &mut T) {
    if let Ok(v) = std::env::var(key) {
        match v.trim().parse::<T>() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(key, value = %v, "ignoring unparsable env override"),
        }
    }
}
