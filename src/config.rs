//! Environment-driven configuration, `FUZZER_*` prefixed.
//!
//! An embedding process (the HTTP API layer, out of scope here) is expected
//! to construct one [`FuzzerConfig`] at startup and hand it to the
//! [`crate::orchestrator::Orchestrator`]. Every value has a documented
//! default; an explicitly-set but unparseable value is a startup error
//! rather than a silent fallback.

use std::{path::PathBuf, time::Duration};

use crate::error::{ConfigError, Error, Result};

#[derive(Debug, Clone)]
pub struct FuzzerConfig {
    pub api_host: String,
    pub api_port: u16,
    pub corpus_dir: PathBuf,
    pub crash_dir: PathBuf,

    pub max_concurrent_sessions: usize,
    pub max_concurrent_tests: usize,

    pub checkpoint_frequency: u64,
    pub default_history_limit: usize,
    pub tcp_buffer_size: usize,
    pub udp_buffer_size: usize,

    pub havoc_expansion_min: f64,
    pub havoc_expansion_max: f64,
    pub havoc_max_size: usize,
    pub seed_cache_max_size: usize,

    pub stateful_progression_weight: f64,
    pub stateful_reset_interval_bfs: u64,
    pub stateful_reset_interval_dfs: u64,
    pub stateful_reset_interval_targeted: u64,
    pub stateful_reset_interval_random: u64,

    pub termination_test_window: u64,
    pub termination_test_interval: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8080,
            corpus_dir: PathBuf::from("corpus"),
            crash_dir: PathBuf::from("crashes"),
            max_concurrent_sessions: 1,
            max_concurrent_tests: 10,
            checkpoint_frequency: 1000,
            default_history_limit: 100,
            tcp_buffer_size: 4096,
            udp_buffer_size: 4096,
            havoc_expansion_min: 1.5,
            havoc_expansion_max: 3.0,
            havoc_max_size: 4096,
            seed_cache_max_size: 1000,
            stateful_progression_weight: 0.8,
            stateful_reset_interval_bfs: 20,
            stateful_reset_interval_dfs: 500,
            stateful_reset_interval_targeted: 100,
            stateful_reset_interval_random: 300,
            termination_test_window: 3,
            termination_test_interval: 50,
        }
    }
}

impl FuzzerConfig {
    /// Load configuration from the process environment, falling back to
    /// [`FuzzerConfig::default`] for any variable that isn't set.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        cfg.api_host = env_string("FUZZER_API_HOST", cfg.api_host);
        cfg.api_port = env_parsed("FUZZER_API_PORT", cfg.api_port)?;
        cfg.corpus_dir = env_string("FUZZER_CORPUS_DIR", cfg.corpus_dir.to_string_lossy().to_string()).into();
        cfg.crash_dir = env_string("FUZZER_CRASH_DIR", cfg.crash_dir.to_string_lossy().to_string()).into();
        cfg.max_concurrent_sessions = env_parsed("FUZZER_MAX_CONCURRENT_SESSIONS", cfg.max_concurrent_sessions)?;
        cfg.max_concurrent_tests = env_parsed("FUZZER_MAX_CONCURRENT_TESTS", cfg.max_concurrent_tests)?;
        cfg.checkpoint_frequency = env_parsed("FUZZER_CHECKPOINT_FREQUENCY", cfg.checkpoint_frequency)?;
        cfg.default_history_limit = env_parsed("FUZZER_DEFAULT_HISTORY_LIMIT", cfg.default_history_limit)?;
        cfg.tcp_buffer_size = env_parsed("FUZZER_TCP_BUFFER_SIZE", cfg.tcp_buffer_size)?;
        cfg.udp_buffer_size = env_parsed("FUZZER_UDP_BUFFER_SIZE", cfg.udp_buffer_size)?;
        cfg.havoc_expansion_min = env_parsed("FUZZER_HAVOC_EXPANSION_MIN", cfg.havoc_expansion_min)?;
        cfg.havoc_expansion_max = env_parsed("FUZZER_HAVOC_EXPANSION_MAX", cfg.havoc_expansion_max)?;
        cfg.havoc_max_size = env_parsed("FUZZER_HAVOC_MAX_SIZE", cfg.havoc_max_size)?;
        cfg.seed_cache_max_size = env_parsed("FUZZER_SEED_CACHE_MAX_SIZE", cfg.seed_cache_max_size)?;
        cfg.stateful_progression_weight =
            env_parsed("FUZZER_STATEFUL_PROGRESSION_WEIGHT", cfg.stateful_progression_weight)?;
        cfg.stateful_reset_interval_bfs =
            env_parsed("FUZZER_STATEFUL_RESET_INTERVAL_BFS", cfg.stateful_reset_interval_bfs)?;
        cfg.stateful_reset_interval_dfs =
            env_parsed("FUZZER_STATEFUL_RESET_INTERVAL_DFS", cfg.stateful_reset_interval_dfs)?;
        cfg.stateful_reset_interval_targeted =
            env_parsed("FUZZER_STATEFUL_RESET_INTERVAL_TARGETED", cfg.stateful_reset_interval_targeted)?;
        cfg.stateful_reset_interval_random =
            env_parsed("FUZZER_STATEFUL_RESET_INTERVAL_RANDOM", cfg.stateful_reset_interval_random)?;
        cfg.termination_test_window = env_parsed("FUZZER_TERMINATION_TEST_WINDOW", cfg.termination_test_window)?;
        cfg.termination_test_interval =
            env_parsed("FUZZER_TERMINATION_TEST_INTERVAL", cfg.termination_test_interval)?;
        Ok(cfg)
    }

    pub fn default_receive_timeout(&self) -> Duration {
        Duration::from_secs(5)
    }
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn env_parsed<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
{
    match std::env::var(key) {
        Ok(value) => value.parse::<T>().map_err(|_| {
            Error::Config(ConfigError::InvalidValue { key: key.to_string(), value })
        }),
        Err(_) => Ok(default),
    }
}
