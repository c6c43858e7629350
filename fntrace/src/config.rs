//! Runtime configuration, read from environment variables.
//!
//! Every field has a default and a validator; a malformed or missing value
//! never fails startup, it falls back to the default and is logged at info
//! level.

use std::time::Duration;

use tracing::info;

const ENV_MONITOR_INTERVAL: &str = "FNTRACE_MONITOR_INTERVAL";
const ENV_MAX_DEPTH: &str = "FNTRACE_MAX_DEPTH";
const ENV_IGNORE_NAMES: &str = "FNTRACE_IGNORE_NAMES";
const ENV_MEMORY_LIMIT: &str = "FNTRACE_MEMORY_LIMIT";
const ENV_DB_TYPE: &str = "FNTRACE_DB_TYPE";
const ENV_INSERT_MODE: &str = "FNTRACE_INSERT_MODE";
const ENV_PARAM_STORE_MODE: &str = "FNTRACE_PARAM_STORE_MODE";
const ENV_MAX_ELEMENTS: &str = "FNTRACE_MAX_ELEMENTS_PER_CONTAINER";
const ENV_ALLOW_UNEXPORTED: &str = "FNTRACE_ALLOW_UNEXPORTED";

/// How parameters are captured at Enter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStoreMode {
    None,
    Normal,
    All,
}

/// How traced operations reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Sync,
    Async,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub monitor_interval: Duration,
    pub max_depth: usize,
    pub ignore_names: Vec<String>,
    pub memory_limit: u64,
    pub db_type: String,
    pub insert_mode: InsertMode,
    pub param_store_mode: ParamStoreMode,
    pub max_elements_per_container: usize,
    pub allow_unexported: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            monitor_interval: default_monitor_interval(),
            max_depth: default_max_depth(),
            ignore_names: default_ignore_names(),
            memory_limit: default_memory_limit(),
            db_type: default_db_type(),
            insert_mode: InsertMode::Sync,
            param_store_mode: ParamStoreMode::None,
            max_elements_per_container: default_max_elements(),
            allow_unexported: true,
        }
    }
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_max_depth() -> usize {
    3
}
fn default_ignore_names() -> Vec<String> {
    vec!["log".into(), "context".into(), "string".into()]
}
fn default_memory_limit() -> u64 {
    2 * 1024 * 1024 * 1024
}
fn default_db_type() -> String {
    "sqlite".into()
}
fn default_max_elements() -> usize {
    20
}

impl Config {
    /// Load configuration from the process environment. Every field falls
    /// back independently: one malformed variable never drags the rest
    /// back to defaults.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(raw) = std::env::var(ENV_MONITOR_INTERVAL) {
            match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => cfg.monitor_interval = Duration::from_secs(secs),
                _ => info!(
                    value = raw,
                    "invalid {ENV_MONITOR_INTERVAL}, falling back to default"
                ),
            }
        }

        if let Ok(raw) = std::env::var(ENV_MAX_DEPTH) {
            match raw.parse::<usize>() {
                Ok(depth) => cfg.max_depth = depth,
                Err(_) => info!(value = raw, "invalid {ENV_MAX_DEPTH}, falling back to default"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_IGNORE_NAMES) {
            cfg.ignore_names = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(raw) = std::env::var(ENV_MEMORY_LIMIT) {
            match raw.parse::<u64>() {
                Ok(bytes) if bytes > 0 => cfg.memory_limit = bytes,
                _ => info!(value = raw, "invalid {ENV_MEMORY_LIMIT}, falling back to default"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_DB_TYPE) {
            cfg.db_type = raw;
        }

        if let Ok(raw) = std::env::var(ENV_INSERT_MODE) {
            match raw.to_ascii_lowercase().as_str() {
                "sync" => cfg.insert_mode = InsertMode::Sync,
                "async" => cfg.insert_mode = InsertMode::Async,
                _ => info!(value = raw, "invalid {ENV_INSERT_MODE}, falling back to sync"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_PARAM_STORE_MODE) {
            match raw.to_ascii_lowercase().as_str() {
                "none" => cfg.param_store_mode = ParamStoreMode::None,
                "normal" => cfg.param_store_mode = ParamStoreMode::Normal,
                "all" => cfg.param_store_mode = ParamStoreMode::All,
                _ => info!(value = raw, "invalid {ENV_PARAM_STORE_MODE}, falling back to none"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_MAX_ELEMENTS) {
            match raw.parse::<usize>() {
                Ok(n) => cfg.max_elements_per_container = n,
                Err(_) => info!(value = raw, "invalid {ENV_MAX_ELEMENTS}, falling back to default"),
            }
        }

        if let Ok(raw) = std::env::var(ENV_ALLOW_UNEXPORTED) {
            match raw.to_ascii_lowercase().as_str() {
                "true" | "1" => cfg.allow_unexported = true,
                "false" | "0" => cfg.allow_unexported = false,
                _ => info!(value = raw, "invalid {ENV_ALLOW_UNEXPORTED}, falling back to default"),
            }
        }

        cfg
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.ignore_names
            .iter()
            .any(|frag| lower.contains(&frag.to_ascii_lowercase()))
    }
}
