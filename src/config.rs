use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RECALC_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Plain,
    Json,
}

/// Process-level settings. Everything comes from the environment (an
/// optional `.env` is loaded first); workspace data lives in SQLite.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub log_filter: String,
    pub log_format: LogFormat,
    pub busy_timeout: Duration,
    pub recalc_retries: u32,
    pub workspace: Option<PathBuf>,
    /// Values that were present but unparseable, reported once logging is up.
    pub warnings: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            log_format: LogFormat::Plain,
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            recalc_retries: DEFAULT_RECALC_RETRIES,
            workspace: None,
            warnings: Vec::new(),
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("JOURNALD_LOG") {
            cfg.log_filter = v;
        }
        if let Some(v) = get("JOURNALD_LOG_FORMAT") {
            match v.to_ascii_lowercase().as_str() {
                "plain" | "text" => cfg.log_format = LogFormat::Plain,
                "json" => cfg.log_format = LogFormat::Json,
                _ => cfg
                    .warnings
                    .push(format!("JOURNALD_LOG_FORMAT={v} is not plain|json, using plain")),
            }
        }
        if let Some(v) = get("JOURNALD_BUSY_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => cfg.busy_timeout = Duration::from_millis(ms),
                Err(_) => cfg.warnings.push(format!(
                    "JOURNALD_BUSY_TIMEOUT_MS={v} is not a number, using {DEFAULT_BUSY_TIMEOUT_MS}"
                )),
            }
        }
        if let Some(v) = get("JOURNALD_RECALC_RETRIES") {
            match v.parse::<u32>() {
                Ok(n) => cfg.recalc_retries = n,
                Err(_) => cfg.warnings.push(format!(
                    "JOURNALD_RECALC_RETRIES={v} is not a number, using {DEFAULT_RECALC_RETRIES}"
                )),
            }
        }
        cfg.workspace = get("JOURNALD_WORKSPACE").map(PathBuf::from);
        cfg
    }
}
