//! Runtime-adjustable logging parameters.
//!
//! Local logging of submitted messages (as opposed to shipping them to the
//! collector) is controlled by parameters an operator can flip at runtime
//! through the introspect surface: a master switch, a category filter, a
//! minimum severity, the sink (stdout / rotating file / syslog), and the
//! rotation limits. Emission goes through `tracing`; the embedding service
//! owns the subscriber, which `init_tracing` sets up with the usual
//! env-filter default when nothing is installed yet.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use beacon_protocol::Level;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LOG_FILE: &str = "<stdout>";
pub const DEFAULT_SYSLOG_FACILITY: &str = "LOG_LOCAL0";
const DEFAULT_MAX_FILE_BYTES: u64 = 5_000_000;
const DEFAULT_FILE_BACKUP_COUNT: u32 = 10;

// ---------------------------------------------------------------------------
// Subscriber bootstrap
// ---------------------------------------------------------------------------

/// Install the default `tracing` subscriber (env-filter, "info" fallback).
/// A subscriber already installed by the embedding service wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// The adjustable logging parameter set, as reported and modified through
/// the introspect logging requests.
#[derive(Debug, Clone)]
pub struct LogParams {
    pub enable_local: bool,
    /// Empty means "all categories".
    pub category: String,
    /// Least severe level still logged locally.
    pub level: Level,
    pub file: String,
    pub enable_syslog: bool,
    pub syslog_facility: String,
    pub max_file_bytes: u64,
    pub file_backup_count: u32,
    /// Gates once-per-second suppression of operational drop logs.
    pub rate_limit_drop_log: bool,
}

impl Default for LogParams {
    fn default() -> Self {
        LogParams {
            enable_local: false,
            category: String::new(),
            level: Level::Info,
            file: DEFAULT_LOG_FILE.to_owned(),
            enable_syslog: false,
            syslog_facility: DEFAULT_SYSLOG_FACILITY.to_owned(),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            file_backup_count: DEFAULT_FILE_BACKUP_COUNT,
            rate_limit_drop_log: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct LoggerState {
    params: LogParams,
    /// Per-drop-reason second of the last emitted drop log.
    drop_log_seconds: HashMap<&'static str, i64>,
}

/// Shared handle to the logging parameters; cloned into every component
/// that self-logs messages or drops.
#[derive(Debug, Clone, Default)]
pub struct LoggingHandle {
    state: Arc<Mutex<LoggerState>>,
}

impl LoggingHandle {
    pub fn new() -> Self {
        LoggingHandle::default()
    }

    pub fn params(&self) -> LogParams {
        self.state.lock().expect("logging lock").params.clone()
    }

    pub fn set_local_logging(&self, enable: bool) {
        let mut state = self.state.lock().expect("logging lock");
        if state.params.enable_local != enable {
            info!(from = state.params.enable_local, to = enable, "local logging toggled");
            state.params.enable_local = enable;
        }
    }

    pub fn set_category(&self, category: &str) {
        let mut state = self.state.lock().expect("logging lock");
        if state.params.category != category {
            info!(from = %state.params.category, to = %category, "logging category changed");
            state.params.category = category.to_owned();
        }
    }

    pub fn set_level(&self, level: Level) {
        let mut state = self.state.lock().expect("logging lock");
        if state.params.level != level {
            info!(from = %state.params.level, to = %level, "logging level changed");
            state.params.level = level;
        }
    }

    pub fn set_file(&self, file: &str, max_file_bytes: Option<u64>, backup_count: Option<u32>) {
        let mut state = self.state.lock().expect("logging lock");
        if state.params.file != file {
            info!(from = %state.params.file, to = %file, "logging file changed");
            state.params.file = file.to_owned();
        }
        state.params.max_file_bytes = max_file_bytes.unwrap_or(DEFAULT_MAX_FILE_BYTES);
        state.params.file_backup_count = backup_count.unwrap_or(DEFAULT_FILE_BACKUP_COUNT);
    }

    pub fn set_syslog(&self, enable: bool, facility: &str) {
        let mut state = self.state.lock().expect("logging lock");
        if state.params.syslog_facility != facility {
            info!(from = %state.params.syslog_facility, to = %facility, "syslog facility changed");
            state.params.syslog_facility = facility.to_owned();
        }
        state.params.enable_syslog = enable;
    }

    pub fn set_rate_limit_drop_log(&self, enable: bool) {
        self.state.lock().expect("logging lock").params.rate_limit_drop_log = enable;
    }

    /// Whether a message at `(level, category)` passes the local-log gate.
    pub fn is_logging_allowed(&self, level: Level, category: &str) -> bool {
        let state = self.state.lock().expect("logging lock");
        let params = &state.params;
        if !params.enable_local {
            return false;
        }
        let level_allowed = level <= params.level;
        let category_allowed = params.category.is_empty() || params.category == category;
        level_allowed && category_allowed
    }

    /// Emit `text` at the message's own severity.
    pub fn log_at(&self, level: Level, text: &str) {
        match level {
            Level::Emergency | Level::Alert | Level::Critical | Level::Error => {
                error!("{text}");
            }
            Level::Warning | Level::Notice => warn!("{text}"),
            Level::Info => info!("{text}"),
            _ => debug!("{text}"),
        }
    }

    /// Log an operational drop (`NoSession`-class conditions) at the
    /// message's severity, suppressed to once per second per reason while
    /// `rate_limit_drop_log` is on.
    pub fn log_drop(&self, reason: &'static str, level: Level, text: &str, now_secs: i64) {
        {
            let mut state = self.state.lock().expect("logging lock");
            if state.params.rate_limit_drop_log {
                if state.drop_log_seconds.get(reason) == Some(&now_secs) {
                    return;
                }
                state.drop_log_seconds.insert(reason, now_secs);
            }
        }
        self.log_at(level, &format!("{reason}: {text}"));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
