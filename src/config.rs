//! Generator configuration.
//!
//! Everything the generator needs is handed to `Generator::init` in a
//! `GeneratorConfig`; nothing is read from the environment. Services that
//! keep their telemetry settings in a config file can use the TOML loader,
//! which follows the usual raw-types-then-validate shape.
//!
//! # Required fields
//! - `module` — module name reported in every message header
//! - `source` — source id (normally the host name)
//!
//! Collectors are `host:port` strings; the first is the primary, the second
//! the backup. An empty list (or `connect_to_collector = false`) runs the
//! generator in log-only mode.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

// ---------------------------------------------------------------------------
// GeneratorConfig
// ---------------------------------------------------------------------------

/// Parameters for `Generator::init`.
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub module: String,
    pub source: String,
    pub node_type: String,
    pub instance_id: String,
    /// `host:port` collector endpoints; `[primary]` or `[primary, backup]`.
    pub collectors: Vec<String>,
    /// Introspect HTTP port; `None` disables the server, `Some(0)` binds an
    /// ephemeral port.
    pub http_port: Option<u16>,
    pub connect_to_collector: bool,
    /// Per-second cap applied to `AsyncSystem` messages (0 = unlimited).
    pub system_log_rate_limit: usize,
    /// Idle-hold delay before a reconnect attempt.
    pub idle_hold_time: Duration,
    /// TCP connect / handshake deadline.
    pub connect_time: Duration,
    /// Unit-test mode: submissions are logged locally and never sent.
    pub unit_test: bool,
}

impl GeneratorConfig {
    pub fn new(module: impl Into<String>, source: impl Into<String>) -> Self {
        GeneratorConfig {
            module: module.into(),
            source: source.into(),
            node_type: String::new(),
            instance_id: "0".to_owned(),
            collectors: Vec::new(),
            http_port: None,
            connect_to_collector: true,
            system_log_rate_limit: 100,
            idle_hold_time: Duration::from_secs(5),
            connect_time: Duration::from_secs(30),
            unit_test: false,
        }
    }

    pub fn primary_collector(&self) -> Option<&str> {
        self.collectors.first().map(String::as_str)
    }

    pub fn secondary_collector(&self) -> Option<&str> {
        self.collectors.get(1).map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    generator: Option<RawGeneratorSection>,
    introspect: Option<RawIntrospectSection>,
    limits: Option<RawLimitsSection>,
}

#[derive(Debug, Deserialize)]
struct RawGeneratorSection {
    module: Option<String>,
    source: Option<String>,
    node_type: Option<String>,
    instance_id: Option<String>,
    collectors: Option<Vec<String>>,
    connect_to_collector: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawIntrospectSection {
    http_port: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct RawLimitsSection {
    system_log_rate_limit: Option<usize>,
    idle_hold_secs: Option<u64>,
    connect_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load generator config from a TOML file.
pub fn load_config_from_path(path: &Path) -> Result<GeneratorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load generator config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<GeneratorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let generator = raw
        .generator
        .ok_or_else(|| ConfigError::MissingField("generator".to_owned()))?;
    let module = generator
        .module
        .filter(|m| !m.is_empty())
        .ok_or_else(|| ConfigError::MissingField("generator.module".to_owned()))?;
    let source = generator
        .source
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ConfigError::MissingField("generator.source".to_owned()))?;

    let collectors = generator.collectors.unwrap_or_default();
    for endpoint in &collectors {
        validate_endpoint(endpoint)?;
    }
    if collectors.len() > 2 {
        return Err(ConfigError::InvalidValue(format!(
            "at most two collectors (primary, backup) are supported, got {}",
            collectors.len()
        )));
    }

    let mut config = GeneratorConfig::new(module, source);
    config.node_type = generator.node_type.unwrap_or_default();
    config.instance_id = generator.instance_id.unwrap_or_else(|| "0".to_owned());
    config.collectors = collectors;
    config.connect_to_collector = generator.connect_to_collector.unwrap_or(true);
    config.http_port = raw.introspect.and_then(|i| i.http_port);
    if let Some(limits) = raw.limits {
        if let Some(limit) = limits.system_log_rate_limit {
            config.system_log_rate_limit = limit;
        }
        if let Some(secs) = limits.idle_hold_secs {
            config.idle_hold_time = Duration::from_secs(secs);
        }
        if let Some(secs) = limits.connect_secs {
            config.connect_time = Duration::from_secs(secs);
        }
    }
    Ok(config)
}

/// Split a `host:port` collector endpoint, validating the port.
pub fn parse_endpoint(endpoint: &str) -> Result<(String, u16), ConfigError> {
    let (host, port) = endpoint
        .rsplit_once(':')
        .ok_or_else(|| ConfigError::InvalidValue(format!("collector '{endpoint}': missing port")))?;
    if host.is_empty() {
        return Err(ConfigError::InvalidValue(format!(
            "collector '{endpoint}': missing host"
        )));
    }
    let port: u16 = port.parse().map_err(|_| {
        ConfigError::InvalidValue(format!("collector '{endpoint}': invalid port '{port}'"))
    })?;
    Ok((host.to_owned(), port))
}

fn validate_endpoint(endpoint: &str) -> Result<(), ConfigError> {
    parse_endpoint(endpoint).map(|_| ())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::{ConfigError, load_config_from_str, parse_endpoint};
    use std::time::Duration;

    const FULL: &str = r#"
        [generator]
        module = "vrouter-agent"
        source = "host-1"
        node_type = "compute"
        instance_id = "0"
        collectors = ["10.0.0.1:8086", "10.0.0.2:8086"]

        [introspect]
        http_port = 8085

        [limits]
        system_log_rate_limit = 50
        idle_hold_secs = 1
    "#;

    #[test]
    fn full_config_parses_with_overrides() {
        let config = load_config_from_str(FULL).unwrap();
        assert_eq!(config.module, "vrouter-agent");
        assert_eq!(config.source, "host-1");
        assert_eq!(config.primary_collector(), Some("10.0.0.1:8086"));
        assert_eq!(config.secondary_collector(), Some("10.0.0.2:8086"));
        assert_eq!(config.http_port, Some(8085));
        assert_eq!(config.system_log_rate_limit, 50);
        assert_eq!(config.idle_hold_time, Duration::from_secs(1));
        // Unset limits keep their defaults.
        assert_eq!(config.connect_time, Duration::from_secs(30));
    }

    #[test]
    fn config_loads_from_a_file_on_disk() {
        let file = tempfile::NamedTempFile::new().expect("temp file");
        std::fs::write(file.path(), FULL).expect("write config");
        let config = super::load_config_from_path(file.path()).unwrap();
        assert_eq!(config.module, "vrouter-agent");
        assert_eq!(config.collectors.len(), 2);
    }

    #[test]
    fn missing_module_is_rejected() {
        let err = load_config_from_str("[generator]\nsource = \"h\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "generator.module"));
    }

    #[test]
    fn bad_collector_endpoint_is_rejected() {
        let toml = "[generator]\nmodule = \"m\"\nsource = \"h\"\ncollectors = [\"no-port\"]\n";
        assert!(matches!(
            load_config_from_str(toml).unwrap_err(),
            ConfigError::InvalidValue(_)
        ));
    }

    #[test]
    fn endpoint_parsing_splits_host_and_port() {
        assert_eq!(
            parse_endpoint("127.0.0.1:8086").unwrap(),
            ("127.0.0.1".to_owned(), 8086)
        );
        assert!(parse_endpoint("1.2.3.4:notaport").is_err());
        assert!(parse_endpoint(":8086").is_err());
    }
}
