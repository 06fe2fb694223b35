//! # Configuration Management
//!
//! Centralized configuration for the tunnel.
//!
//! A configuration has one `[global]` table, one `[logging]` table and any
//! number of `[[service]]` tables. Each service is either an *initiator*
//! (accepts plaintext NETCONF clients and tunnels them out over TLS) or a
//! *responder* (terminates TLS, either on an accepting socket or by calling
//! home, and forwards to the local NETCONF server).
//!
//! ## Configuration Sources
//! - TOML files via [`TunnelConfig::from_file`]
//! - Direct instantiation with defaults
//! - Environment overrides (`USC_TUNNEL_*`)
//!
//! ## Example
//! ```toml
//! [global]
//! concurrency = "thread"
//! max_clients = 500
//!
//! [[service]]
//! name = "netconf"
//! role = "responder"
//! accept = "0.0.0.0:6513"
//! connect = ["127.0.0.1:830"]
//!
//! [service.tls]
//! cert_path = "/etc/usc-tunnel/server.pem"
//! key_path = "/etc/usc-tunnel/server.key"
//! ```

use crate::core::envelope::DEFAULT_APP_ID;
use crate::error::{Result, TunnelError};
use crate::transport::tls::{parse_pin, TlsVersion};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default size of each per-direction buffer
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Default cap on concurrently served connections
pub const DEFAULT_MAX_CLIENTS: usize = 500;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TunnelConfig {
    /// Process-wide settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Tunnel services
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceConfig>,
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Override settings from `USC_TUNNEL_*` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("USC_TUNNEL_CONCURRENCY") {
            self.global.concurrency = Concurrency::parse(&value).ok_or_else(|| {
                TunnelError::ConfigError(format!("USC_TUNNEL_CONCURRENCY: unknown model {value:?}"))
            })?;
        }

        if let Ok(value) = std::env::var("USC_TUNNEL_MAX_CLIENTS") {
            if let Ok(val) = value.parse::<usize>() {
                self.global.max_clients = val;
            }
        }

        if let Ok(value) = std::env::var("USC_TUNNEL_LOG_LEVEL") {
            if let Ok(level) = value.parse::<Level>() {
                self.logging.log_level = level;
            }
        }

        Ok(())
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        let example = Self::default_with_overrides(|c| {
            c.services.push(ServiceConfig {
                name: "netconf-client".into(),
                role: ServiceRole::Initiator,
                accept: Some("127.0.0.1:8300".into()),
                connect: vec!["device.example.net:6513".into()],
                tls: TlsSettings {
                    ca_path: Some("/etc/usc-tunnel/ca.pem".into()),
                    ..TlsSettings::default()
                },
                ..ServiceConfig::default()
            });
            c.services.push(ServiceConfig {
                name: "netconf-callhome".into(),
                role: ServiceRole::Responder,
                call_home: Some("manager.example.net:4335".into()),
                connect: vec!["127.0.0.1:830".into()],
                tls: TlsSettings {
                    cert_path: Some("/etc/usc-tunnel/device.pem".into()),
                    key_path: Some("/etc/usc-tunnel/device.key".into()),
                    ..TlsSettings::default()
                },
                ..ServiceConfig::default()
            });
        });
        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Service by name
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.global.validate());
        errors.extend(self.logging.validate());

        if self.services.is_empty() {
            errors.push("At least one [[service]] must be configured".to_string());
        }

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                errors.push(format!("Duplicate service name: '{}'", service.name));
            }
            errors.extend(service.validate());
        }

        errors
    }

    /// Validate and return Result - convenience method
    ///
    /// Entries starting with `WARNING:` are logged and do not fail.
    pub fn validate_strict(&self) -> Result<()> {
        let (warnings, errors): (Vec<_>, Vec<_>) = self
            .validate()
            .into_iter()
            .partition(|e| e.starts_with("WARNING:"));
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// How connection tasks are executed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Concurrency {
    /// One OS thread per connection
    #[default]
    Thread,
    /// One forked process per connection
    Process,
    /// All connections on one scheduler thread
    Cooperative,
}

impl Concurrency {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "thread" | "threads" => Some(Concurrency::Thread),
            "process" | "fork" => Some(Concurrency::Process),
            "cooperative" | "ucontext" => Some(Concurrency::Cooperative),
            _ => None,
        }
    }
}

/// Process-wide configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Backend used for connection tasks
    pub concurrency: Concurrency,

    /// Maximum number of simultaneously served connections
    pub max_clients: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            concurrency: Concurrency::default(),
            max_clients: DEFAULT_MAX_CLIENTS,
        }
    }
}

impl GlobalConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_clients == 0 {
            errors.push("max_clients must be greater than 0".to_string());
        } else if self.max_clients > 100_000 {
            errors.push(format!(
                "WARNING: max_clients very high: {} (ensure system resources can support this)",
                self.max_clients
            ));
        }

        errors
    }
}

/// Which end of the tunnel a service is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Plaintext in, TLS client out
    #[default]
    Initiator,
    /// TLS server in (accepted or called home), plaintext target out
    Responder,
}

/// TLS settings of one service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Certificate chain (required for responders, optional client cert for initiators)
    pub cert_path: Option<String>,

    /// Private key matching `cert_path`
    pub key_path: Option<String>,

    /// CA bundle used to verify the peer
    pub ca_path: Option<String>,

    /// Require a verified peer certificate (responders: client auth)
    pub verify_peer: bool,

    /// Name checked against the server certificate (initiators)
    pub server_name: Option<String>,

    /// SHA-256 fingerprint of the expected server certificate, hex encoded
    pub pinned_sha256: Option<String>,

    /// Skip server certificate verification (development only)
    pub insecure: bool,

    /// Allowed protocol versions ("1.2", "1.3"); empty means all
    pub versions: Vec<String>,

    /// Server-side session cache capacity (0 disables resumption)
    pub session_cache_size: usize,

    /// Lifetime of cached sessions
    #[serde(with = "duration_serde")]
    pub session_cache_ttl: Duration,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            cert_path: None,
            key_path: None,
            ca_path: None,
            verify_peer: false,
            server_name: None,
            pinned_sha256: None,
            insecure: false,
            versions: Vec::new(),
            session_cache_size: 1000,
            session_cache_ttl: Duration::from_secs(300),
        }
    }
}

impl TlsSettings {
    /// Parsed protocol versions; `None` when unrestricted
    pub fn tls_versions(&self) -> Option<Vec<TlsVersion>> {
        if self.versions.is_empty() {
            return None;
        }
        Some(
            self.versions
                .iter()
                .filter_map(|v| TlsVersion::parse(v))
                .collect(),
        )
    }

    fn validate(&self, service: &str, role: ServiceRole) -> Vec<String> {
        let mut errors = Vec::new();

        for version in &self.versions {
            if TlsVersion::parse(version).is_none() {
                errors.push(format!(
                    "Service '{service}': unknown TLS version '{version}'"
                ));
            }
        }

        if let Some(pin) = &self.pinned_sha256 {
            if let Err(e) = parse_pin(pin) {
                errors.push(format!("Service '{service}': {e}"));
            }
        }

        if self.cert_path.is_some() != self.key_path.is_some() {
            errors.push(format!(
                "Service '{service}': cert_path and key_path must be set together"
            ));
        }

        match role {
            ServiceRole::Responder => {
                if self.cert_path.is_none() {
                    errors.push(format!(
                        "Service '{service}': responder requires tls.cert_path and tls.key_path"
                    ));
                }
                if self.verify_peer && self.ca_path.is_none() {
                    errors.push(format!(
                        "Service '{service}': verify_peer requires tls.ca_path"
                    ));
                }
                if self.session_cache_size > 0 && self.session_cache_ttl.is_zero() {
                    errors.push(format!(
                        "Service '{service}': session_cache_ttl must be greater than 0"
                    ));
                }
            }
            ServiceRole::Initiator => {
                if self.insecure && self.pinned_sha256.is_none() {
                    errors.push(format!(
                        "WARNING: Service '{service}': certificate verification is disabled"
                    ));
                }
            }
        }

        errors
    }
}

/// One tunnel service
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Unique service name, used in logs and the peer-chain cache
    pub name: String,

    /// Tunnel end this service implements
    pub role: ServiceRole,

    /// Listening address (`host:port`)
    pub accept: Option<String>,

    /// Manager address a responder dials out to (`host:port`)
    pub call_home: Option<String>,

    /// Targets tried in order: the TLS peer for initiators, the NETCONF server for responders
    pub connect: Vec<String>,

    /// Application id a responder serves
    pub app_id: u16,

    /// Capacity of each per-direction buffer
    pub buffer_size: usize,

    /// Longest wait for a TLS handshake step
    #[serde(with = "duration_serde")]
    pub busy_timeout: Duration,

    /// Longest idle period while data can still flow
    #[serde(with = "duration_serde")]
    pub idle_timeout: Duration,

    /// Longest wait for the close-notify exchange to finish
    #[serde(with = "duration_serde")]
    pub close_timeout: Duration,

    /// Per-address connect timeout
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Pause between call-home sessions
    #[serde(with = "duration_serde")]
    pub call_home_retry: Duration,

    /// Idle time after which an initiator sends a heartbeat request
    #[serde(
        with = "option_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub heartbeat_interval: Option<Duration>,

    /// Transfer iterations without progress before aborting (0 disables)
    pub max_stall_iterations: u64,

    /// TLS settings
    pub tls: TlsSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: String::from("netconf"),
            role: ServiceRole::default(),
            accept: None,
            call_home: None,
            connect: Vec::new(),
            app_id: DEFAULT_APP_ID,
            buffer_size: DEFAULT_BUFFER_SIZE,
            busy_timeout: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(43_200),
            close_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            call_home_retry: Duration::from_secs(5),
            heartbeat_interval: None,
            max_stall_iterations: 1000,
            tls: TlsSettings::default(),
        }
    }
}

fn check_address(service: &str, label: &str, addr: &str, errors: &mut Vec<String>) {
    match addr.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
        _ => errors.push(format!(
            "Service '{service}': invalid {label} address '{addr}' (expected format: 'host:port')"
        )),
    }
}

impl ServiceConfig {
    /// Name the initiator verifies the server certificate against
    pub fn server_name(&self) -> Option<String> {
        if let Some(name) = &self.tls.server_name {
            return Some(name.clone());
        }
        let first = self.connect.first()?;
        let (host, _) = first.rsplit_once(':')?;
        Some(host.trim_start_matches('[').trim_end_matches(']').to_string())
    }

    /// Validate service configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let name = self.name.as_str();

        if name.is_empty() {
            errors.push("Service name cannot be empty".to_string());
        } else if name.len() > 64 {
            errors.push(format!(
                "Service name too long: {} characters (maximum: 64)",
                name.len()
            ));
        }

        match self.role {
            ServiceRole::Initiator => {
                if self.accept.is_none() {
                    errors.push(format!("Service '{name}': initiator requires 'accept'"));
                }
                if self.call_home.is_some() {
                    errors.push(format!(
                        "Service '{name}': 'call_home' is only valid for responders"
                    ));
                }
            }
            ServiceRole::Responder => match (&self.accept, &self.call_home) {
                (Some(_), Some(_)) => errors.push(format!(
                    "Service '{name}': 'accept' and 'call_home' are mutually exclusive"
                )),
                (None, None) => errors.push(format!(
                    "Service '{name}': responder requires 'accept' or 'call_home'"
                )),
                _ => {}
            },
        }

        if let Some(addr) = &self.accept {
            check_address(name, "accept", addr, &mut errors);
        }
        if let Some(addr) = &self.call_home {
            check_address(name, "call_home", addr, &mut errors);
        }
        if self.connect.is_empty() {
            errors.push(format!("Service '{name}': 'connect' needs at least one target"));
        }
        for addr in &self.connect {
            check_address(name, "connect", addr, &mut errors);
        }

        if self.buffer_size < 1024 {
            errors.push(format!(
                "Service '{name}': buffer_size too small (minimum: 1 KB)"
            ));
        } else if self.buffer_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Service '{name}': buffer_size too large: {} bytes (maximum: 16 MB)",
                self.buffer_size
            ));
        }

        for (label, value, min) in [
            ("busy_timeout", self.busy_timeout, Duration::from_millis(100)),
            ("idle_timeout", self.idle_timeout, Duration::from_millis(100)),
            ("close_timeout", self.close_timeout, Duration::from_millis(10)),
            ("connect_timeout", self.connect_timeout, Duration::from_millis(100)),
            ("call_home_retry", self.call_home_retry, Duration::from_millis(100)),
        ] {
            if value < min {
                errors.push(format!(
                    "Service '{name}': {label} too short (minimum: {}ms)",
                    min.as_millis()
                ));
            }
        }

        if let Some(interval) = self.heartbeat_interval {
            if self.role != ServiceRole::Initiator {
                errors.push(format!(
                    "Service '{name}': heartbeat_interval applies to initiators only"
                ));
            } else if interval < Duration::from_millis(100) {
                errors.push(format!(
                    "Service '{name}': heartbeat_interval too short (minimum: 100ms)"
                ));
            }
        }

        if self.role == ServiceRole::Initiator && self.server_name().is_none() {
            errors.push(format!(
                "Service '{name}': cannot derive a TLS server name; set tls.server_name"
            ));
        }

        errors.extend(self.tls.validate(name, self.role));
        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("usc-tunnel"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization (milliseconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod option_duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_u64(d.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_responder() {
        let config = TunnelConfig::from_toml(
            r#"
            [[service]]
            name = "nc"
            role = "responder"
            accept = "0.0.0.0:6513"
            connect = ["127.0.0.1:830"]
            heartbeat_interval = 1500

            [service.tls]
            cert_path = "a.pem"
            key_path = "a.key"
            "#,
        )
        .expect("parse");
        let svc = &config.services[0];
        assert_eq!(svc.role, ServiceRole::Responder);
        assert_eq!(svc.app_id, DEFAULT_APP_ID);
        assert_eq!(svc.heartbeat_interval, Some(Duration::from_millis(1500)));
        assert_eq!(config.global.concurrency, Concurrency::Thread);
        // heartbeat is initiator-only
        assert_eq!(svc.validate().len(), 1);
    }

    #[test]
    fn test_example_config_round_trips_and_validates() {
        let text = TunnelConfig::example_config();
        let config = TunnelConfig::from_toml(&text).expect("parse example");
        assert_eq!(config.services.len(), 2);
        let errors = config.validate();
        assert!(errors.is_empty(), "{errors:?}");
    }

    #[test]
    fn test_server_name_derived_from_connect() {
        let svc = ServiceConfig {
            connect: vec!["router.lab:6513".into()],
            ..ServiceConfig::default()
        };
        assert_eq!(svc.server_name().as_deref(), Some("router.lab"));
    }

    #[test]
    fn test_concurrency_names() {
        assert_eq!(Concurrency::parse("fork"), Some(Concurrency::Process));
        assert_eq!(Concurrency::parse("Cooperative"), Some(Concurrency::Cooperative));
        assert_eq!(Concurrency::parse("green"), None);
    }
}
