//! Configuration management for the proxy.
//!
//! Parses TOML configuration files and provides typed access to settings.
//! Endpoint-level invariants are enforced at deserialization time (a bad
//! `config.toml` is rejected before the server starts); cross-field
//! invariants that need the whole document (duplicate names, dangling
//! group references) are checked by `Config::validate`.

use crate::error::StartupError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub request_suspend: SuspendConfig,
    pub endpoints: Vec<EndpointConfig>,
    #[serde(default)]
    pub model_pricing: HashMap<String, ModelPricing>,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

fn default_request_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl RetryConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("retry.max_attempts must be >= 1".to_string());
        }
        if self.multiplier <= 1.0 || !self.multiplier.is_finite() {
            return Err("retry.multiplier must be a finite number > 1.0".to_string());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err("retry.max_delay_ms must be >= retry.base_delay_ms".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SuspendConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_suspend_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_max_suspended")]
    pub max_suspended_requests: usize,
}

fn default_suspend_timeout() -> u64 {
    300
}
fn default_max_suspended() -> usize {
    100
}

impl Default for SuspendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout_seconds: default_suspend_timeout(),
            max_suspended_requests: default_max_suspended(),
        }
    }
}

/// One upstream endpoint. Fields are private; validated at deserialization
/// time via the custom `Deserialize` impl below so that a parsed `Endpoint`
/// is always valid for the lifetime of the process.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointConfig {
    name: String,
    url: String,
    #[serde(serialize_with = "redact_token")]
    token: String,
    priority: u32,
    group: String,
    group_priority: u32,
    timeout_seconds: Option<u64>,
}

/// Redacts the auth token when an `EndpointConfig` is serialized (e.g. for
/// the `/config` management endpoint) so it never leaves the process.
fn redact_token<S: serde::Serializer>(_token: &str, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("***redacted***")
}

impl EndpointConfig {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn token(&self) -> &str {
        &self.token
    }
    pub fn priority(&self) -> u32 {
        self.priority
    }
    pub fn group(&self) -> &str {
        &self.group
    }
    pub fn group_priority(&self) -> u32 {
        self.group_priority
    }
    pub fn timeout_seconds(&self, server_default: u64) -> u64 {
        self.timeout_seconds.unwrap_or(server_default)
    }

    fn new(
        name: String,
        url: String,
        token: String,
        priority: u32,
        group: String,
        group_priority: u32,
        timeout_seconds: Option<u64>,
    ) -> Result<Self, String> {
        if name.trim().is_empty() {
            return Err("endpoint.name must not be empty".to_string());
        }
        if url.trim().is_empty() {
            return Err(format!("endpoint '{name}' has an empty url"));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(format!(
                "endpoint '{name}' has url '{url}' which must start with http:// or https://"
            ));
        }
        if priority < 1 {
            return Err(format!("endpoint '{name}' priority must be >= 1"));
        }
        if group.trim().is_empty() {
            return Err(format!("endpoint '{name}' must declare a non-empty group"));
        }
        if group_priority < 1 {
            return Err(format!("endpoint '{name}' group_priority must be >= 1"));
        }
        Ok(Self {
            name,
            url,
            token,
            priority,
            group,
            group_priority,
            timeout_seconds,
        })
    }
}

impl<'de> Deserialize<'de> for EndpointConfig {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, MapAccess, Visitor};
        use std::fmt;

        #[derive(Deserialize)]
        #[serde(field_identifier, rename_all = "snake_case")]
        enum Field {
            Name,
            Url,
            #[serde(alias = "auth_token")]
            Token,
            Priority,
            Group,
            GroupPriority,
            TimeoutSeconds,
        }

        struct EndpointConfigVisitor;

        impl<'de> Visitor<'de> for EndpointConfigVisitor {
            type Value = EndpointConfig;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("an endpoint table with name, url, token, priority, group")
            }

            fn visit_map<V>(self, mut map: V) -> Result<EndpointConfig, V::Error>
            where
                V: MapAccess<'de>,
            {
                let mut name = None;
                let mut url = None;
                let mut token = None;
                let mut priority = None;
                let mut group = None;
                let mut group_priority = None;
                let mut timeout_seconds = None;

                while let Some(key) = map.next_key()? {
                    match key {
                        Field::Name => name = Some(map.next_value()?),
                        Field::Url => url = Some(map.next_value()?),
                        Field::Token => token = Some(map.next_value()?),
                        Field::Priority => priority = Some(map.next_value()?),
                        Field::Group => group = Some(map.next_value()?),
                        Field::GroupPriority => group_priority = Some(map.next_value()?),
                        Field::TimeoutSeconds => timeout_seconds = Some(map.next_value()?),
                    }
                }

                let name: String = name.ok_or_else(|| de::Error::missing_field("name"))?;
                let url: String = url.ok_or_else(|| de::Error::missing_field("url"))?;
                let token: String = token.unwrap_or_default();
                let priority: u32 = priority.unwrap_or(1);
                let group: String = group.ok_or_else(|| de::Error::missing_field("group"))?;
                let group_priority: u32 = group_priority.unwrap_or(1);

                EndpointConfig::new(name, url, token, priority, group, group_priority, timeout_seconds)
                    .map_err(|e| de::Error::custom(format!("invalid endpoint configuration: {e}")))
            }
        }

        deserializer.deserialize_struct(
            "EndpointConfig",
            &["name", "url", "token", "priority", "group", "group_priority", "timeout_seconds"],
            EndpointConfigVisitor,
        )
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_creation: f64,
    #[serde(default)]
    pub cache_read: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrackingConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_database_path")]
    pub database_path: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_true() -> bool {
    true
}
fn default_database_path() -> String {
    "claudefront.db".to_string()
}
fn default_batch_size() -> usize {
    100
}
fn default_buffer_size() -> usize {
    1000
}
fn default_timezone() -> String {
    "UTC".to_string()
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            database_path: default_database_path(),
            batch_size: default_batch_size(),
            buffer_size: default_buffer_size(),
            timezone: default_timezone(),
        }
    }
}

impl TrackingConfig {
    pub fn tz(&self) -> Result<chrono_tz::Tz, String> {
        self.timezone
            .parse()
            .map_err(|_| format!("tracking.timezone '{}' is not a recognized IANA zone", self.timezone))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            metrics_enabled: true,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, StartupError> {
        let path_display = path.as_ref().display().to_string();
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| StartupError::Config(format!("reading '{path_display}': {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| StartupError::Config(format!("parsing '{path_display}': {e}")))?;

        config
            .validate()
            .map_err(|e| StartupError::Config(format!("validating '{path_display}': {e}")))?;

        Ok(config)
    }

    /// Cross-field invariants that a single type's `Deserialize` can't see:
    /// duplicate endpoint names, and the retry/tracking sub-configs' own
    /// internal invariants.
    pub fn validate(&self) -> Result<(), String> {
        self.retry.validate()?;
        self.tracking.tz()?;

        if self.endpoints.is_empty() {
            return Err("at least one endpoint must be configured".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for endpoint in &self.endpoints {
            if !seen.insert(endpoint.name()) {
                return Err(format!("duplicate endpoint name '{}'", endpoint.name()));
            }
        }

        Ok(())
    }

    pub fn pricing_for(&self, model: &str) -> ModelPricing {
        self.model_pricing.get(model).copied().unwrap_or(ModelPricing {
            input: 0.0,
            output: 0.0,
            cache_creation: 0.0,
            cache_read: 0.0,
        })
    }
}
