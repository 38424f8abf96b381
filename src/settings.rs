// Layered application configuration
// Defaults -> optional file -> FLOWGATE__* environment variables

//! # Settings
//!
//! [`AppConfig`] is assembled with the `config` crate from three layers, each
//! overriding the previous one:
//!
//! 1. Built-in defaults (`AppConfig::default()`)
//! 2. An optional file: the path given to [`AppConfig::load`], otherwise
//!    `flowgate.toml` / `flowgate.yaml` / `flowgate.json` in the working directory
//! 3. Environment variables such as `FLOWGATE__SERVER__PORT=8080` or
//!    `FLOWGATE__QUEUES__EVENT_CONCURRENCY=8`
//!
//! The binary loads `.env` with `dotenv` before calling [`AppConfig::load`], so
//! variables from that file take part in layer 3.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub queues: QueueConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub messaging: MessagingConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_enabled: true,
        }
    }
}

/// Worker pool sizing for the event, timer and child-schema queues
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_concurrency")]
    pub event_concurrency: usize,

    #[serde(default = "default_concurrency")]
    pub timer_concurrency: usize,

    #[serde(default = "default_concurrency")]
    pub child_concurrency: usize,

    /// Deadline for a single queued task
    #[serde(default = "default_task_deadline")]
    pub task_deadline_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            event_concurrency: default_concurrency(),
            timer_concurrency: default_concurrency(),
            child_concurrency: default_concurrency(),
            task_deadline_secs: default_task_deadline(),
        }
    }
}

impl QueueConfig {
    pub fn task_deadline(&self) -> Duration {
        Duration::from_secs(self.task_deadline_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on nodes walked in one `execute_immediately` chain
    #[serde(default = "default_max_chain_steps")]
    pub max_chain_steps: usize,

    /// Location match radius when a context param declares no threshold
    #[serde(default = "default_location_threshold")]
    pub default_location_threshold_meters: f64,

    /// Timestamp match window when a context param declares no threshold
    #[serde(default = "default_time_window")]
    pub default_time_window_secs: u64,

    /// Timeout for HTTP requests made by actions (RestApiCall, ApiEndpoint output)
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
}

impl EngineConfig {
    pub fn action_timeout(&self) -> Duration {
        Duration::from_secs(self.action_timeout_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_chain_steps: default_max_chain_steps(),
            default_location_threshold_meters: default_location_threshold(),
            default_time_window_secs: default_time_window(),
            action_timeout_secs: default_action_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingConfig {
    /// Outbound messages are POSTed here; when unset they are only logged
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    4000
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    4
}

fn default_task_deadline() -> u64 {
    60
}

fn default_max_chain_steps() -> usize {
    32
}

fn default_location_threshold() -> f64 {
    100.0
}

fn default_time_window() -> u64 {
    86_400
}

fn default_action_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    10
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder =
            ::config::Config::builder().add_source(::config::Config::try_from(&AppConfig::default())?);

        builder = match path {
            Some(path) => builder.add_source(::config::File::with_name(path)),
            None => builder.add_source(::config::File::with_name("flowgate").required(false)),
        };

        builder = builder.add_source(
            ::config::Environment::with_prefix("FLOWGATE")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let queues = &self.queues;
        if queues.event_concurrency == 0 || queues.timer_concurrency == 0 || queues.child_concurrency == 0 {
            return Err(crate::FlowgateError::Validation(
                "queue concurrency must be at least 1".to_string(),
            ));
        }
        if self.engine.max_chain_steps == 0 {
            return Err(crate::FlowgateError::Validation(
                "engine.max_chain_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.queues.event_concurrency, 4);
        assert_eq!(config.queues.timer_concurrency, 4);
        assert_eq!(config.engine.max_chain_steps, 32);
        assert_eq!(config.engine.default_location_threshold_meters, 100.0);
        assert_eq!(config.engine.action_timeout(), Duration::from_secs(30));
        assert!(config.messaging.webhook_url.is_none());
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = AppConfig::load(None).unwrap();
        assert_eq!(config.queues.task_deadline(), Duration::from_secs(60));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = AppConfig::default();
        config.queues.timer_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
