use crate::broker_session::SessionConfig;
use crate::models::{LaneSet, LaneSetError};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: String,
    pub mqtt_password: String,
    pub mqtt_client_id_prefix: String,
    pub mqtt_max_retries: i32,
    pub mqtt_retry_interval_ms: u64,

    pub control_topic: String,
    pub command_topic: String,

    pub lanes: LaneSet,
    pub db_path: String,
    pub record_timeout_ms: u64,
    pub audit_queue_capacity: usize,
    pub shutdown_drain_ms: u64,
    pub rest_enabled: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
    #[error("Invalid LANES: {0}")]
    Lanes(#[from] LaneSetError),
}

impl Config {
    /// Validate timeout values and other critical configurations.
    fn validate(&self) -> Result<(), ConfigError> {
        const MIN_TIMEOUT: u64 = 100;
        const MAX_TIMEOUT: u64 = 1_000_000;

        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.mqtt_retry_interval_ms) {
            return Err(ConfigError::ParsingError(format!(
                "MQTT_RETRY_INTERVAL_MS must be between {} and {} ms",
                MIN_TIMEOUT, MAX_TIMEOUT
            )));
        }
        if self.record_timeout_ms == 0 {
            return Err(ConfigError::ParsingError(
                "RECORD_TIMEOUT_MS must be greater than 0".to_string(),
            ));
        }
        if self.audit_queue_capacity == 0 {
            return Err(ConfigError::ParsingError(
                "AUDIT_QUEUE_CAPACITY must be greater than 0".to_string(),
            ));
        }
        if self.control_topic == self.command_topic {
            return Err(ConfigError::ParsingError(
                "CONTROL_TOPIC and COMMAND_TOPIC must differ".to_string(),
            ));
        }

        Ok(())
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let prepend_root_topic = |root: &str, topic: &str| {
            if !root.is_empty() {
                format!("{}/{}", root.trim_end_matches('/'), topic.trim_start_matches('/'))
            } else {
                topic.to_string()
            }
        };
        let string_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mqtt_root_topic = lookup("MQTT_ROOT_TOPIC").unwrap_or_default();

        let config = Self {
            mqtt_host: string_or("MQTT_HOST", "broker.emqx.io"),
            mqtt_port: parse_or(&lookup, "MQTT_PORT", 1883)?,
            mqtt_username: lookup("MQTT_USERNAME").unwrap_or_default(),
            mqtt_password: lookup("MQTT_PASSWORD").unwrap_or_default(),
            mqtt_client_id_prefix: string_or("MQTT_CLIENT_ID_PREFIX", "traffic_bridge"),
            mqtt_max_retries: parse_or(&lookup, "MQTT_MAX_RETRIES", -1)?,
            mqtt_retry_interval_ms: parse_or(&lookup, "MQTT_RETRY_INTERVAL_MS", 5000)?,

            control_topic: prepend_root_topic(
                &mqtt_root_topic,
                &string_or("CONTROL_TOPIC", "ArduinoTrafficController"),
            ),
            command_topic: prepend_root_topic(
                &mqtt_root_topic,
                &string_or("COMMAND_TOPIC", "NanoTrafficCommand"),
            ),

            lanes: match lookup("LANES") {
                Some(list) => LaneSet::parse(&list)?,
                None => LaneSet::default(),
            },
            db_path: string_or("DB_PATH", "traffic_activity.db"),
            record_timeout_ms: parse_or(&lookup, "RECORD_TIMEOUT_MS", 5000)?,
            audit_queue_capacity: parse_or(&lookup, "AUDIT_QUEUE_CAPACITY", 64)?,
            shutdown_drain_ms: parse_or(&lookup, "SHUTDOWN_DRAIN_MS", 5000)?,
            rest_enabled: parse_or(&lookup, "REST_ENABLED", true)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Connection settings for one broker session, with a fresh client id.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            host: self.mqtt_host.clone(),
            port: self.mqtt_port,
            username: self.mqtt_username.clone(),
            password: self.mqtt_password.clone(),
            client_id: format!("{}_{}", self.mqtt_client_id_prefix, Uuid::new_v4()),
            control_topic: self.control_topic.clone(),
            retry_interval: Duration::from_millis(self.mqtt_retry_interval_ms),
            max_retries: self.mqtt_max_retries,
        }
    }

    pub fn record_timeout(&self) -> Duration {
        Duration::from_millis(self.record_timeout_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::MissingOrInvalid(key.to_string())),
        None => Ok(default),
    }
}
