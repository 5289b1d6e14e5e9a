use interview_core::session_config::TransportTargets;
use std::net::SocketAddr;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub call_engine_url: String,
    pub call_engine_api_key: Option<String>,
    pub workflow_id: String,
    pub interviewer_id: String,
    pub base_url: String,
    pub feedback_service_url: String,
    pub log_level: Level,
}

fn required(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::MissingVar(name.to_string())),
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let bind_address_str =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let call_engine_url = required("CALL_ENGINE_URL")?;
        if !(call_engine_url.starts_with("ws://") || call_engine_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(
                "CALL_ENGINE_URL".to_string(),
                format!("'{}' is not a ws:// or wss:// URL", call_engine_url),
            ));
        }
        let call_engine_api_key = std::env::var("CALL_ENGINE_API_KEY").ok();

        let workflow_id = required("WORKFLOW_ID")?;
        let interviewer_id = required("INTERVIEWER_ID")?;
        let base_url = std::env::var("BASE_URL").unwrap_or_default();
        let feedback_service_url = required("FEEDBACK_SERVICE_URL")?;

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            bind_address,
            call_engine_url,
            call_engine_api_key,
            workflow_id,
            interviewer_id,
            base_url,
            feedback_service_url,
            log_level,
        })
    }

    /// The call engine targets handed to every session.
    pub fn targets(&self) -> TransportTargets {
        TransportTargets {
            workflow_id: self.workflow_id.clone(),
            interviewer_id: self.interviewer_id.clone(),
            base_url: self.base_url.clone(),
        }
    }
}
