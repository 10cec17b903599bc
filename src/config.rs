use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

/// Application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Environment (dev, staging, prod)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// CORS allowed origins, comma separated
    pub cors_origins: Option<String>,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the shared files
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// JWT secret key. Authorization is disabled when unset.
    pub auth_jwt_secret: Option<String>,

    /// Seconds an empty document room is kept before it is dropped
    #[serde(default = "default_room_cleanup_secs")]
    pub room_cleanup_secs: u64,

    /// Quiet period before a changed document is written back
    #[serde(default = "default_save_delay_ms")]
    pub save_delay_ms: u64,

    /// File poll interval; 0 disables polling
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Use file-system events instead of polling when available
    #[serde(default = "default_file_watch")]
    pub file_watch: bool,

    /// Update log backend: `file` or `memory`
    #[serde(default = "default_update_store")]
    pub update_store: String,
}

impl Config {
    /// Load configuration from environment variables or app.env file
    pub fn load() -> Result<Self, ConfigError> {
        // Try to load from app.env file first
        if std::path::Path::new("app.env").exists() {
            dotenvy::from_filename("app.env").ok();
        } else {
            // Fallback to .env file
            dotenvy::dotenv().ok();
        }

        match envy::from_env::<Config>() {
            Ok(config) => {
                config.validate()?;
                info!("✅ Configuration loaded successfully");
                Ok(config)
            }
            Err(e) => {
                error!("❌ Failed to load configuration: {}", e);
                Err(ConfigError::EnvError(e))
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        match self.update_store.as_str() {
            "file" | "memory" => Ok(()),
            other => Err(ConfigError::Invalid(format!(
                "update_store must be 'file' or 'memory', got '{}'",
                other
            ))),
        }
    }

    /// Get the full server address
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if running in development mode
    pub fn is_development(&self) -> bool {
        self.environment.to_lowercase() == "dev" || self.environment.to_lowercase() == "development"
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            environment: default_environment(),
            log_level: default_log_level(),
            cors_origins: None,
            root_dir: default_root_dir(),
            auth_jwt_secret: None,
            room_cleanup_secs: default_room_cleanup_secs(),
            save_delay_ms: default_save_delay_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            file_watch: default_file_watch(),
            update_store: default_update_store(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable error: {0}")]
    EnvError(#[from] envy::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_root_dir() -> String {
    ".".to_string()
}

fn default_room_cleanup_secs() -> u64 {
    60
}

fn default_save_delay_ms() -> u64 {
    1000
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_file_watch() -> bool {
    true
}

fn default_update_store() -> String {
    "file".to_string()
}
