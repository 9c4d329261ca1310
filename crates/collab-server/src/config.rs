use collab_core::Config as EngineConfig;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host (default: 0.0.0.0)
    pub host: String,
    /// Server port (default: 3030)
    pub port: u16,
    /// Directory documents are persisted to when no database is configured
    /// (default: ./data)
    pub storage_dir: PathBuf,
    /// CORS allowed origins (comma-separated; default: none)
    pub cors_origins: Vec<String>,
    /// Engine tunables (debounce, cluster prefix, frame size, ...).
    pub engine: EngineConfig,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// documented defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3030".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let storage_dir =
            PathBuf::from(env::var("STORAGE_DIR").unwrap_or_else(|_| "./data".to_string()));

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut engine = EngineConfig::default();
        if let Ok(v) = env::var("DEBOUNCE_MS") {
            engine.debounce = Duration::from_millis(v.parse().map_err(|_| ConfigError::InvalidDuration("DEBOUNCE_MS"))?);
        }
        if let Ok(v) = env::var("MAX_DEBOUNCE_MS") {
            engine.max_debounce = Duration::from_millis(
                v.parse().map_err(|_| ConfigError::InvalidDuration("MAX_DEBOUNCE_MS"))?,
            );
        }
        if let Ok(v) = env::var("UNLOAD_GRACE_MS") {
            engine.unload_grace = Duration::from_millis(
                v.parse().map_err(|_| ConfigError::InvalidDuration("UNLOAD_GRACE_MS"))?,
            );
        }
        if let Ok(v) = env::var("UNLOAD_TIMEOUT_MS") {
            engine.unload_timeout = Duration::from_millis(
                v.parse().map_err(|_| ConfigError::InvalidDuration("UNLOAD_TIMEOUT_MS"))?,
            );
        }
        if let Ok(v) = env::var("AWARENESS_TIMEOUT_MS") {
            engine.awareness_timeout = Duration::from_millis(
                v.parse().map_err(|_| ConfigError::InvalidDuration("AWARENESS_TIMEOUT_MS"))?,
            );
        }
        if let Ok(v) = env::var("MAX_FRAME_SIZE_BYTES") {
            engine.max_frame_size = v.parse().map_err(|_| ConfigError::InvalidDuration("MAX_FRAME_SIZE_BYTES"))?;
        }
        if let Ok(v) = env::var("CLUSTER_PREFIX") {
            engine.cluster_prefix = v;
        }
        if let Ok(v) = env::var("INSTANCE_ID") {
            engine.instance_id = v;
        }

        Ok(Config {
            host,
            port,
            storage_dir,
            cors_origins,
            engine,
        })
    }

    /// The address to bind the HTTP listener to.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidDuration(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "invalid PORT environment variable"),
            ConfigError::InvalidDuration(name) => write!(f, "invalid {name} environment variable"),
        }
    }
}

impl std::error::Error for ConfigError {}
