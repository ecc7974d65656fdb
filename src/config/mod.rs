use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_ENV: &str = "LIVEWORLD_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "liveworld.toml";

/// Complete LiveWorld configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LiveWorldConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// Listener and static file configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Directory served under /static
    #[serde(default = "default_static_dir")]
    pub static_dir: PathBuf,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_static_dir() -> PathBuf {
    PathBuf::from("static")
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            static_dir: default_static_dir(),
        }
    }
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Maximum accepted request body for entity writes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_max_body_bytes() -> usize {
    1_048_576 // 1 MB
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl LiveWorldConfig {
    /// Load from `$LIVEWORLD_CONFIG` (or `liveworld.toml`), then apply env overrides.
    ///
    /// A missing file is not an error; defaults are used.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = if Path::new(&path).exists() {
            info!(path = %path, "Loading configuration file");
            load_config(&path)?
        } else {
            Self::default()
        };

        config.apply_env();
        Ok(config)
    }

    /// Override fields from env vars; unparsable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("LIVEWORLD_BIND_ADDR") {
            self.server.bind_addr = v;
        }
        if let Ok(v) = std::env::var("LIVEWORLD_STATIC_DIR") {
            self.server.static_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("LIVEWORLD_MAX_BODY_BYTES") {
            if let Ok(n) = v.parse::<usize>() {
                self.api.max_body_bytes = n;
            }
        }
    }
}

/// Load configuration from TOML file
pub fn load_config(path: impl AsRef<Path>) -> Result<LiveWorldConfig> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    let config: LiveWorldConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file {}", path.display()))?;
    Ok(config)
}
