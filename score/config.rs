use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default location of the scoring artifact, relative to the working directory.
pub const DEFAULT_MODEL_PATH: &str = "models/diabetes_risk.toml";
pub const DEFAULT_PORT: u16 = 8000;

/// Settings for the HTTP service. Every field may come from a TOML file; command-line
/// flags take precedence over the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServeConfig {
    pub model_path: PathBuf,
    pub host: IpAddr,
    pub port: u16,
    /// Upper bound on records per batch request. `None` leaves batches unbounded.
    pub max_batch_size: Option<usize>,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PORT,
            max_batch_size: None,
        }
    }
}

/// Values supplied on the command line. `None` means "keep the file or default value".
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub model_path: Option<PathBuf>,
    pub host: Option<IpAddr>,
    pub port: Option<u16>,
    pub max_batch_size: Option<usize>,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML config file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ServeConfig {
    /// Reads a config file. Missing keys fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the effective configuration: defaults, then the optional file, then flags.
    pub fn resolve(
        file: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut config = match file {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Some(model_path) = overrides.model_path {
            config.model_path = model_path;
        }
        if let Some(host) = overrides.host {
            config.host = host;
        }
        if let Some(port) = overrides.port {
            config.port = port;
        }
        if let Some(max) = overrides.max_batch_size {
            config.max_batch_size = Some(max);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if self.max_batch_size == Some(0) {
            return Err(ConfigError::Invalid(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}
