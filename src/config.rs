use serde::Deserialize;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_route_probe_target")]
    pub route_probe_target: String,
    #[serde(default)]
    pub optional_probe_failure: FailurePolicy,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub log_tail: LogTailConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Annotate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_service_timeout")]
    pub timeout: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTailMode {
    #[default]
    Read,
    Placeholder,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LogTailConfig {
    #[serde(default)]
    pub mode: LogTailMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            route_probe_target: default_route_probe_target(),
            optional_probe_failure: FailurePolicy::default(),
            service: ServiceConfig::default(),
            log_tail: LogTailConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            timeout: default_service_timeout(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse YAML in {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("invalid configuration: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.route_probe_addr()?;
        self.service_timeout()?;
        Ok(())
    }

    pub fn route_probe_addr(&self) -> Result<SocketAddr, ConfigError> {
        let target = self.route_probe_target.trim();
        if target.is_empty() {
            return Err(ConfigError::Validation(
                "route_probe_target is required".to_string(),
            ));
        }
        SocketAddr::from_str(target).map_err(|_| {
            ConfigError::Validation(format!(
                "route_probe_target '{target}' must be an ip:port address"
            ))
        })
    }

    pub fn service_timeout(&self) -> Result<Duration, ConfigError> {
        let timeout = humantime::parse_duration(self.service.timeout.trim()).map_err(|err| {
            ConfigError::Validation(format!(
                "service.timeout '{}' is not a duration: {err}",
                self.service.timeout
            ))
        })?;
        if timeout.is_zero() {
            return Err(ConfigError::Validation(
                "service.timeout must be > 0".to_string(),
            ));
        }
        Ok(timeout)
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn default_route_probe_target() -> String {
    "8.8.8.8:80".to_string()
}

fn default_service_timeout() -> String {
    "30s".to_string()
}
