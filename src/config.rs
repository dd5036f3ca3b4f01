use serde::Deserialize;
use std::fs;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;

use crate::retry::RetryPolicy;

pub const ENV_PREFIX: &str = "SSCONTROL_";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file at {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse TOML from config file at {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to load config from environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Credentials for the name.com DNS API.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DnsProviderConfig {
    pub zone: String,
    pub user: String,
    pub token: String,
    #[serde(default = "default_dns_api_url")]
    pub api_url: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    pub port_begin: u16,
    pub port_end: u16,
    pub timeout_remote: f64,
    pub timeout_local: f64,
    pub cache_timeout: u64,
    pub retry_attempts: u32,
    pub retry_delay: f64,
    pub reset_pause: f64,
    pub reset_lock_timeout: u64,
    pub heartbeat_interval: u64,
    pub statistic_interval: u64,
    pub reset_interval: Option<u64>,
    pub rotate_dns_wait: u64,
    pub rotate_capture_wait: u64,
    pub ssserver_bin: String,
    pub log_dir: String,
    pub inventory: Option<String>,
    pub dns: Option<DnsProviderConfig>,
}

// Partial config for layering
#[derive(Deserialize, Default, Debug)]
struct PartialServiceConfig {
    port_begin: Option<u16>,
    port_end: Option<u16>,
    timeout_remote: Option<f64>,
    timeout_local: Option<f64>,
    cache_timeout: Option<u64>,
    retry_attempts: Option<u32>,
    retry_delay: Option<f64>,
    reset_pause: Option<f64>,
    reset_lock_timeout: Option<u64>,
    heartbeat_interval: Option<u64>,
    statistic_interval: Option<u64>,
    reset_interval: Option<u64>,
    rotate_dns_wait: Option<u64>,
    rotate_capture_wait: Option<u64>,
    ssserver_bin: Option<String>,
    log_dir: Option<String>,
    inventory: Option<String>,
    dns: Option<DnsProviderConfig>,
}

fn default_dns_api_url() -> String {
    "https://api.name.com/v4".to_string()
}

fn default_ssserver_bin() -> String {
    "ssserver".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port_begin: 8381,
            port_end: 8480,
            timeout_remote: 3.0,
            timeout_local: 0.5,
            cache_timeout: 300,
            retry_attempts: 2,
            retry_delay: 1.0,
            reset_pause: 1.0,
            reset_lock_timeout: 300,
            heartbeat_interval: 60,
            statistic_interval: 600,
            reset_interval: None,
            rotate_dns_wait: 300,
            rotate_capture_wait: 60,
            ssserver_bin: default_ssserver_bin(),
            log_dir: default_log_dir(),
            inventory: None,
            dns: None,
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

/// Loopback, private and link-local addresses get the short timeout.
pub fn is_local_address(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback() ||
                // Link-local (fe80::/10)
                (segments[0] & 0xffc0 == 0xfe80) ||
                // Unique Local Addresses (fc00::/7)
                (segments[0] & 0xfe00 == 0xfc00)
        }
    }
}

impl ServiceConfig {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::load_with_env(config_path, std::env::vars())
    }

    fn load_with_env<I>(config_path: Option<&str>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        // 1. Load from file (optional)
        let file_config = match config_path.map(Path::new) {
            Some(path) if path.exists() => {
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            _ => PartialServiceConfig::default(),
        };

        // 2. Load from environment variables
        let env_config: PartialServiceConfig =
            envy::prefixed(ENV_PREFIX).from_iter(vars.into_iter())?;

        // 3. Merge: environment overrides file
        let config = Self::merge(file_config, env_config);
        config.validate()?;
        Ok(config)
    }

    fn merge(file: PartialServiceConfig, env: PartialServiceConfig) -> Self {
        let d = Self::default();
        Self {
            port_begin: env.port_begin.or(file.port_begin).unwrap_or(d.port_begin),
            port_end: env.port_end.or(file.port_end).unwrap_or(d.port_end),
            timeout_remote: env.timeout_remote.or(file.timeout_remote).unwrap_or(d.timeout_remote),
            timeout_local: env.timeout_local.or(file.timeout_local).unwrap_or(d.timeout_local),
            cache_timeout: env.cache_timeout.or(file.cache_timeout).unwrap_or(d.cache_timeout),
            retry_attempts: env.retry_attempts.or(file.retry_attempts).unwrap_or(d.retry_attempts),
            retry_delay: env.retry_delay.or(file.retry_delay).unwrap_or(d.retry_delay),
            reset_pause: env.reset_pause.or(file.reset_pause).unwrap_or(d.reset_pause),
            reset_lock_timeout: env
                .reset_lock_timeout
                .or(file.reset_lock_timeout)
                .unwrap_or(d.reset_lock_timeout),
            heartbeat_interval: env
                .heartbeat_interval
                .or(file.heartbeat_interval)
                .unwrap_or(d.heartbeat_interval),
            statistic_interval: env
                .statistic_interval
                .or(file.statistic_interval)
                .unwrap_or(d.statistic_interval),
            reset_interval: env.reset_interval.or(file.reset_interval),
            rotate_dns_wait: env.rotate_dns_wait.or(file.rotate_dns_wait).unwrap_or(d.rotate_dns_wait),
            rotate_capture_wait: env
                .rotate_capture_wait
                .or(file.rotate_capture_wait)
                .unwrap_or(d.rotate_capture_wait),
            ssserver_bin: env.ssserver_bin.or(file.ssserver_bin).unwrap_or(d.ssserver_bin),
            log_dir: env.log_dir.or(file.log_dir).unwrap_or(d.log_dir),
            inventory: env.inventory.or(file.inventory),
            dns: env.dns.or(file.dns),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port_begin > self.port_end {
            return Err(ConfigError::Invalid(format!(
                "port_begin {} is greater than port_end {}",
                self.port_begin, self.port_end
            )));
        }
        if !(1..=5).contains(&self.retry_attempts) {
            return Err(ConfigError::Invalid(format!(
                "retry_attempts must be within 1..=5, got {}",
                self.retry_attempts
            )));
        }
        for (name, value) in [
            ("timeout_remote", self.timeout_remote),
            ("timeout_local", self.timeout_local),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must be positive, got {value}")));
            }
        }
        for (name, value) in [("retry_delay", self.retry_delay), ("reset_pause", self.reset_pause)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid(format!("{name} must not be negative, got {value}")));
            }
        }
        if self.heartbeat_interval == 0 || self.statistic_interval == 0 || self.reset_interval == Some(0) {
            return Err(ConfigError::Invalid("job intervals must be positive".to_string()));
        }
        Ok(())
    }

    pub fn port_range(&self) -> RangeInclusive<u16> {
        self.port_begin..=self.port_end
    }

    /// Timeout for one control call to `ip`.
    pub fn timeout_for(&self, ip: IpAddr) -> Duration {
        if is_local_address(ip) {
            secs(self.timeout_local)
        } else {
            secs(self.timeout_remote)
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_timeout)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, secs(self.retry_delay))
    }

    pub fn reset_pause(&self) -> Duration {
        secs(self.reset_pause)
    }

    pub fn reset_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_lock_timeout)
    }
}

/// Shared view of the loaded configuration.
///
/// Readers take a cheap snapshot with [`ConfigHandle::get`]. The snapshot is
/// only replaced by an explicit [`ConfigHandle::reload`].
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    source: Option<PathBuf>,
    current: Arc<RwLock<Arc<ServiceConfig>>>,
}

impl ConfigHandle {
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let config = ServiceConfig::load(config_path)?;
        Ok(Self {
            source: config_path.map(PathBuf::from),
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// A handle that never re-reads anything.
    pub fn fixed(config: ServiceConfig) -> Self {
        Self {
            source: None,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn get(&self) -> Arc<ServiceConfig> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reload(&self) -> Result<Arc<ServiceConfig>, ConfigError> {
        let fresh = Arc::new(ServiceConfig::load(
            self.source.as_deref().and_then(Path::to_str),
        )?);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        Ok(fresh)
    }

    #[cfg(test)]
    pub(crate) fn replace(&self, config: ServiceConfig) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(config);
    }
}
