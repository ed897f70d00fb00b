//! Configuration file support for extnetd
//!
//! Loads and validates the control-plane configuration from TOML files.
//! Default location: /etc/extnet/extnetd.toml

use crate::error::{OrchError, OrchResult};
use crate::types::ApplianceKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/extnet/extnetd.toml";

/// Dotted configuration keys, as named in `Misconfiguration` errors.
pub mod keys {
    pub const FIREWALL_DEFAULT_CAPACITY: &str = "capacity.firewall_default";
    pub const LOAD_BALANCER_DEFAULT_CAPACITY: &str = "capacity.load_balancer_default";
    pub const MAPPING_LOCK_WAIT: &str = "locks.mapping_wait_secs";
    pub const USAGE_ZONE_LOCK_WAIT: &str = "locks.usage_zone_wait_secs";
    pub const USAGE_INTERVAL: &str = "usage.interval_secs";
    pub const COMMAND_TIMEOUT: &str = "transport.command_timeout_secs";
    pub const REDIS_URL: &str = "lock_backend.redis_url";
    pub const LEASE_TTL: &str = "lock_backend.lease_ttl_secs";
}

/// Default appliance capacities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityConfig {
    /// Effective capacity of a firewall registered with capacity 0
    #[serde(default = "default_capacity")]
    pub firewall_default: u32,

    /// Effective capacity of a load balancer registered with capacity 0
    #[serde(default = "default_capacity")]
    pub load_balancer_default: u32,
}

impl CapacityConfig {
    /// Returns the configured default for `kind`, failing if it is unset.
    pub fn default_for(&self, kind: ApplianceKind) -> OrchResult<u32> {
        let (value, key) = match kind {
            ApplianceKind::Firewall => (self.firewall_default, keys::FIREWALL_DEFAULT_CAPACITY),
            ApplianceKind::LoadBalancer => (
                self.load_balancer_default,
                keys::LOAD_BALANCER_DEFAULT_CAPACITY,
            ),
        };
        if value == 0 {
            return Err(OrchError::misconfiguration(
                key,
                "default capacity is not configured",
            ));
        }
        Ok(value)
    }
}

/// Lock wait bounds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Bounded wait for the device-map mutation lock
    #[serde(default = "default_mapping_wait")]
    pub mapping_wait_secs: u64,

    /// Bounded wait for a zone's usage-collection lock
    #[serde(default = "default_usage_zone_wait")]
    pub usage_zone_wait_secs: u64,
}

/// How a zone pass deduplicates accounts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountDedup {
    /// Skip an account once it was seen behind any appliance
    PerAccount,
    /// Process every (account, appliance) pair once
    PerAccountAppliance,
}

/// Usage collection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Collection interval; 0 disables the task
    #[serde(default = "default_usage_interval")]
    pub interval_secs: u64,

    #[serde(default = "default_account_dedup")]
    pub account_dedup: AccountDedup,
}

/// Appliance transport settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Bound on each remote command round-trip
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockBackendKind {
    InProcess,
    Redis,
}

/// Lock backend selection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockBackendConfig {
    #[serde(default = "default_lock_backend")]
    pub kind: LockBackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_secs: u64,
}

/// Complete extnetd configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub capacity: CapacityConfig,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub usage: UsageConfig,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub lock_backend: LockBackendConfig,
}

// Default functions
fn default_capacity() -> u32 {
    50
}

fn default_mapping_wait() -> u64 {
    30
}

fn default_usage_zone_wait() -> u64 {
    15
}

fn default_usage_interval() -> u64 {
    300
}

fn default_account_dedup() -> AccountDedup {
    AccountDedup::PerAccountAppliance
}

fn default_command_timeout() -> u64 {
    60
}

fn default_lock_backend() -> LockBackendKind {
    LockBackendKind::InProcess
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_lease_ttl() -> u64 {
    180
}

/// Slack a redis lease must keep beyond the command timeout, since the
/// device-map lock is held across one appliance round-trip.
pub const LEASE_MARGIN_SECS: u64 = 30;

// Default implementations
impl Default for CapacityConfig {
    fn default() -> Self {
        Self {
            firewall_default: default_capacity(),
            load_balancer_default: default_capacity(),
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            mapping_wait_secs: default_mapping_wait(),
            usage_zone_wait_secs: default_usage_zone_wait(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_usage_interval(),
            account_dedup: default_account_dedup(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: default_command_timeout(),
        }
    }
}

impl Default for LockBackendConfig {
    fn default() -> Self {
        Self {
            kind: default_lock_backend(),
            redis_url: default_redis_url(),
            lease_ttl_secs: default_lease_ttl(),
        }
    }
}

impl Config {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> OrchResult<Self> {
        toml::from_str(content)
            .map_err(|e| OrchError::misconfiguration("config", format!("parse error: {}", e)))
    }

    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> OrchResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content).map_err(|e| match e {
                OrchError::Misconfiguration { key, message } => OrchError::Misconfiguration {
                    key,
                    message: format!("{}: {}", path.display(), message),
                },
                other => other,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(OrchError::misconfiguration(
                "config",
                format!("failed to read {}: {}", path.display(), e),
            )),
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> OrchResult<()> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)
            .map_err(|e| OrchError::misconfiguration("config", format!("serialize: {}", e)))?;
        fs::write(path, content).map_err(|e| {
            OrchError::misconfiguration("config", format!("write {}: {}", path.display(), e))
        })
    }

    pub fn mapping_lock_wait(&self) -> Duration {
        Duration::from_secs(self.locks.mapping_wait_secs)
    }

    pub fn usage_zone_lock_wait(&self) -> Duration {
        Duration::from_secs(self.locks.usage_zone_wait_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.transport.command_timeout_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lock_backend.lease_ttl_secs)
    }

    /// Usage collection interval, `None` when collection is disabled.
    pub fn usage_interval(&self) -> Option<Duration> {
        match self.usage.interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Validate configuration
    ///
    /// Zero capacity defaults are accepted here and rejected only when an
    /// allocation needs them.
    pub fn validate(&self) -> OrchResult<()> {
        if self.locks.mapping_wait_secs == 0 {
            return Err(OrchError::misconfiguration(
                keys::MAPPING_LOCK_WAIT,
                "must be > 0",
            ));
        }

        if self.locks.usage_zone_wait_secs == 0 {
            return Err(OrchError::misconfiguration(
                keys::USAGE_ZONE_LOCK_WAIT,
                "must be > 0",
            ));
        }

        if self.transport.command_timeout_secs == 0 {
            return Err(OrchError::misconfiguration(
                keys::COMMAND_TIMEOUT,
                "must be > 0",
            ));
        }

        if self.lock_backend.kind == LockBackendKind::Redis {
            if !self.lock_backend.redis_url.starts_with("redis://")
                && !self.lock_backend.redis_url.starts_with("rediss://")
            {
                return Err(OrchError::misconfiguration(
                    keys::REDIS_URL,
                    "must be a redis:// or rediss:// URL",
                ));
            }
            if self.lock_backend.lease_ttl_secs == 0 {
                return Err(OrchError::misconfiguration(keys::LEASE_TTL, "must be > 0"));
            }
            let floor = self.transport.command_timeout_secs + LEASE_MARGIN_SECS;
            if self.lock_backend.lease_ttl_secs < floor {
                return Err(OrchError::misconfiguration(
                    keys::LEASE_TTL,
                    format!(
                        "must be at least {} ({} + command timeout)",
                        floor, LEASE_MARGIN_SECS
                    ),
                ));
            }
        }

        Ok(())
    }
}
