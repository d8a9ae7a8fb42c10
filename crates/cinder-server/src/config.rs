//! Server configuration.
//!
//! Loaded from a YAML file whose sections mirror the deployment surface:
//! `server`, `limits`, `storage`, `ttl`, `observability`. A missing file
//! yields all defaults; a present-but-invalid file is a startup error.
//! Sections belonging to external collaborators (`persistence`,
//! `replication`) are accepted and ignored.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

/// Errors from loading or validating configuration. All of them are
/// startup-fatal: the binary logs the error and exits 1.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The validated server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub limits: LimitsSection,
    pub storage: StorageSection,
    pub ttl: TtlSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// TCP bind address. A bare `:port` binds all interfaces.
    pub listen_addr: String,
    /// Shard count, fixed at startup. Must be > 0.
    pub shards: usize,
    /// Connection password; empty disables authentication.
    pub auth_password: String,
    /// Per-connection read deadline.
    #[serde(with = "duration")]
    pub read_timeout: Duration,
    /// Per-connection write deadline.
    #[serde(with = "duration")]
    pub write_timeout: Duration,
}

impl Default for ServerSection {
    fn default() -> ServerSection {
        ServerSection {
            listen_addr: ":6380".into(),
            shards: 8,
            auth_password: String::new(),
            read_timeout: Duration::from_secs(30),
            write_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Process-wide connection cap; accepts beyond it are closed.
    pub max_clients: usize,
    /// Commands executed per read batch on one connection.
    pub max_pipeline: usize,
}

impl Default for LimitsSection {
    fn default() -> LimitsSection {
        LimitsSection {
            max_clients: 10_000,
            max_pipeline: 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageSection {
    /// Memory ceiling in bytes; 0 means unlimited. Only enforced once an
    /// eviction policy other than `noeviction` is implemented.
    pub maxmemory_bytes: u64,
    /// Eviction policy name. All Redis names validate; only `noeviction`
    /// is implemented, the rest reduce to it with a warning.
    pub eviction_policy: String,
}

impl Default for StorageSection {
    fn default() -> StorageSection {
        StorageSection {
            maxmemory_bytes: 0,
            eviction_policy: "noeviction".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtlSection {
    /// `lazy` (expiry only on access) or `lazy+active` (plus the
    /// per-shard sampling sweep).
    pub strategy: String,
    /// Active sweep period.
    #[serde(with = "duration")]
    pub active_cycle: Duration,
}

impl Default for TtlSection {
    fn default() -> TtlSection {
        TtlSection {
            strategy: "lazy+active".into(),
            active_cycle: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilitySection {
    /// Default tracing level when RUST_LOG and --debug are absent.
    pub log_level: String,
    /// Bind address for the /metrics + /health HTTP endpoint; empty
    /// disables it.
    pub prometheus_listen: String,
}

impl Default for ObservabilitySection {
    fn default() -> ObservabilitySection {
        ObservabilitySection {
            log_level: "info".into(),
            prometheus_listen: ":9100".into(),
        }
    }
}

const EVICTION_POLICIES: &[&str] = &[
    "noeviction",
    "allkeys-lru",
    "volatile-lru",
    "allkeys-lfu",
    "volatile-lfu",
];

impl Config {
    /// Loads configuration from `path`. A missing file yields defaults;
    /// unreadable, unparseable, or invalid files are errors.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let data = std::fs::read_to_string(path)?;
        Config::from_yaml(&data)
    }

    /// Parses and validates configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Config, ConfigError> {
        let config: Config = serde_yaml::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.shards == 0 {
            return Err(ConfigError::Invalid(
                "server.shards must be greater than 0".into(),
            ));
        }
        if self.limits.max_clients == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_clients must be greater than 0".into(),
            ));
        }
        if self.limits.max_pipeline == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_pipeline must be greater than 0".into(),
            ));
        }
        if !EVICTION_POLICIES.contains(&self.storage.eviction_policy.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "invalid eviction policy: {}",
                self.storage.eviction_policy
            )));
        }
        match self.ttl.strategy.as_str() {
            "lazy" | "lazy+active" => {}
            other => {
                return Err(ConfigError::Invalid(format!(
                    "invalid ttl strategy: {other}"
                )));
            }
        }
        Ok(())
    }

    /// The configured password, `None` when auth is disabled.
    pub fn auth_password(&self) -> Option<String> {
        if self.server.auth_password.is_empty() {
            None
        } else {
            Some(self.server.auth_password.clone())
        }
    }

    /// The active-expiration period, `None` for the lazy-only strategy.
    pub fn active_expiry(&self) -> Option<Duration> {
        if self.ttl.strategy == "lazy+active" {
            Some(self.ttl.active_cycle)
        } else {
            None
        }
    }

    /// Warns about valid-but-unimplemented options, once at startup.
    pub fn log_unsupported_options(&self) {
        if self.storage.eviction_policy != "noeviction" {
            warn!(
                policy = %self.storage.eviction_policy,
                "eviction policy not implemented, falling back to noeviction"
            );
        }
        if self.storage.maxmemory_bytes > 0 {
            warn!(
                maxmemory_bytes = self.storage.maxmemory_bytes,
                "maxmemory is ignored under noeviction"
            );
        }
    }
}

/// Normalizes a Go-style `:port` listen address into one `ToSocketAddrs`
/// accepts, binding all interfaces.
pub fn normalize_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_owned()
    }
}

/// Serde support for duration strings: `"50ms"`, `"30s"`, `"5m"`.
mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(input: &str) -> Result<Duration, String> {
        let input = input.trim();
        let unit_at = input
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("duration '{input}' is missing a unit (ms, s, m)"))?;
        let (digits, unit) = input.split_at(unit_at);

        let amount: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration: '{input}'"))?;

        match unit {
            "ms" => Ok(Duration::from_millis(amount)),
            "s" => Ok(Duration::from_secs(amount)),
            "m" => Ok(Duration::from_secs(amount * 60)),
            _ => Err(format!("unknown duration unit '{unit}' in '{input}'")),
        }
    }
}
