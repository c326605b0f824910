//! Configuration schema and loader for the kvproxy request processor.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Largest supported `cluster.num_zones`. Sub-request tags reserve one
/// byte for the replica slot.
pub const MAX_NUM_ZONES: usize = 256;

/// Top-level proxy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Replica topology and quorum.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Request processor settings.
    #[serde(default)]
    pub req_proc: ReqProcConfig,

    /// Request limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Payload encryption switches.
    #[serde(default)]
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Number of zones, one replica per zone (N).
    #[serde(default = "default_num_zones")]
    pub num_zones: usize,

    /// Required successful writes (W). Defaults to a majority of zones.
    #[serde(default)]
    pub num_writes: Option<usize>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            num_zones: default_num_zones(),
            num_writes: None,
        }
    }
}

impl ClusterConfig {
    /// W, falling back to `(num_zones + 1) / 2`.
    pub fn num_writes(&self) -> usize {
        self.num_writes.unwrap_or((self.num_zones + 1) / 2)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqProcConfig {
    /// Per storage-server request timeout in milliseconds.
    #[serde(default = "default_ss_request_timeout_ms")]
    pub ss_request_timeout_ms: u64,

    /// Idle processors kept per operation.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Maximum concurrently active processors per operation. Zero means
    /// unbounded.
    #[serde(default = "default_max_processors")]
    pub max_processors: usize,

    /// Run Destroy as prepare/commit instead of a direct delete.
    #[serde(default = "default_true")]
    pub two_phase_destroy: bool,
}

impl Default for ReqProcConfig {
    fn default() -> Self {
        Self {
            ss_request_timeout_ms: default_ss_request_timeout_ms(),
            pool_size: default_pool_size(),
            max_processors: default_max_processors(),
            two_phase_destroy: true,
        }
    }
}

/// Limits applied to client requests. A zero limit means unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_key_length")]
    pub max_key_length: usize,

    #[serde(default = "default_max_namespace_length")]
    pub max_namespace_length: usize,

    #[serde(default = "default_max_payload_length")]
    pub max_payload_length: usize,

    /// Maximum TTL in seconds.
    #[serde(default = "default_max_ttl")]
    pub max_ttl: u32,

    /// TTL in seconds applied to new records that do not carry one.
    #[serde(default = "default_default_ttl")]
    pub default_ttl: u32,

    /// Versions above this wrap around.
    #[serde(default = "default_max_record_version")]
    pub max_record_version: u32,

    /// Per-namespace overrides.
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceLimits>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_key_length: default_max_key_length(),
            max_namespace_length: default_max_namespace_length(),
            max_payload_length: default_max_payload_length(),
            max_ttl: default_max_ttl(),
            default_ttl: default_default_ttl(),
            max_record_version: default_max_record_version(),
            namespaces: HashMap::new(),
        }
    }
}

/// Namespace-specific overrides; unset fields fall back to the global limit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceLimits {
    #[serde(default)]
    pub max_key_length: Option<usize>,
    #[serde(default)]
    pub max_payload_length: Option<usize>,
    #[serde(default)]
    pub max_ttl: Option<u32>,
}

/// Effective limits for one namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_key_length: usize,
    pub max_payload_length: usize,
    pub max_ttl: u32,
}

impl LimitsConfig {
    /// Resolve the limits that apply to `namespace`.
    pub fn for_namespace(&self, namespace: &str) -> Limits {
        let mut limits = Limits {
            max_key_length: self.max_key_length,
            max_payload_length: self.max_payload_length,
            max_ttl: self.max_ttl,
        };
        if let Some(ns) = self.namespaces.get(namespace) {
            if let Some(v) = ns.max_key_length {
                limits.max_key_length = v;
            }
            if let Some(v) = ns.max_payload_length {
                limits.max_payload_length = v;
            }
            if let Some(v) = ns.max_ttl {
                limits.max_ttl = v;
            }
        }
        limits
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    /// Encrypt client payloads before they reach storage.
    #[serde(default)]
    pub payload: bool,

    /// Encrypt payloads handed to the replicator.
    #[serde(default)]
    pub replication: bool,
}

// --- Defaults ---

fn default_num_zones() -> usize {
    3
}
fn default_ss_request_timeout_ms() -> u64 {
    100
}
fn default_pool_size() -> usize {
    5000
}
fn default_max_processors() -> usize {
    20_000
}
fn default_true() -> bool {
    true
}
fn default_max_key_length() -> usize {
    128
}
fn default_max_namespace_length() -> usize {
    64
}
fn default_max_payload_length() -> usize {
    200 * 1024
}
fn default_max_ttl() -> u32 {
    3 * 24 * 3600
}
fn default_default_ttl() -> u32 {
    3600
}
fn default_max_record_version() -> u32 {
    u32::MAX
}

// --- Loading ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl ProxyConfig {
    /// Validate that configuration values are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.cluster.num_zones;
        let w = self.cluster.num_writes();
        if n == 0 {
            return Err(ConfigError::Invalid(
                "cluster.num_zones must be > 0".into(),
            ));
        }
        if n > MAX_NUM_ZONES {
            return Err(ConfigError::Invalid(format!(
                "cluster.num_zones ({}) must be <= {}",
                n, MAX_NUM_ZONES
            )));
        }
        if w == 0 {
            return Err(ConfigError::Invalid(
                "cluster.num_writes must be > 0".into(),
            ));
        }
        if w > n {
            return Err(ConfigError::Invalid(format!(
                "cluster.num_writes ({}) must be <= cluster.num_zones ({})",
                w, n
            )));
        }
        if self.req_proc.ss_request_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "req_proc.ss_request_timeout_ms must be > 0".into(),
            ));
        }
        if self.limits.max_namespace_length == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_namespace_length must be > 0".into(),
            ));
        }
        if self.limits.max_record_version == 0 {
            return Err(ConfigError::Invalid(
                "limits.max_record_version must be > 0".into(),
            ));
        }
        if self.limits.max_ttl != 0 && self.limits.default_ttl > self.limits.max_ttl {
            return Err(ConfigError::Invalid(format!(
                "limits.default_ttl ({}) must be <= limits.max_ttl ({})",
                self.limits.default_ttl, self.limits.max_ttl
            )));
        }
        Ok(())
    }
}

/// Load a `ProxyConfig` from a YAML file path.
pub fn load_from_file(path: &std::path::Path) -> Result<ProxyConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `ProxyConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<ProxyConfig, ConfigError> {
    let config: ProxyConfig = serde_yaml::from_str(yaml)?;
    config.validate()?;
    Ok(config)
}
