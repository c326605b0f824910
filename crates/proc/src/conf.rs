//! Immutable processor configuration, derived once from [`ProxyConfig`].

use kvproxy_config::{LimitsConfig, ProxyConfig};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProcConfig {
    /// N: replicas per key, one per zone.
    pub num_zones: usize,
    /// W: successes required for a quorum.
    pub num_writes: usize,
    pub ss_request_timeout: Duration,
    pub two_phase_destroy: bool,
    pub pool_size: usize,
    pub max_processors: usize,
    pub limits: LimitsConfig,
    pub payload_encryption: bool,
    pub replication_encryption: bool,
}

impl ProcConfig {
    pub fn from_proxy_config(config: &ProxyConfig) -> Self {
        Self {
            num_zones: config.cluster.num_zones,
            num_writes: config.cluster.num_writes(),
            ss_request_timeout: Duration::from_millis(config.req_proc.ss_request_timeout_ms),
            two_phase_destroy: config.req_proc.two_phase_destroy,
            pool_size: config.req_proc.pool_size,
            max_processors: config.req_proc.max_processors,
            limits: config.limits.clone(),
            payload_encryption: config.encryption.payload,
            replication_encryption: config.encryption.replication,
        }
    }

    /// `N - W`: failures tolerated before a quorum becomes unreachable.
    pub fn max_failures(&self) -> usize {
        self.num_zones.saturating_sub(self.num_writes)
    }

    pub fn default_ttl(&self) -> u32 {
        self.limits.default_ttl
    }

    pub fn max_record_version(&self) -> u32 {
        self.limits.max_record_version
    }
}

impl Default for ProcConfig {
    fn default() -> Self {
        Self::from_proxy_config(&ProxyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
cluster:
  num_zones: 5
req_proc:
  ss_request_timeout_ms: 250
  two_phase_destroy: false
"#;
        let config = ProcConfig::from_proxy_config(&kvproxy_config::load_from_str(yaml).unwrap());
        assert_eq!(config.num_zones, 5);
        assert_eq!(config.num_writes, 3);
        assert_eq!(config.max_failures(), 2);
        assert_eq!(config.ss_request_timeout, Duration::from_millis(250));
        assert!(!config.two_phase_destroy);
    }

    #[test]
    fn test_defaults() {
        let config = ProcConfig::default();
        assert_eq!(config.num_zones, 3);
        assert_eq!(config.num_writes, 2);
        assert_eq!(config.max_failures(), 1);
        assert_eq!(config.default_ttl(), 3600);
        assert_eq!(config.max_record_version(), u32::MAX);
    }
}
