use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

fn default_namespace() -> String {
    "chomp".to_string()
}

fn default_max_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get() * 2)
        .unwrap_or(8)
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_cooldown() -> Duration {
    Duration::from_secs(2)
}

/// Core runtime knobs, shared by every component through the context.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct CoreSettings {
    /// Cache key namespace; one per configuration file.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Cluster-unique identifier of this process; claims carry it.
    #[serde(default)]
    pub instance_id: String,
    /// Upper bound on concurrently executing tick tasks.
    #[serde(default = "default_max_jobs")]
    pub max_jobs: usize,
    /// Per-tick retry budget for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cooldown between retries; jitter is added on top.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown: Duration,
    /// Long-running chain subscription mode for event loggers.
    #[serde(default)]
    pub perpetual_indexing: bool,
    /// Emit monitor rows for every ingester of this process.
    #[serde(default)]
    pub monitored: bool,
    /// JSON-RPC endpoints per chain id, tried round-robin.
    #[serde(default)]
    pub rpc_urls: BTreeMap<u64, Vec<String>>,
}

impl Default for CoreSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            instance_id: format!("chomp-{}", std::process::id()),
            max_jobs: default_max_jobs(),
            max_retries: default_max_retries(),
            retry_cooldown: default_retry_cooldown(),
            perpetual_indexing: false,
            monitored: false,
            rpc_urls: BTreeMap::new(),
        }
    }
}

impl CoreSettings {
    pub fn endpoints(&self, chain_id: u64) -> &[String] {
        self.rpc_urls
            .get(&chain_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_apply_on_empty_document() {
        let settings: CoreSettings = serde_yaml::from_str("{}").unwrap();
        assert_eq!(settings.namespace, "chomp");
        assert_eq!(settings.max_retries, 5);
        assert_eq!(settings.retry_cooldown, Duration::from_secs(2));
        assert!(!settings.perpetual_indexing);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = serde_yaml::from_str::<CoreSettings>("max_job: 3");
        assert!(err.is_err());
    }
}
