use std::collections::BTreeMap;
use std::time::Duration;

use chomp_logic::CoreSettings;
use serde::Deserialize;

fn default_configs() -> String {
    "ingesters.yml".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_tsdb_adapter() -> String {
    "memory".to_string()
}

fn default_cache_ns() -> String {
    "chomp".to_string()
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_cooldown() -> u64 {
    2
}

/// Process settings, read from the environment (`INGESTER_CONFIGS`,
/// `MAX_JOBS`, `REDIS_URL`, ... plus `HTTP_RPCS_<chain_id>` endpoint
/// lists).
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Comma-separated configuration paths; one namespace per instance.
    #[serde(default = "default_configs")]
    pub ingester_configs: String,
    #[serde(default)]
    pub max_jobs: Option<usize>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds between retries of a failed tick.
    #[serde(default = "default_retry_cooldown")]
    pub retry_cooldown: u64,
    #[serde(default)]
    pub perpetual_indexing: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_tsdb_adapter")]
    pub tsdb_adapter: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default = "default_cache_ns")]
    pub cache_ns: String,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub monitored: bool,
}

impl Settings {
    pub fn build() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::default())
            .build()?
            .try_deserialize::<Settings>()?;
        Ok(settings)
    }

    pub fn config_paths(&self) -> Vec<String> {
        self.ingester_configs
            .split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect()
    }

    pub fn core(&self) -> CoreSettings {
        let mut core = CoreSettings {
            namespace: self.cache_ns.clone(),
            max_retries: self.max_retries,
            retry_cooldown: Duration::from_secs(self.retry_cooldown),
            perpetual_indexing: self.perpetual_indexing,
            monitored: self.monitored,
            rpc_urls: rpc_urls_from_env(),
            ..CoreSettings::default()
        };
        if let Some(max_jobs) = self.max_jobs {
            core.max_jobs = max_jobs;
        }
        if let Some(instance_id) = &self.instance_id {
            core.instance_id = instance_id.clone();
        }
        core
    }
}

/// `HTTP_RPCS_<chain_id>` holds a comma-separated endpoint list per chain.
fn rpc_urls_from_env() -> BTreeMap<u64, Vec<String>> {
    std::env::vars()
        .filter_map(|(key, value)| {
            let chain_id: u64 = key.strip_prefix("HTTP_RPCS_")?.parse().ok()?;
            let urls: Vec<String> = value
                .split(',')
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect();
            (!urls.is_empty()).then_some((chain_id, urls))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_paths_split_and_trim() {
        let settings = Settings {
            ingester_configs: "a.yml, b.yml ,".to_string(),
            max_jobs: None,
            max_retries: 5,
            retry_cooldown: 2,
            perpetual_indexing: false,
            verbose: false,
            tsdb_adapter: "memory".to_string(),
            redis_url: default_redis_url(),
            db_url: None,
            cache_ns: "chomp".to_string(),
            instance_id: None,
            monitored: false,
        };
        assert_eq!(settings.config_paths(), vec!["a.yml", "b.yml"]);
        let core = settings.core();
        assert_eq!(core.namespace, "chomp");
        assert_eq!(core.retry_cooldown, Duration::from_secs(2));
    }
}
