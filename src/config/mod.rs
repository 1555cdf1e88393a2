use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::orchestrator::groups::WorkerGroupingMode;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub mining: MiningConfig,
    pub dev_fee: DevFeeSectionConfig,
    pub paths: PathsConfig,
    pub hash_engine: HashEngineSectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub base_url: String,
    pub dev_fee_endpoint: String,
    #[serde(with = "humantime_secs")]
    pub request_timeout_secs: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    pub worker_threads: u32,
    pub batch_size: usize,
    pub worker_grouping_mode: WorkerGroupingMode,
    pub workers_per_address: u32,
    pub max_submission_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevFeeSectionConfig {
    pub enabled: bool,
    pub ratio: u32,
    pub endpoint: String,
    pub allowed_prefixes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub receipts_file: PathBuf,
    pub errors_file: PathBuf,
    pub dev_fee_cache_file: PathBuf,
    pub state_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashEngineSectionConfig {
    pub endpoint: String,
    #[serde(with = "humantime_secs")]
    pub rom_init_timeout_secs: Duration,
}

mod humantime_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for Config {
    fn default() -> Self {
        let state_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("scavenger-miner");

        Self {
            service: ServiceConfig {
                base_url: "https://scavenger.prod.gd.midnighttge.io".to_string(),
                dev_fee_endpoint: "https://devfee.prod.gd.midnighttge.io/pool".to_string(),
                request_timeout_secs: Duration::from_secs(30),
            },
            mining: MiningConfig {
                worker_threads: num_cpus::get() as u32,
                batch_size: 300,
                worker_grouping_mode: WorkerGroupingMode::Auto,
                workers_per_address: 2,
                max_submission_failures: 1,
            },
            dev_fee: DevFeeSectionConfig {
                enabled: true,
                ratio: 17,
                endpoint: "https://devfee.prod.gd.midnighttge.io/pool".to_string(),
                allowed_prefixes: vec!["mn".to_string()],
            },
            paths: PathsConfig {
                receipts_file: state_dir.join("receipts.jsonl"),
                errors_file: state_dir.join("errors.jsonl"),
                dev_fee_cache_file: state_dir.join("devfee.json"),
                state_dir,
            },
            hash_engine: HashEngineSectionConfig {
                endpoint: "http://127.0.0.1:9090".to_string(),
                rom_init_timeout_secs: Duration::from_secs(60),
            },
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.mining.batch_size, config.mining.batch_size);
        assert_eq!(deserialized.dev_fee.ratio, config.dev_fee.ratio);
    }

    #[test]
    fn default_mining_config_matches_spec_defaults() {
        let config = Config::default();
        assert_eq!(config.mining.batch_size, 300);
        assert_eq!(config.mining.max_submission_failures, 1);
        assert_eq!(config.dev_fee.ratio, 17);
    }
}
