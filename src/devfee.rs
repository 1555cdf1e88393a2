use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::address::Address;
use crate::receipts::{ReceiptEntry, ReceiptsStore};

const POOL_SIZE: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevFeeAddress {
    pub dev_address: String,
    pub dev_address_index: i64,
    pub registered: bool,
}

/// Persisted dev-fee state. Survives restarts via an
/// atomically-overwritten cache file; `client_id` is generated once and
/// then held stable across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DevFeeState {
    pub address_pool: Vec<DevFeeAddress>,
    pub pool_fetched_at: Option<DateTime<Utc>>,
    pub current_challenge_id: Option<String>,
    pub solutions_this_challenge: u32,
    pub total_dev_fee_solutions: u64,
    pub enabled: bool,
    pub client_id: Uuid,
    pub ratio: u32,
}

impl Default for DevFeeState {
    fn default() -> Self {
        Self {
            address_pool: Vec::new(),
            pool_fetched_at: None,
            current_challenge_id: None,
            solutions_this_challenge: 0,
            total_dev_fee_solutions: 0,
            enabled: false,
            client_id: Uuid::new_v4(),
            ratio: 17,
        }
    }
}

#[derive(Debug, Serialize)]
struct PoolRequest<'a> {
    #[serde(rename = "clientId")]
    client_id: &'a str,
    #[serde(rename = "clientType")]
    client_type: &'a str,
}

#[derive(Debug, Deserialize)]
struct PoolResponse {
    addresses: Vec<DevFeeAddressWire>,
}

#[derive(Debug, Deserialize)]
struct DevFeeAddressWire {
    #[serde(rename = "devAddress")]
    dev_address: String,
    #[serde(rename = "devAddressIndex")]
    dev_address_index: i64,
    registered: bool,
}

#[derive(Debug, Clone)]
pub struct DevFeeConfig {
    pub endpoint: String,
    pub cache_path: PathBuf,
    pub allowed_prefixes: Vec<String>,
    pub request_timeout: Duration,
    /// Configured cadence override. `None` leaves the persisted
    /// `DevFeeState::ratio` (or its default of 17) untouched; `Some` is
    /// written into the cache on every startup so the config file stays
    /// authoritative across restarts.
    pub ratio: Option<u32>,
}

/// Rotates a minority of solutions toward a pool of developer-fee addresses
/// at a fixed statistical cadence.
pub struct DevFeeRotator {
    client: Client,
    config: DevFeeConfig,
    state: Mutex<DevFeeState>,
    mining_dev_fee_now: AtomicBool,
}

impl DevFeeRotator {
    pub fn new(config: DevFeeConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        let mut state = load_cache(&config.cache_path).unwrap_or_default();
        if let Some(ratio) = config.ratio {
            state.ratio = ratio;
        }
        Ok(Self {
            client,
            config,
            state: Mutex::new(state),
            mining_dev_fee_now: AtomicBool::new(false),
        })
    }

    /// One HTTP request expecting exactly 10 addresses. On
    /// any failure (network, shape, or prefix validation) the rotator
    /// disables itself for the session and the pool is cleared — the
    /// "dev-fee pool atomicity" property.
    pub async fn prefetch_address_pool(&self) -> bool {
        let client_id = { self.state.lock().await.client_id.to_string() };

        let result = self
            .client
            .post(&self.config.endpoint)
            .json(&PoolRequest {
                client_id: &client_id,
                client_type: "desktop",
            })
            .send()
            .await;

        let parsed = match result {
            Ok(resp) if resp.status().is_success() => resp.json::<PoolResponse>().await.ok(),
            _ => None,
        };

        let mut state = self.state.lock().await;
        match parsed.filter(|p| p.addresses.len() == POOL_SIZE) {
            Some(payload) if payload.addresses.iter().all(|a| self.prefix_allowed(&a.dev_address)) => {
                state.address_pool = payload
                    .addresses
                    .into_iter()
                    .map(|a| DevFeeAddress {
                        dev_address: a.dev_address,
                        dev_address_index: a.dev_address_index,
                        registered: a.registered,
                    })
                    .collect();
                state.pool_fetched_at = Some(Utc::now());
                state.enabled = true;
                info!("dev-fee address pool refreshed ({} addresses)", POOL_SIZE);
            }
            _ => {
                state.address_pool.clear();
                state.enabled = false;
                let err = crate::error::MiningError::DevFeePoolInvalid;
                warn!("{}; disabling dev-fee for this session", err);
            }
        }
        let enabled = state.enabled;
        self.persist(&state);
        enabled
    }

    fn prefix_allowed(&self, address: &str) -> bool {
        if self.config.allowed_prefixes.is_empty() {
            return true;
        }
        match address.rfind('1') {
            Some(sep) => self
                .config
                .allowed_prefixes
                .iter()
                .any(|p| &address[..sep] == p),
            None => false,
        }
    }

    /// True iff enabled, the pool is valid, no dev-fee batch is already in
    /// flight, and the trailing `ratio`-sized receipt window calls for one
    /// now.
    pub async fn should_mine_dev_fee_now(&self, receipts: &ReceiptsStore) -> bool {
        if self.mining_dev_fee_now.load(Ordering::SeqCst) {
            return false;
        }
        let state = self.state.lock().await;
        if !state.enabled || state.address_pool.len() != POOL_SIZE {
            return false;
        }
        let ratio = state.ratio as usize;
        drop(state);

        let window = match receipts.recent_receipts(ratio) {
            Ok(w) => w,
            Err(e) => {
                warn!("failed to read receipts for dev-fee cadence check: {}", e);
                return false;
            }
        };
        let dev_fee_in_window = window.iter().any(|r| r.is_dev_fee);
        let user_count = window.iter().filter(|r| !r.is_dev_fee).count();
        !dev_fee_in_window && user_count >= ratio.saturating_sub(1)
    }

    pub fn mark_dev_fee_mining_started(&self) {
        self.mining_dev_fee_now.store(true, Ordering::SeqCst);
    }

    pub fn mark_dev_fee_mining_finished(&self) {
        self.mining_dev_fee_now.store(false, Ordering::SeqCst);
    }

    /// `pool[solutions_this_challenge mod 10]`; resets the per-challenge
    /// counter when `current_challenge_id` changes.
    pub async fn get_dev_fee_address(&self, current_challenge_id: &str) -> Option<Address> {
        let mut state = self.state.lock().await;
        if state.address_pool.is_empty() {
            return None;
        }
        if state.current_challenge_id.as_deref() != Some(current_challenge_id) {
            state.current_challenge_id = Some(current_challenge_id.to_string());
            state.solutions_this_challenge = 0;
        }
        let idx = state.solutions_this_challenge as usize % POOL_SIZE;
        let dev_addr = &state.address_pool[idx];
        Some(Address::dev_fee(dev_addr.dev_address.clone()))
    }

    pub async fn record_dev_fee_solution(&self) {
        let mut state = self.state.lock().await;
        state.total_dev_fee_solutions += 1;
        state.solutions_this_challenge += 1;
        self.persist(&state);
    }

    /// At startup, reconcile the cached counter against the receipts file,
    /// which is authoritative on mismatch.
    pub async fn sync_with_receipts(&self, actual_count: u64) {
        let mut state = self.state.lock().await;
        if state.total_dev_fee_solutions != actual_count {
            info!(
                "dev-fee cache out of sync with receipts ({} vs {}), syncing",
                state.total_dev_fee_solutions, actual_count
            );
            state.total_dev_fee_solutions = actual_count;
            self.persist(&state);
        }
    }

    pub async fn ratio(&self) -> u32 {
        self.state.lock().await.ratio
    }

    fn persist(&self, state: &DevFeeState) {
        if let Err(e) = write_cache_atomic(&self.config.cache_path, state) {
            warn!("failed to persist dev-fee cache: {}", e);
        }
    }
}

fn load_cache(path: &Path) -> Result<DevFeeState> {
    let content = std::fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    Ok(serde_json::from_str(&content)?)
}

fn write_cache_atomic(path: &Path, state: &DevFeeState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let tmp_path = path.with_extension("tmp");
    let serialized = serde_json::to_string_pretty(state)?;
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

pub fn count_dev_fee_receipts(receipts: &[ReceiptEntry]) -> u64 {
    receipts.iter().filter(|r| r.is_dev_fee).count() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipts::ReceiptEntry;
    use tempfile::TempDir;

    fn rotator(dir: &TempDir) -> DevFeeRotator {
        DevFeeRotator::new(DevFeeConfig {
            endpoint: "http://127.0.0.1:0/devfee".into(),
            cache_path: dir.path().join("devfee.json"),
            allowed_prefixes: vec!["mn".into()],
            request_timeout: Duration::from_secs(1),
            ratio: None,
        })
        .unwrap()
    }

    fn receipt(is_dev_fee: bool) -> ReceiptEntry {
        ReceiptEntry {
            ts: Utc::now(),
            address: "mn1user".into(),
            address_index: 0,
            challenge_id: "C1".into(),
            nonce: "0000000000000001".into(),
            hash: "deadbeef".into(),
            crypto_receipt: None,
            is_dev_fee,
        }
    }

    #[test]
    fn prefix_validation_rejects_unknown_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotator(&dir);
        assert!(r.prefix_allowed("mn1somevalidaddress"));
        assert!(!r.prefix_allowed("cosmos1somevalidaddress"));
    }

    #[tokio::test]
    async fn dev_fee_address_resets_on_challenge_change() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotator(&dir);
        {
            let mut state = r.state.lock().await;
            state.address_pool = (0..10)
                .map(|i| DevFeeAddress {
                    dev_address: format!("mn1dev{}", i),
                    dev_address_index: i,
                    registered: true,
                })
                .collect();
            state.enabled = true;
        }

        let a0 = r.get_dev_fee_address("C1").await.unwrap();
        assert_eq!(a0.bech32, "mn1dev0");
        r.record_dev_fee_solution().await;
        let a1 = r.get_dev_fee_address("C1").await.unwrap();
        assert_eq!(a1.bech32, "mn1dev1");

        // New challenge resets the per-challenge counter back to slot 0.
        let a2 = r.get_dev_fee_address("C2").await.unwrap();
        assert_eq!(a2.bech32, "mn1dev0");
    }

    #[tokio::test]
    async fn should_mine_dev_fee_requires_full_ratio_window_without_dev_fee() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotator(&dir);
        let receipts = ReceiptsStore::new(dir.path().join("r.jsonl"), dir.path().join("e.jsonl"));
        {
            let mut state = r.state.lock().await;
            state.ratio = 4;
            state.enabled = true;
            state.address_pool = (0..10)
                .map(|i| DevFeeAddress {
                    dev_address: format!("mn1dev{}", i),
                    dev_address_index: i,
                    registered: true,
                })
                .collect();
        }

        assert!(!r.should_mine_dev_fee_now(&receipts).await);

        for _ in 0..3 {
            receipts.append_receipt(&receipt(false)).unwrap();
        }
        assert!(r.should_mine_dev_fee_now(&receipts).await);

        receipts.append_receipt(&receipt(true)).unwrap();
        assert!(!r.should_mine_dev_fee_now(&receipts).await);
    }

    #[tokio::test]
    async fn disabled_rotator_never_mines_dev_fee() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotator(&dir);
        let receipts = ReceiptsStore::new(dir.path().join("r.jsonl"), dir.path().join("e.jsonl"));
        assert!(!r.should_mine_dev_fee_now(&receipts).await);
    }

    #[tokio::test]
    async fn sync_with_receipts_overwrites_on_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let r = rotator(&dir);
        {
            let mut state = r.state.lock().await;
            state.total_dev_fee_solutions = 5;
        }
        r.sync_with_receipts(3).await;
        assert_eq!(r.state.lock().await.total_dev_fee_solutions, 3);
    }

    #[tokio::test]
    async fn configured_ratio_overrides_persisted_default() {
        let dir = tempfile::tempdir().unwrap();
        let r = DevFeeRotator::new(DevFeeConfig {
            endpoint: "http://127.0.0.1:0/devfee".into(),
            cache_path: dir.path().join("devfee.json"),
            allowed_prefixes: vec!["mn".into()],
            request_timeout: Duration::from_secs(1),
            ratio: Some(42),
        })
        .unwrap();
        assert_eq!(r.ratio().await, 42);
    }
}
