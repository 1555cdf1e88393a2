pub mod groups;
pub mod stats;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{Timelike, Utc};
use tokio::sync::{Mutex as AsyncMutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::address::{Address, WalletManager};
use crate::challenge::Challenge;
use crate::devfee::DevFeeRotator;
use crate::hashengine::HashEngineClient;
use crate::poller::{ChallengeEvent, ChallengePoller};
use crate::receipts::ReceiptsStore;
use crate::service::ScavengerClient;
use crate::state::SharedMiningState;
use crate::worker::{register_address, run_worker, WorkerContext, WorkerTuning};

use groups::{calculate_worker_groups, WorkerGroupingMode};

const REGISTRATION_INTERVAL: Duration = Duration::from_millis(1500);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(30);
const TRANSITION_QUIESCENCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Idle,
    Loading,
    RomInit,
    Mining,
    Transitioning,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub worker_threads: u32,
    pub batch_size: usize,
    pub worker_grouping_mode: WorkerGroupingMode,
    pub workers_per_address: u32,
    pub max_submission_failures: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            worker_threads: num_cpus::get() as u32,
            batch_size: 300,
            worker_grouping_mode: WorkerGroupingMode::Auto,
            workers_per_address: 2,
            max_submission_failures: 1,
        }
    }
}

/// The mining orchestrator state machine: owns every
/// collaborator as an explicit, long-lived field (no module-level
/// singletons) and drives challenge polling, worker
/// scheduling, dev-fee injection, and crash recovery.
pub struct MiningOrchestrator {
    config: OrchestratorConfig,
    wallet: Arc<WalletManager>,
    scavenger: ScavengerClient,
    hash_engine: Arc<HashEngineClient>,
    receipts: Arc<ReceiptsStore>,
    dev_fee: Option<Arc<DevFeeRotator>>,
    shared: Arc<SharedMiningState>,
    poller: ChallengePoller,
    current_challenge: Arc<RwLock<Option<Challenge>>>,
    is_mining: Arc<AtomicBool>,
    is_running: AtomicBool,
    state: std::sync::Mutex<OrchestratorState>,
    user_solutions_count: AtomicU64,
    address_cursor: AtomicUsize,
    /// Handle of the currently running `startMining` task, so a new
    /// challenge transition or watchdog restart can cancel the old round
    /// without blocking the poll loop that drives it.
    mining_task: AsyncMutex<Option<JoinHandle<()>>>,
}

impl MiningOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        wallet: Arc<WalletManager>,
        scavenger: ScavengerClient,
        hash_engine: Arc<HashEngineClient>,
        receipts: Arc<ReceiptsStore>,
        dev_fee: Option<Arc<DevFeeRotator>>,
    ) -> Self {
        let poller = ChallengePoller::new(scavenger.clone());
        Self {
            config,
            wallet,
            scavenger,
            hash_engine,
            receipts,
            dev_fee,
            shared: Arc::new(SharedMiningState::new()),
            poller,
            current_challenge: Arc::new(RwLock::new(None)),
            is_mining: Arc::new(AtomicBool::new(false)),
            is_running: AtomicBool::new(true),
            state: std::sync::Mutex::new(OrchestratorState::Idle),
            user_solutions_count: AtomicU64::new(0),
            address_cursor: AtomicUsize::new(0),
            mining_task: AsyncMutex::new(None),
        }
    }

    fn set_state(&self, new_state: OrchestratorState) {
        let mut state = self.state.lock().unwrap();
        info!("orchestrator state: {:?} -> {:?}", *state, new_state);
        *state = new_state;
    }

    pub fn stop(&self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.is_mining.store(false, Ordering::SeqCst);
    }

    /// Runs until `stop()` is called or the challenge enters `after`.
    pub async fn run(self: Arc<Self>) -> anyhow::Result<()> {
        self.set_state(OrchestratorState::Loading);
        self.recover_from_receipts().await?;
        self.register_unregistered_addresses().await;
        self.ensure_dev_fee_pool().await;
        self.log_terms_and_conditions().await;

        let watchdog_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.watchdog_loop().await })
        };
        let hourly_handle = {
            let this = self.clone();
            tokio::spawn(async move { this.hourly_reset_loop().await })
        };

        self.set_state(OrchestratorState::Idle);
        let mut interval = tokio::time::interval(crate::poller::POLL_INTERVAL);
        while self.is_running.load(Ordering::SeqCst) {
            tokio::select! {
                _ = interval.tick() => {
                    let event = self.poller.poll_once().await;
                    if !self.handle_event(event).await {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("received shutdown signal");
                    break;
                }
            }
        }

        self.stop();
        self.stop_mining_task().await;
        watchdog_handle.abort();
        hourly_handle.abort();
        Ok(())
    }

    /// Takes and aborts the in-flight `startMining` task, if any, and waits
    /// for it to actually unwind. Workers observe `is_mining` cooperatively,
    /// so callers set that false before calling this to avoid a hard abort
    /// racing ahead of a worker batch in flight.
    async fn stop_mining_task(&self) {
        let handle = { self.mining_task.lock().await.take() };
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Replaces the current mining round with a new detached task for
    /// `challenge_id`, returning immediately so the poll loop stays
    /// responsive to challenge/difficulty changes while mining runs.
    async fn spawn_mining(self: &Arc<Self>, challenge_id: String) {
        self.stop_mining_task().await;
        let this = self.clone();
        let handle = tokio::spawn(async move { this.start_mining(challenge_id).await });
        *self.mining_task.lock().await = Some(handle);
    }

    async fn handle_event(self: &Arc<Self>, event: ChallengeEvent) -> bool {
        match event {
            ChallengeEvent::NotStarted => true,
            ChallengeEvent::ShutdownRequested => {
                info!("challenge window ended, shutting down");
                false
            }
            ChallengeEvent::Unchanged => true,
            ChallengeEvent::ChallengeTransition { old, new } => {
                self.transition_to(old, new).await;
                true
            }
            ChallengeEvent::DifficultyChanged { old, new } => {
                info!(
                    "difficulty changed within challenge {}: {} -> {}",
                    new.challenge_id, old.difficulty, new.difficulty
                );
                *self.current_challenge.write().await = Some(new);
                true
            }
        }
    }

    /// Tears down the current mining round and brings the next challenge online.
    async fn transition_to(self: &Arc<Self>, old: Option<Challenge>, new: Challenge) {
        self.set_state(OrchestratorState::Transitioning);
        self.is_mining.store(false, Ordering::SeqCst);
        self.hash_engine.kill_workers().await;
        self.shared.reset_for_transition();
        tokio::time::sleep(TRANSITION_QUIESCENCE).await;

        let needs_rom_init = !self.hash_engine.is_rom_ready()
            || old.as_ref().map(|o| o.no_pre_mine != new.no_pre_mine).unwrap_or(true);
        if needs_rom_init {
            self.set_state(OrchestratorState::RomInit);
            if let Err(e) = self.hash_engine.init_rom(&new.no_pre_mine).await {
                error!("ROM init failed for challenge {}: {}", new.challenge_id, e);
                *self.current_challenge.write().await = Some(new);
                self.set_state(OrchestratorState::Idle);
                return;
            }
        }

        *self.current_challenge.write().await = Some(new.clone());
        self.poller.set_held(new.clone()).await;
        self.address_cursor.store(0, Ordering::SeqCst);

        self.spawn_mining(new.challenge_id).await;
    }

    /// `startMining()`: worker grouping, dev-fee injection, and
    /// continuous round cycling until the challenge changes or everything
    /// eligible is solved.
    async fn start_mining(&self, challenge_id: String) {
        self.set_state(OrchestratorState::Mining);
        self.is_mining.store(true, Ordering::SeqCst);

        let mut round: u64 = 0;
        while self.is_mining.load(Ordering::SeqCst) {
            let snapshot = match self.current_challenge.read().await.clone() {
                Some(c) if c.challenge_id == challenge_id => c,
                _ => break,
            };

            let eligible: Vec<Address> = self
                .wallet
                .addresses()
                .iter()
                .filter(|a| a.registered() && !self.shared.solved.contains(&a.bech32, &challenge_id))
                .cloned()
                .collect();

            if eligible.is_empty() {
                info!("all addresses solved for challenge {}, idling until next transition", challenge_id);
                self.is_mining.store(false, Ordering::SeqCst);
                break;
            }

            let dev_fee_addr = match &self.dev_fee {
                Some(dev_fee) if dev_fee.should_mine_dev_fee_now(&self.receipts).await => {
                    dev_fee.get_dev_fee_address(&challenge_id).await
                }
                _ => None,
            };

            let effective_len = eligible.len() + if dev_fee_addr.is_some() { 1 } else { 0 };
            let groups = calculate_worker_groups(
                self.config.worker_threads,
                effective_len,
                self.config.worker_grouping_mode,
                self.config.workers_per_address,
            );
            if groups.is_empty() {
                break;
            }

            let group_count = groups.len();
            info!(
                "startMining: regrouped {} workers into {} group(s) (min_workers_per_address={}, mode={:?})",
                self.config.worker_threads,
                group_count,
                groups::min_workers_per_address(
                    self.config.worker_grouping_mode,
                    self.config.worker_threads,
                    self.config.workers_per_address
                ),
                self.config.worker_grouping_mode,
            );
            let slots_for_eligible = group_count - if dev_fee_addr.is_some() { 1 } else { 0 };
            let window = self.rotate_window(&eligible, slots_for_eligible);
            let mut effective_window = Vec::with_capacity(group_count);
            if let Some(addr) = &dev_fee_addr {
                effective_window.push(addr.clone());
            }
            effective_window.extend(window);

            let dev_fee_active = dev_fee_addr.is_some();
            if dev_fee_active {
                if let Some(dev_fee) = &self.dev_fee {
                    dev_fee.mark_dev_fee_mining_started();
                }
            }

            let tuning = WorkerTuning {
                batch_size: self.config.batch_size,
                max_submission_failures: self.config.max_submission_failures,
            };
            let ctx = WorkerContext {
                shared: self.shared.clone(),
                hash_engine: self.hash_engine.clone(),
                scavenger: self.scavenger.clone(),
                receipts: self.receipts.clone(),
                dev_fee: self.dev_fee.clone(),
                wallet: self.wallet.clone(),
                current_challenge: self.current_challenge.clone(),
                is_mining: self.is_mining.clone(),
                tuning,
            };

            let total_workers = self.config.worker_threads;
            let mut handles = Vec::new();
            for group in &groups {
                let address = effective_window[group.address_index].clone();
                let is_dev_fee = address.is_dev_fee();
                for &worker_id in &group.worker_ids {
                    let ctx = ctx.clone();
                    let address = address.clone();
                    let snapshot = snapshot.clone();
                    handles.push(tokio::spawn(async move {
                        run_worker(&ctx, worker_id, total_workers, round, address, snapshot, is_dev_fee).await
                    }));
                }
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!("worker task panicked: {}", e);
                }
            }

            if dev_fee_active {
                if let Some(dev_fee) = &self.dev_fee {
                    dev_fee.mark_dev_fee_mining_finished();
                }
            }

            round += 1;
        }
    }

    fn rotate_window(&self, addresses: &[Address], n: usize) -> Vec<Address> {
        if addresses.is_empty() || n == 0 {
            return Vec::new();
        }
        let len = addresses.len();
        let start = self.address_cursor.load(Ordering::SeqCst) % len;
        let window: Vec<Address> = (0..n).map(|i| addresses[(start + i) % len].clone()).collect();
        self.address_cursor.store((start + n) % len, Ordering::SeqCst);
        window
    }

    async fn watchdog_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(WATCHDOG_INTERVAL);
        loop {
            interval.tick().await;
            if !self.is_mining.load(Ordering::SeqCst) {
                continue;
            }
            let challenge_id = match self.current_challenge.read().await.as_ref() {
                Some(c) => c.challenge_id.clone(),
                None => continue,
            };
            if stats::watchdog_detects_issue(&self.shared, &challenge_id) {
                warn!("watchdog detected an unhealthy mining round, restarting startMining");
                self.is_mining.store(false, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(1)).await;
                self.spawn_mining(challenge_id).await;
            }
        }
    }

    async fn hourly_reset_loop(self: Arc<Self>) {
        loop {
            let now = Utc::now();
            let seconds_until_next_hour = 3600 - (now.minute() as u64 * 60 + now.second() as u64);
            tokio::time::sleep(Duration::from_secs(seconds_until_next_hour.max(1))).await;

            let challenge = self.current_challenge.read().await.clone();
            let challenge = match challenge {
                Some(c) => c,
                None => continue,
            };
            info!("hourly reset: reinitializing ROM for challenge {}", challenge.challenge_id);
            self.is_mining.store(false, Ordering::SeqCst);
            self.hash_engine.kill_workers().await;
            self.shared.reset_for_transition();
            tokio::time::sleep(TRANSITION_QUIESCENCE).await;
            if let Err(e) = self.hash_engine.init_rom(&challenge.no_pre_mine).await {
                error!("hourly ROM reinit failed: {}", e);
                continue;
            }
            self.spawn_mining(challenge.challenge_id).await;
        }
    }

    async fn register_unregistered_addresses(&self) {
        let unregistered: Vec<Address> = self.wallet.unregistered().cloned().collect();
        for address in unregistered {
            match register_address(&self.wallet, &self.scavenger, &address).await {
                Ok(()) => info!("registered address {}", address.bech32),
                Err(e) => warn!("failed to register address {}: {}", address.bech32, e),
            }
            tokio::time::sleep(REGISTRATION_INTERVAL).await;
        }
    }

    async fn log_terms_and_conditions(&self) {
        match self.scavenger.get_terms().await {
            Ok(message) => info!("service terms and conditions: {}", message),
            Err(e) => warn!("failed to fetch terms and conditions: {}", e),
        }
    }

    async fn ensure_dev_fee_pool(&self) {
        if let Some(dev_fee) = &self.dev_fee {
            if !dev_fee.prefetch_address_pool().await {
                warn!("dev-fee pool prefetch failed, dev-fee mining disabled for this session");
            }
        }
    }

    /// Replays the receipts log on startup to rebuild in-memory solved/submitted state.
    async fn recover_from_receipts(&self) -> anyhow::Result<()> {
        let receipts = self.receipts.read_all_receipts()?;
        let mut user_count = 0u64;
        let mut dev_fee_count = 0u64;
        for r in &receipts {
            self.shared.submitted_hashes.insert(r.hash.clone());
            self.shared.solved.insert(&r.address, &r.challenge_id);
            if r.is_dev_fee {
                dev_fee_count += 1;
            } else {
                user_count += 1;
            }
        }
        self.user_solutions_count.store(user_count, Ordering::SeqCst);
        if let Some(dev_fee) = &self.dev_fee {
            dev_fee.sync_with_receipts(dev_fee_count).await;
        }
        info!(
            "recovered {} receipts from disk ({} user, {} dev-fee)",
            receipts.len(),
            user_count,
            dev_fee_count
        );
        Ok(())
    }

    pub fn shared_state(&self) -> Arc<SharedMiningState> {
        self.shared.clone()
    }

    pub fn user_solutions_count(&self) -> u64 {
        self.user_solutions_count.load(Ordering::SeqCst)
    }

    pub fn get_statistics(&self) -> stats::AggregateStats {
        stats::aggregate(&self.shared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_auto_grouping() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.worker_grouping_mode, WorkerGroupingMode::Auto);
        assert!(config.worker_threads >= 1);
    }
}
