use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use dashmap::{DashMap, DashSet};
use serde::Serialize;

/// `address:challenge_id` composite key used by the submission arbitration
/// maps.
pub fn submission_key(address: &str, challenge_id: &str) -> String {
    format!("{}:{}", address, challenge_id)
}

/// `address -> set<challenge_id>` of solved pairs. Once a pair is present it
/// is never removed for the life of the process.
#[derive(Default)]
pub struct SolvedSet(DashMap<String, DashSet<String>>);

impl SolvedSet {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn contains(&self, address: &str, challenge_id: &str) -> bool {
        self.0
            .get(address)
            .map(|set| set.contains(challenge_id))
            .unwrap_or(false)
    }

    pub fn insert(&self, address: &str, challenge_id: &str) {
        self.0
            .entry(address.to_string())
            .or_insert_with(DashSet::new)
            .insert(challenge_id.to_string());
    }

    pub fn solved_challenges_for(&self, address: &str) -> Vec<String> {
        self.0
            .get(address)
            .map(|set| set.iter().map(|c| c.clone()).collect())
            .unwrap_or_default()
    }
}

/// Hashes already POSTed to the service, keyed by hex string.
#[derive(Default)]
pub struct SubmittedHashes(DashSet<String>);

impl SubmittedHashes {
    pub fn new() -> Self {
        Self(DashSet::new())
    }

    pub fn contains(&self, hash_hex: &str) -> bool {
        self.0.contains(hash_hex)
    }

    pub fn insert(&self, hash_hex: String) {
        self.0.insert(hash_hex);
    }

    pub fn remove(&self, hash_hex: &str) {
        self.0.remove(hash_hex);
    }
}

/// Keys (`address:challenge_id`) with an in-flight submission. Acquisition
/// is atomic test-and-set: only the caller whose `insert` returns `true`
/// proceeds.
#[derive(Default)]
pub struct SubmittingAddresses(DashSet<String>);

impl SubmittingAddresses {
    pub fn new() -> Self {
        Self(DashSet::new())
    }

    /// Returns `true` iff this call acquired the key (it was previously
    /// absent).
    pub fn try_acquire(&self, key: &str) -> bool {
        self.0.insert(key.to_string())
    }

    pub fn release(&self, key: &str) {
        self.0.remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }
}

/// Subset of `SubmittingAddresses` used to gate worker loops while a
/// submission is in progress on the shared address.
#[derive(Default)]
pub struct PausedAddresses(DashSet<String>);

impl PausedAddresses {
    pub fn new() -> Self {
        Self(DashSet::new())
    }

    pub fn pause(&self, key: &str) {
        self.0.insert(key.to_string());
    }

    pub fn unpause(&self, key: &str) {
        self.0.remove(key);
    }

    pub fn is_paused(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

/// Worker IDs asked to exit early because a sibling mining the same address
/// already succeeded.
#[derive(Default)]
pub struct StoppedWorkers(DashSet<u32>);

impl StoppedWorkers {
    pub fn new() -> Self {
        Self(DashSet::new())
    }

    pub fn stop(&self, worker_id: u32) {
        self.0.insert(worker_id);
    }

    pub fn is_stopped(&self, worker_id: u32) -> bool {
        self.0.contains(&worker_id)
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

/// `address:challenge_id -> failure count`, bounded by `MAX_SUBMISSION_FAILURES`.
#[derive(Default)]
pub struct AddressSubmissionFailures(DashMap<String, u32>);

impl AddressSubmissionFailures {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn count(&self, key: &str) -> u32 {
        self.0.get(key).map(|v| *v).unwrap_or(0)
    }

    pub fn increment(&self, key: &str) -> u32 {
        let mut entry = self.0.entry(key.to_string()).or_insert(0);
        *entry += 1;
        *entry
    }

    pub fn clear_key(&self, key: &str) {
        self.0.remove(key);
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Mining,
    Submitting,
    Completed,
}

/// Live per-worker telemetry. `hashes_computed` and
/// `solutions_found` are monotone counters; `hash_rate` is the caller's own
/// rolling estimate recomputed on each update.
pub struct WorkerStat {
    pub worker_id: u32,
    pub address_index: i64,
    pub address: String,
    pub hashes_computed: AtomicU64,
    hash_rate_bits: AtomicU64,
    pub solutions_found: AtomicU64,
    pub start_time: Instant,
    status: std::sync::Mutex<WorkerStatus>,
    pub current_challenge: std::sync::Mutex<Option<String>>,
}

impl WorkerStat {
    pub fn new(worker_id: u32, address_index: i64, address: String) -> Self {
        Self {
            worker_id,
            address_index,
            address,
            hashes_computed: AtomicU64::new(0),
            hash_rate_bits: AtomicU64::new(0),
            solutions_found: AtomicU64::new(0),
            start_time: Instant::now(),
            status: std::sync::Mutex::new(WorkerStatus::Idle),
            current_challenge: std::sync::Mutex::new(None),
        }
    }

    pub fn record_batch(&self, batch_len: u64, elapsed_secs: f64) {
        self.hashes_computed.fetch_add(batch_len, Ordering::Relaxed);
        if elapsed_secs > 0.0 {
            let rate = batch_len as f64 / elapsed_secs;
            self.hash_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn hash_rate(&self) -> f64 {
        f64::from_bits(self.hash_rate_bits.load(Ordering::Relaxed))
    }

    pub fn set_status(&self, status: WorkerStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.lock().unwrap()
    }

    pub fn record_solution(&self) {
        self.solutions_found.fetch_add(1, Ordering::Relaxed);
    }
}

/// All live workers' telemetry, keyed by `worker_id`.
#[derive(Default)]
pub struct WorkerStatsTable(DashMap<u32, std::sync::Arc<WorkerStat>>);

impl WorkerStatsTable {
    pub fn new() -> Self {
        Self(DashMap::new())
    }

    pub fn register(&self, stat: std::sync::Arc<WorkerStat>) {
        self.0.insert(stat.worker_id, stat);
    }

    pub fn get(&self, worker_id: u32) -> Option<std::sync::Arc<WorkerStat>> {
        self.0.get(&worker_id).map(|v| v.clone())
    }

    pub fn all(&self) -> Vec<std::sync::Arc<WorkerStat>> {
        self.0.iter().map(|v| v.clone()).collect()
    }

    pub fn clear(&self) {
        self.0.clear();
    }
}

/// Coordination state shared by every worker task and the orchestrator.
/// Constructed once per process and handed around by
/// `Arc` — never a module-level singleton.
#[derive(Default)]
pub struct SharedMiningState {
    pub solved: SolvedSet,
    pub submitted_hashes: SubmittedHashes,
    pub submitting_addresses: SubmittingAddresses,
    pub paused_addresses: PausedAddresses,
    pub stopped_workers: StoppedWorkers,
    pub submission_failures: AddressSubmissionFailures,
    pub worker_stats: WorkerStatsTable,
}

impl SharedMiningState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything that must be reset at a challenge transition or
    /// hourly reset, but never touches `solved` or
    /// `submitted_hashes` — those are monotone for the life of the process.
    pub fn reset_for_transition(&self) {
        self.worker_stats.clear();
        self.paused_addresses.clear();
        self.submitting_addresses.0.clear();
        self.stopped_workers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solved_set_is_per_address_per_challenge() {
        let solved = SolvedSet::new();
        assert!(!solved.contains("addr1", "C1"));
        solved.insert("addr1", "C1");
        assert!(solved.contains("addr1", "C1"));
        assert!(!solved.contains("addr1", "C2"));
        assert!(!solved.contains("addr2", "C1"));
    }

    #[test]
    fn submitting_addresses_test_and_set_is_exclusive() {
        let map = SubmittingAddresses::new();
        assert!(map.try_acquire("addr1:C1"));
        assert!(!map.try_acquire("addr1:C1"));
        map.release("addr1:C1");
        assert!(map.try_acquire("addr1:C1"));
    }

    #[test]
    fn submission_failures_increment_and_clear() {
        let failures = AddressSubmissionFailures::new();
        assert_eq!(failures.count("k"), 0);
        assert_eq!(failures.increment("k"), 1);
        assert_eq!(failures.increment("k"), 2);
        failures.clear_key("k");
        assert_eq!(failures.count("k"), 0);
    }

    #[test]
    fn reset_for_transition_preserves_monotone_sets() {
        let state = SharedMiningState::new();
        state.solved.insert("addr1", "C1");
        state.submitted_hashes.insert("abc".to_string());
        state.stopped_workers.stop(3);
        state.paused_addresses.pause("addr1:C1");

        state.reset_for_transition();

        assert!(state.solved.contains("addr1", "C1"));
        assert!(state.submitted_hashes.contains("abc"));
        assert!(!state.stopped_workers.is_stopped(3));
        assert!(!state.paused_addresses.is_paused("addr1:C1"));
    }
}
