use serde::Serialize;

use crate::state::{SharedMiningState, WorkerStatus};

/// Point-in-time rollup over `WorkerStats`, computed on demand rather than
/// maintained incrementally — cheap enough given the low polling cadence.
#[derive(Debug, Clone, Serialize)]
pub struct AggregateStats {
    pub worker_count: usize,
    pub idle_workers: usize,
    pub mining_workers: usize,
    pub submitting_workers: usize,
    pub total_hashes_computed: u64,
    pub aggregate_hash_rate: f64,
    pub solutions_found: u64,
}

pub fn aggregate(shared: &SharedMiningState) -> AggregateStats {
    let workers = shared.worker_stats.all();
    let mut stats = AggregateStats {
        worker_count: workers.len(),
        idle_workers: 0,
        mining_workers: 0,
        submitting_workers: 0,
        total_hashes_computed: 0,
        aggregate_hash_rate: 0.0,
        solutions_found: 0,
    };

    for w in &workers {
        match w.status() {
            WorkerStatus::Idle => stats.idle_workers += 1,
            WorkerStatus::Mining => stats.mining_workers += 1,
            WorkerStatus::Submitting => stats.submitting_workers += 1,
            WorkerStatus::Completed => {}
        }
        stats.total_hashes_computed += w.hashes_computed.load(std::sync::atomic::Ordering::Relaxed);
        stats.aggregate_hash_rate += w.hash_rate();
        stats.solutions_found += w.solutions_found.load(std::sync::atomic::Ordering::Relaxed);
    }

    stats
}

/// Watchdog check: flags an unhealthy mining round if any
/// worker is idle while mining is supposed to be active, or any worker is
/// still assigned to an address already solved for the current challenge.
pub fn watchdog_detects_issue(shared: &SharedMiningState, current_challenge_id: &str) -> bool {
    let workers = shared.worker_stats.all();
    for w in &workers {
        if w.status() == WorkerStatus::Idle {
            return true;
        }
        if shared.solved.contains(&w.address, current_challenge_id) && w.status() != WorkerStatus::Completed {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::WorkerStat;
    use std::sync::Arc;

    #[test]
    fn aggregate_counts_workers_by_status() {
        let shared = SharedMiningState::new();
        let a = Arc::new(WorkerStat::new(0, 0, "addr1".into()));
        a.set_status(WorkerStatus::Mining);
        let b = Arc::new(WorkerStat::new(1, 0, "addr1".into()));
        b.set_status(WorkerStatus::Idle);
        shared.worker_stats.register(a);
        shared.worker_stats.register(b);

        let stats = aggregate(&shared);
        assert_eq!(stats.worker_count, 2);
        assert_eq!(stats.mining_workers, 1);
        assert_eq!(stats.idle_workers, 1);
    }

    #[test]
    fn watchdog_flags_idle_worker_during_active_mining() {
        let shared = SharedMiningState::new();
        let a = Arc::new(WorkerStat::new(0, 0, "addr1".into()));
        a.set_status(WorkerStatus::Idle);
        shared.worker_stats.register(a);
        assert!(watchdog_detects_issue(&shared, "C1"));
    }

    #[test]
    fn watchdog_flags_worker_still_on_solved_address() {
        let shared = SharedMiningState::new();
        shared.solved.insert("addr1", "C1");
        let a = Arc::new(WorkerStat::new(0, 0, "addr1".into()));
        a.set_status(WorkerStatus::Mining);
        shared.worker_stats.register(a);
        assert!(watchdog_detects_issue(&shared, "C1"));
    }

    #[test]
    fn watchdog_is_quiet_when_everything_is_healthy() {
        let shared = SharedMiningState::new();
        let a = Arc::new(WorkerStat::new(0, 0, "addr1".into()));
        a.set_status(WorkerStatus::Mining);
        shared.worker_stats.register(a);
        assert!(!watchdog_detects_issue(&shared, "C1"));
    }
}
