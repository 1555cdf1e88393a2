use serde::{Deserialize, Serialize};

/// How `startMining` distributes the worker pool across eligible addresses
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkerGroupingMode {
    Auto,
    Grouped,
    AllOnOne,
}

impl Default for WorkerGroupingMode {
    fn default() -> Self {
        WorkerGroupingMode::Auto
    }
}

/// One contiguous block of worker IDs assigned to the address at
/// `address_index` within the caller's eligible-address list `R`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerGroupAssignment {
    pub address_index: usize,
    pub worker_ids: Vec<u32>,
}

fn clamp(value: u32, min: u32, max: u32) -> u32 {
    value.max(min).min(max)
}

pub fn min_workers_per_address(mode: WorkerGroupingMode, total_workers: u32, workers_per_address: u32) -> u32 {
    match mode {
        WorkerGroupingMode::Grouped => workers_per_address.max(1),
        WorkerGroupingMode::AllOnOne => total_workers.max(1),
        WorkerGroupingMode::Auto => {
            if total_workers <= 4 {
                total_workers.max(1)
            } else {
                clamp(total_workers / 4, 3, 5)
            }
        }
    }
}

/// Computes worker groups for a mining round. `eligible`
/// is `|R|`, the count of addresses registered and not yet solved for the
/// current challenge. Returns an empty vec if `eligible == 0` (stop mining
/// until a new challenge arrives) or `total_workers == 0`.
pub fn calculate_worker_groups(
    total_workers: u32,
    eligible: usize,
    mode: WorkerGroupingMode,
    workers_per_address: u32,
) -> Vec<WorkerGroupAssignment> {
    if total_workers == 0 || eligible == 0 {
        return Vec::new();
    }

    let min_per_addr = min_workers_per_address(mode, total_workers, workers_per_address);
    let max_groups = (total_workers / min_per_addr.max(1)).max(0);
    let mut group_count = (max_groups as usize).min(eligible);
    if group_count == 0 {
        group_count = 1;
    }

    let base = total_workers / group_count as u32;
    let remainder = total_workers % group_count as u32;

    let mut assignments = Vec::with_capacity(group_count);
    let mut next_worker_id = 0u32;
    for address_index in 0..group_count {
        let size = base + if (address_index as u32) < remainder { 1 } else { 0 };
        let worker_ids: Vec<u32> = (next_worker_id..next_worker_id + size).collect();
        next_worker_id += size;
        assignments.push(WorkerGroupAssignment { address_index, worker_ids });
    }
    assignments
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_eligible_addresses_yields_no_groups() {
        assert!(calculate_worker_groups(8, 0, WorkerGroupingMode::Auto, 2).is_empty());
    }

    #[test]
    fn single_worker_falls_back_to_one_group_of_one() {
        let groups = calculate_worker_groups(1, 5, WorkerGroupingMode::Auto, 2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].worker_ids, vec![0]);
    }

    #[test]
    fn auto_mode_small_pool_puts_everyone_on_one_address() {
        let groups = calculate_worker_groups(4, 5, WorkerGroupingMode::Auto, 2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].worker_ids.len(), 4);
    }

    #[test]
    fn auto_mode_large_pool_clamps_group_size_between_three_and_five() {
        // total=20 -> total/4=5, within [3,5] -> min_per_addr=5, max_groups=4
        let groups = calculate_worker_groups(20, 10, WorkerGroupingMode::Auto, 2);
        assert_eq!(groups.len(), 4);
        let total: usize = groups.iter().map(|g| g.worker_ids.len()).sum();
        assert_eq!(total, 20);
    }

    #[test]
    fn grouped_mode_honors_workers_per_address() {
        let groups = calculate_worker_groups(9, 5, WorkerGroupingMode::Grouped, 3);
        // min_per_addr=3, max_groups=3, eligible=5 -> group_count=3
        assert_eq!(groups.len(), 3);
        let total: usize = groups.iter().map(|g| g.worker_ids.len()).sum();
        assert_eq!(total, 9);
    }

    #[test]
    fn all_on_one_mode_always_produces_a_single_group() {
        let groups = calculate_worker_groups(12, 5, WorkerGroupingMode::AllOnOne, 2);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].worker_ids.len(), 12);
    }

    #[test]
    fn remainder_workers_go_to_the_first_groups() {
        let groups = calculate_worker_groups(10, 3, WorkerGroupingMode::Grouped, 1);
        // min_per_addr=1, max_groups=10, eligible=3 -> group_count=3, base=3 rem=1
        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].worker_ids.len(), 4);
        assert_eq!(groups[1].worker_ids.len(), 3);
        assert_eq!(groups[2].worker_ids.len(), 3);
    }

    #[test]
    fn worker_ids_are_contiguous_and_non_overlapping() {
        let groups = calculate_worker_groups(10, 3, WorkerGroupingMode::Grouped, 1);
        let mut all_ids: Vec<u32> = groups.iter().flat_map(|g| g.worker_ids.clone()).collect();
        all_ids.sort_unstable();
        assert_eq!(all_ids, (0..10).collect::<Vec<_>>());
    }
}
