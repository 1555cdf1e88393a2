use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::address::{Address, WalletManager};
use crate::challenge::Challenge;
use crate::devfee::DevFeeRotator;
use crate::difficulty::{decode_hex, matches_difficulty};
use crate::error::MiningError;
use crate::hashengine::HashEngineClient;
use crate::preimage::{build_preimage, nonce_to_hex};
use crate::receipts::{ErrorRecord, ReceiptEntry, ReceiptsStore};
use crate::service::{classify_submission, ScavengerClient, SubmissionResult};
use crate::state::{submission_key, SharedMiningState, WorkerStat, WorkerStatus};

/// Width of each worker's disjoint nonce range. A worker's range for a given
/// `round` is `(worker_id + round * total_workers) * NONCE_RANGE_WIDTH`, so
/// a re-spawn after `RangeExhausted` walks a fresh block instead of
/// re-covering ground every worker already exhausted.
pub const NONCE_RANGE_WIDTH: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy)]
pub struct WorkerTuning {
    pub batch_size: usize,
    pub max_submission_failures: u32,
}

impl Default for WorkerTuning {
    fn default() -> Self {
        Self {
            batch_size: 300,
            max_submission_failures: 1,
        }
    }
}

/// Why a worker's `run` call returned. None of these are errors in the
/// Rust sense — they're the terminal states of the mining loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerOutcome {
    Solved,
    RangeExhausted,
    Stopped,
    ChallengeStale,
    FailureLimitReached,
    SiblingSubmitting,
}

/// Shared collaborators every worker needs, grouped so spawning a worker
/// task doesn't require a dozen loose `Arc` clones at the call site.
#[derive(Clone)]
pub struct WorkerContext {
    pub shared: Arc<SharedMiningState>,
    pub hash_engine: Arc<HashEngineClient>,
    pub scavenger: ScavengerClient,
    pub receipts: Arc<ReceiptsStore>,
    pub dev_fee: Option<Arc<DevFeeRotator>>,
    pub wallet: Arc<WalletManager>,
    pub current_challenge: Arc<RwLock<Option<Challenge>>>,
    pub is_mining: Arc<AtomicBool>,
    pub tuning: WorkerTuning,
}

/// Drives the mining loop for one `(worker_id, address)` pair against a
/// frozen challenge snapshot. `is_dev_fee` controls only bookkeeping on
/// acceptance.
pub async fn run_worker(
    ctx: &WorkerContext,
    worker_id: u32,
    total_workers: u32,
    round: u64,
    address: Address,
    snapshot: Challenge,
    is_dev_fee: bool,
) -> WorkerOutcome {
    let nonce_start = (worker_id as u64 + round * total_workers.max(1) as u64) * NONCE_RANGE_WIDTH;
    let nonce_end = nonce_start + NONCE_RANGE_WIDTH;
    let mut current_nonce = nonce_start;
    let key = submission_key(&address.bech32, &snapshot.challenge_id);

    let stat = Arc::new(WorkerStat::new(worker_id, address.index, address.bech32.clone()));
    *stat.current_challenge.lock().unwrap() = Some(snapshot.challenge_id.clone());
    ctx.shared.worker_stats.register(stat.clone());
    stat.set_status(WorkerStatus::Mining);

    loop {
        // 1. Preconditions.
        if ctx.shared.solved.contains(&address.bech32, &snapshot.challenge_id) {
            stat.set_status(WorkerStatus::Completed);
            return WorkerOutcome::Solved;
        }
        if ctx.shared.stopped_workers.is_stopped(worker_id) {
            stat.set_status(WorkerStatus::Completed);
            return WorkerOutcome::Stopped;
        }
        if ctx.shared.submission_failures.count(&key) >= ctx.tuning.max_submission_failures {
            stat.set_status(WorkerStatus::Completed);
            return WorkerOutcome::FailureLimitReached;
        }
        if !ctx.is_mining.load(Ordering::SeqCst) {
            stat.set_status(WorkerStatus::Completed);
            return WorkerOutcome::Stopped;
        }
        if ctx.shared.paused_addresses.is_paused(&key) {
            stat.set_status(WorkerStatus::Idle);
            tokio::time::sleep(Duration::from_millis(100)).await;
            continue;
        }
        stat.set_status(WorkerStatus::Mining);

        // 2. Batch build.
        if current_nonce >= nonce_end {
            stat.set_status(WorkerStatus::Completed);
            return WorkerOutcome::RangeExhausted;
        }
        let batch_end = (current_nonce + ctx.tuning.batch_size as u64).min(nonce_end);
        let nonces: Vec<u64> = (current_nonce..batch_end).collect();
        current_nonce = batch_end;

        let nonce_hexes: Vec<String> = nonces.iter().map(|n| nonce_to_hex(*n)).collect();
        let preimages: Vec<Vec<u8>> = nonce_hexes
            .iter()
            .map(|nh| build_preimage(nh, &address.bech32, &snapshot))
            .collect();

        // 3. Hash.
        let batch_started = Instant::now();
        let hashes = match ctx.hash_engine.hash_batch(&preimages).await {
            Ok(h) => h,
            Err(e) if e.is_transient() => {
                tokio::time::sleep(Duration::from_secs(2)).await;
                continue;
            }
            Err(e) => {
                warn!("worker {} hash_batch error: {}", worker_id, e);
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        stat.record_batch(hashes.len() as u64, batch_started.elapsed().as_secs_f64());

        {
            let held = ctx.current_challenge.read().await;
            let still_current = held.as_ref().map(|c| c.challenge_id == snapshot.challenge_id).unwrap_or(false);
            if !still_current {
                record_error(ctx, &address, &snapshot.challenge_id, &MiningError::ChallengeStale);
                stat.set_status(WorkerStatus::Completed);
                return WorkerOutcome::ChallengeStale;
            }
        }

        // 4. Scan.
        let difficulty_bytes = match decode_hex(&snapshot.difficulty) {
            Ok(d) => d,
            Err(_) => continue,
        };

        for (idx, hash) in hashes.iter().enumerate() {
            if !matches_difficulty(hash, &difficulty_bytes) {
                continue;
            }
            let hash_hex = hex::encode(hash);
            if ctx.shared.submitted_hashes.contains(&hash_hex) {
                continue;
            }
            if !ctx.shared.submitting_addresses.try_acquire(&key) {
                stat.set_status(WorkerStatus::Completed);
                return WorkerOutcome::SiblingSubmitting;
            }

            for sibling in ctx.shared.worker_stats.all() {
                if sibling.worker_id != worker_id && sibling.address == address.bech32 {
                    ctx.shared.stopped_workers.stop(sibling.worker_id);
                }
            }
            ctx.shared.paused_addresses.pause(&key);
            stat.set_status(WorkerStatus::Submitting);

            let nonce_hex = &nonce_hexes[idx];
            let outcome = validate_and_submit(ctx, &address, &snapshot, nonce_hex, hash, &hash_hex, is_dev_fee, worker_id).await;

            match outcome {
                BatchSolutionOutcome::Solved => {
                    ctx.shared.solved.insert(&address.bech32, &snapshot.challenge_id);
                    ctx.shared.submission_failures.clear_key(&key);
                    ctx.shared.paused_addresses.unpause(&key);
                    ctx.shared.submitting_addresses.release(&key);
                    stat.record_solution();
                    stat.set_status(WorkerStatus::Completed);
                    return WorkerOutcome::Solved;
                }
                BatchSolutionOutcome::StaleDifficulty => {
                    // Discard silently: not a failure, the pre-submission
                    // re-check failed because the mask tightened underneath
                    // us. Nothing was
                    // inserted into submitted_hashes for this attempt.
                    ctx.shared.paused_addresses.unpause(&key);
                    ctx.shared.submitting_addresses.release(&key);
                    stat.set_status(WorkerStatus::Mining);
                }
                BatchSolutionOutcome::Failed(submitted_hash_hex) => {
                    ctx.shared.submission_failures.increment(&key);
                    ctx.shared.paused_addresses.unpause(&key);
                    ctx.shared.submitting_addresses.release(&key);
                    ctx.shared.stopped_workers.clear();
                    ctx.shared.submitted_hashes.remove(&submitted_hash_hex);
                    stat.set_status(WorkerStatus::Mining);
                }
            }
        }
    }
}

enum BatchSolutionOutcome {
    Solved,
    StaleDifficulty,
    /// Submission failed after the hash was registered in
    /// `submitted_hashes`; carries that hash so the caller can undo it.
    Failed(String),
}

/// Re-validates a candidate hash against the latest challenge snapshot
/// before submitting it, in case mutable fields changed mid-batch.
#[allow(clippy::too_many_arguments)]
async fn validate_and_submit(
    ctx: &WorkerContext,
    address: &Address,
    snapshot: &Challenge,
    nonce_hex: &str,
    hash: &[u8],
    hash_hex: &str,
    is_dev_fee: bool,
    worker_id: u32,
) -> BatchSolutionOutcome {
    let current = ctx.current_challenge.read().await.clone();
    let (effective_hash, effective_hash_hex) = if let Some(current) = &current {
        if current.mutable_fields_differ(snapshot) {
            let difficulty_tightened = current.difficulty != snapshot.difficulty;
            let preimage = build_preimage(nonce_hex, &address.bech32, current);
            let rehashed = match ctx.hash_engine.hash_batch(std::slice::from_ref(&preimage)).await {
                Ok(mut v) if !v.is_empty() => v.remove(0),
                _ => return BatchSolutionOutcome::StaleDifficulty,
            };
            let difficulty_bytes = match decode_hex(&current.difficulty) {
                Ok(d) => d,
                Err(_) => return BatchSolutionOutcome::StaleDifficulty,
            };
            if !matches_difficulty(&rehashed, &difficulty_bytes) {
                let err = if difficulty_tightened {
                    MiningError::DifficultyIncreased
                } else {
                    MiningError::ChallengeStale
                };
                record_error(ctx, address, &snapshot.challenge_id, &err);
                return BatchSolutionOutcome::StaleDifficulty;
            }
            let rehashed_hex = hex::encode(&rehashed);
            (rehashed, rehashed_hex)
        } else {
            (hash.to_vec(), hash_hex.to_string())
        }
    } else {
        (hash.to_vec(), hash_hex.to_string())
    };

    ctx.shared.submitted_hashes.insert(effective_hash_hex.clone());

    match submit_solution(
        ctx,
        address,
        &snapshot.challenge_id,
        nonce_hex,
        &effective_hash,
        &effective_hash_hex,
        is_dev_fee,
        worker_id,
        false,
    )
    .await
    {
        Ok(()) => BatchSolutionOutcome::Solved,
        Err(_) => BatchSolutionOutcome::Failed(effective_hash_hex),
    }
}

/// Submits one solution and applies the full classification/retry protocol.
/// Returns `Ok(())` for acceptance (including
/// server-classified duplicates) and `Err` otherwise.
#[allow(clippy::too_many_arguments)]
async fn submit_solution(
    ctx: &WorkerContext,
    address: &Address,
    challenge_id: &str,
    nonce_hex: &str,
    hash: &[u8],
    hash_hex: &str,
    is_dev_fee: bool,
    worker_id: u32,
    is_retry: bool,
) -> Result<(), MiningError> {
    let http_outcome = match ctx.scavenger.submit_solution_raw(&address.bech32, challenge_id, nonce_hex).await {
        Ok(o) => o,
        Err(e) => {
            debug!("worker {} submission request failed: {}", worker_id, e);
            record_error(ctx, address, challenge_id, &MiningError::SubmissionTimeout);
            return Err(MiningError::SubmissionTimeout);
        }
    };

    match classify_submission(&http_outcome) {
        SubmissionResult::Accepted { crypto_receipt } => {
            if is_dev_fee {
                if let Some(dev_fee) = &ctx.dev_fee {
                    dev_fee.record_dev_fee_solution().await;
                }
            }
            let entry = ReceiptEntry {
                ts: chrono::Utc::now(),
                address: address.bech32.clone(),
                address_index: address.index,
                challenge_id: challenge_id.to_string(),
                nonce: nonce_hex.to_string(),
                hash: hash_hex.to_string(),
                crypto_receipt,
                is_dev_fee,
            };
            if let Err(e) = ctx.receipts.append_receipt(&entry) {
                warn!("worker {} failed to append receipt: {}", worker_id, e);
            }
            info!(
                "worker {} submitted solution for {} on {} (dev_fee={})",
                worker_id, address.bech32, challenge_id, is_dev_fee
            );
            Ok(())
        }
        SubmissionResult::Duplicate => {
            let err = MiningError::DuplicateSolution;
            debug!("duplicate solution for {}:{}, treating as solved", address.bech32, challenge_id);
            record_error(ctx, address, challenge_id, &err);
            Ok(())
        }
        SubmissionResult::Unregistered => {
            if is_retry {
                record_error(ctx, address, challenge_id, &MiningError::AddressUnregistered);
                return Err(MiningError::AddressUnregistered);
            }
            match register_address(&ctx.wallet, &ctx.scavenger, address).await {
                Ok(()) => Box::pin(submit_solution(ctx, address, challenge_id, nonce_hex, hash, hash_hex, is_dev_fee, worker_id, true)).await,
                Err(e) => {
                    debug!("worker {} re-registration failed: {}", worker_id, e);
                    record_error(ctx, address, challenge_id, &MiningError::AddressUnregistered);
                    Err(MiningError::AddressUnregistered)
                }
            }
        }
        SubmissionResult::Rejected(message) => {
            let err = MiningError::SubmissionRejected(message);
            record_error(ctx, address, challenge_id, &err);
            Err(err)
        }
    }
}

/// Signs and registers one address with the service. Shared between the
/// submission protocol's one-shot auto-retry and the
/// orchestrator's startup registration pass.
pub(crate) async fn register_address(
    wallet: &WalletManager,
    scavenger: &ScavengerClient,
    address: &Address,
) -> anyhow::Result<()> {
    let signature = wallet.sign_registration(address)?;
    let ok = scavenger.register(&address.bech32, &signature, &address.public_key).await?;
    if ok {
        address.mark_registered();
    }
    Ok(())
}

fn record_error(ctx: &WorkerContext, address: &Address, challenge_id: &str, err: &MiningError) {
    let entry = ErrorRecord {
        address: address.bech32.clone(),
        challenge_id: challenge_id.to_string(),
        kind: error_kind(err).to_string(),
        message: err.to_string(),
        recorded_at: chrono::Utc::now(),
    };
    if let Err(e) = ctx.receipts.append_error(&entry) {
        warn!("failed to append error record: {}", e);
    }
}

fn error_kind(err: &MiningError) -> &'static str {
    match err {
        MiningError::TransientBackend => "transient_backend",
        MiningError::RomInitTimeout => "rom_init_timeout",
        MiningError::ChallengeStale => "challenge_stale",
        MiningError::DifficultyIncreased => "difficulty_increased",
        MiningError::DuplicateSolution => "duplicate",
        MiningError::AddressUnregistered => "unregistered",
        MiningError::SubmissionTimeout => "network",
        MiningError::SubmissionRejected(_) => "rejected",
        MiningError::DevFeePoolInvalid => "dev_fee_pool_invalid",
        MiningError::ReceiptsIo(_) => "receipts_io",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range_for(worker_id: u32, total_workers: u32, round: u64) -> (u64, u64) {
        let start = (worker_id as u64 + round * total_workers.max(1) as u64) * NONCE_RANGE_WIDTH;
        (start, start + NONCE_RANGE_WIDTH)
    }

    #[test]
    fn nonce_ranges_are_disjoint_across_workers() {
        let total_workers = 8u32;
        for worker_id in 0..total_workers {
            let (start, end) = range_for(worker_id, total_workers, 0);
            if worker_id > 0 {
                let (_, prev_end) = range_for(worker_id - 1, total_workers, 0);
                assert_eq!(prev_end, start, "ranges must be contiguous and non-overlapping");
            }
            assert_eq!(end - start, NONCE_RANGE_WIDTH);
        }
    }

    #[test]
    fn nonce_ranges_are_disjoint_across_rounds() {
        let total_workers = 8u32;
        let mut seen = std::collections::HashSet::new();
        for round in 0u64..4 {
            for worker_id in 0..total_workers {
                let (start, _) = range_for(worker_id, total_workers, round);
                assert!(seen.insert(start), "round {} worker {} re-walked a prior range", round, worker_id);
            }
        }
    }
}
