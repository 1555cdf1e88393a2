use thiserror::Error;

/// Error taxonomy for the mining pipeline.
///
/// These are never the only way a component fails — network/IO errors are
/// still propagated as `anyhow::Error` at the call sites that don't need to
/// branch on kind — but anywhere the orchestrator or worker loop needs to
/// decide a retry/abort policy, the error is classified into one of these
/// variants first.
#[derive(Debug, Error)]
pub enum MiningError {
    #[error("hash engine backend busy, retry after backoff")]
    TransientBackend,

    #[error("ROM initialization did not complete within the timeout")]
    RomInitTimeout,

    #[error("challenge changed mid-batch, discarding stale results")]
    ChallengeStale,

    #[error("difficulty increased since the solution was found")]
    DifficultyIncreased,

    #[error("server reports this solution already exists")]
    DuplicateSolution,

    #[error("address is not registered with the service")]
    AddressUnregistered,

    #[error("submission request timed out, outcome unknown")]
    SubmissionTimeout,

    #[error("submission rejected: {0}")]
    SubmissionRejected(String),

    #[error("dev-fee address pool prefetch returned an invalid payload")]
    DevFeePoolInvalid,

    #[error("failed to append to receipts store: {0}")]
    ReceiptsIo(#[from] std::io::Error),
}

impl MiningError {
    /// Whether this error should be absorbed by the worker loop with a
    /// retry rather than counted against `MAX_SUBMISSION_FAILURES`.
    pub fn is_transient(&self) -> bool {
        matches!(self, MiningError::TransientBackend)
    }
}
