use serde::{Deserialize, Serialize};

/// Lifecycle code reported by `GET /challenge`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeCode {
    Before,
    Active,
    After,
}

/// Immutable snapshot of the server-reported challenge descriptor.
///
/// Workers are handed a deep-copied `Challenge` (it derives `Clone`, and
/// every field is owned data) for the duration of a single batch so that a
/// concurrent poll updating the orchestrator's "current" challenge cannot
/// mutate the bytes a batch is hashing mid-flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub challenge_id: String,
    pub difficulty: String,
    pub latest_submission: String,
    pub no_pre_mine: String,
    pub no_pre_mine_hour: String,
    pub starts_at: String,
    pub code: ChallengeCode,
}

impl Challenge {
    /// Fields that participate in `DifficultyChanged` comparison: anything
    /// that can mutate without the `challenge_id` changing.
    pub fn mutable_fields_differ(&self, other: &Challenge) -> bool {
        self.difficulty != other.difficulty
            || self.latest_submission != other.latest_submission
            || self.no_pre_mine_hour != other.no_pre_mine_hour
    }
}

/// The raw payload shape of `GET /challenge`. `challenge` is
/// absent when `code` is `before` or when the server has nothing active.
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeResponse {
    pub code: ChallengeCode,
    pub challenge: Option<RawChallenge>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChallenge {
    pub challenge_id: String,
    pub difficulty: String,
    pub latest_submission: String,
    pub no_pre_mine: String,
    pub no_pre_mine_hour: String,
    pub starts_at: String,
}

impl RawChallenge {
    pub fn into_challenge(self, code: ChallengeCode) -> Challenge {
        Challenge {
            challenge_id: self.challenge_id,
            difficulty: self.difficulty,
            latest_submission: self.latest_submission,
            no_pre_mine: self.no_pre_mine,
            no_pre_mine_hour: self.no_pre_mine_hour,
            starts_at: self.starts_at,
            code,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Challenge {
        Challenge {
            challenge_id: "C1".into(),
            difficulty: "ffffffff".into(),
            latest_submission: "abc".into(),
            no_pre_mine: "deadbeef".into(),
            no_pre_mine_hour: "hour1".into(),
            starts_at: "2026-01-01T00:00:00Z".into(),
            code: ChallengeCode::Active,
        }
    }

    #[test]
    fn identical_snapshots_do_not_differ() {
        let a = base();
        let b = base();
        assert!(!a.mutable_fields_differ(&b));
    }

    #[test]
    fn difficulty_change_is_detected() {
        let a = base();
        let mut b = base();
        b.difficulty = "0000ffff".into();
        assert!(a.mutable_fields_differ(&b));
    }

    #[test]
    fn challenge_id_change_is_not_a_mutable_field_diff() {
        // challenge_id changes are handled as a full transition, not via
        // mutable_fields_differ.
        let a = base();
        let mut b = base();
        b.challenge_id = "C2".into();
        assert!(!a.mutable_fields_differ(&b));
    }
}
