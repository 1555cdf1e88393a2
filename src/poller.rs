use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::challenge::{Challenge, ChallengeCode};
use crate::service::ScavengerClient;

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Events the poller emits for the orchestrator to act on.
#[derive(Debug, Clone)]
pub enum ChallengeEvent {
    /// `code = before`: nothing to do yet.
    NotStarted,
    /// `code = after`: the challenge window has ended, orchestrator should
    /// wind down.
    ShutdownRequested,
    /// New `challenge_id` seen.
    ChallengeTransition { old: Option<Challenge>, new: Challenge },
    /// Same `challenge_id`, but `difficulty` or another mutable field moved.
    DifficultyChanged { old: Challenge, new: Challenge },
    /// Active challenge, unchanged from what's already held.
    Unchanged,
}

/// Periodic challenge-descriptor poller. Holds the last accepted snapshot so
/// it can classify each tick against it; errors are logged and never stop
/// the poller.
pub struct ChallengePoller {
    client: ScavengerClient,
    held: Mutex<Option<Challenge>>,
}

impl ChallengePoller {
    pub fn new(client: ScavengerClient) -> Self {
        Self {
            client,
            held: Mutex::new(None),
        }
    }

    /// Single poll tick. Never returns an error: network/decoding failures
    /// are logged and reported as `Unchanged` so the caller's loop keeps
    /// running at its normal cadence.
    pub async fn poll_once(&self) -> ChallengeEvent {
        let (code, challenge) = match self.client.get_challenge().await {
            Ok(v) => v,
            Err(e) => {
                error!("challenge poll failed: {}", e);
                return ChallengeEvent::Unchanged;
            }
        };

        match code {
            ChallengeCode::Before => {
                debug!("challenge has not started yet");
                ChallengeEvent::NotStarted
            }
            ChallengeCode::After => {
                info!("challenge window has ended");
                ChallengeEvent::ShutdownRequested
            }
            ChallengeCode::Active => {
                let new = match challenge {
                    Some(c) => c,
                    None => {
                        error!("server reported code=active with no challenge payload");
                        return ChallengeEvent::Unchanged;
                    }
                };
                self.classify_active(new).await
            }
        }
    }

    async fn classify_active(&self, new: Challenge) -> ChallengeEvent {
        let mut held = self.held.lock().await;
        match held.take() {
            None => {
                *held = Some(new.clone());
                ChallengeEvent::ChallengeTransition { old: None, new }
            }
            Some(old) if old.challenge_id != new.challenge_id => {
                *held = Some(new.clone());
                ChallengeEvent::ChallengeTransition { old: Some(old), new }
            }
            Some(old) if old.mutable_fields_differ(&new) => {
                *held = Some(new.clone());
                ChallengeEvent::DifficultyChanged { old, new }
            }
            Some(old) => {
                *held = Some(old);
                ChallengeEvent::Unchanged
            }
        }
    }

    /// Replace the held snapshot without emitting an event, used by the
    /// orchestrator after it finishes handling a transition so the next
    /// poll compares against the now-current state.
    pub async fn set_held(&self, challenge: Challenge) {
        *self.held.lock().await = Some(challenge);
    }

    pub async fn run<F>(&self, mut on_event: F)
    where
        F: FnMut(ChallengeEvent) -> bool,
    {
        let mut interval = tokio::time::interval(POLL_INTERVAL);
        loop {
            interval.tick().await;
            let event = self.poll_once().await;
            if !on_event(event) {
                break;
            }
        }
    }
}
