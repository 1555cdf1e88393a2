use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::challenge::{Challenge, ChallengeCode, ChallengeResponse};

/// HTTP client for the scavenger challenge service.
#[derive(Clone)]
pub struct ScavengerClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct TermsResponse {
    message: String,
}

/// Raw outcome of a submission POST, before message-based classification.
/// The caller never sees a thrown error for a 4xx response — only for 5xx
/// and transport failures.
#[derive(Debug, Clone)]
pub struct SubmitHttpOutcome {
    pub status: StatusCode,
    pub body: Value,
}

impl ScavengerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    pub async fn get_challenge(&self) -> Result<(ChallengeCode, Option<Challenge>)> {
        let url = format!("{}/challenge", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("GET /challenge request failed")?;
        let body: ChallengeResponse = resp.json().await.context("decoding /challenge response")?;
        let challenge = body.challenge.map(|c| c.into_challenge(body.code));
        Ok((body.code, challenge))
    }

    pub async fn get_terms(&self) -> Result<String> {
        let url = format!("{}/TandC", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("GET /TandC request failed")?;
        let body: TermsResponse = resp.json().await.context("decoding /TandC response")?;
        Ok(body.message)
    }

    /// 2xx on success; an existing registration returns 4xx, which this
    /// treats as a non-fatal condition (the address is already usable).
    pub async fn register(&self, address: &str, signature: &str, public_key_hex: &str) -> Result<bool> {
        let url = format!(
            "{}/register/{}/{}/{}",
            self.base_url, address, signature, public_key_hex
        );
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .context("POST /register request failed")?;
        if resp.status().is_server_error() {
            bail!("registration failed with server error {}", resp.status());
        }
        Ok(resp.status().is_success())
    }

    /// Issues the submission POST. Never returns `Err` for a 4xx body —
    /// callers classify that via [`classify_submission`]. Only 5xx and
    /// network/timeout failures are propagated as errors.
    pub async fn submit_solution_raw(
        &self,
        address: &str,
        challenge_id: &str,
        nonce_hex: &str,
    ) -> Result<SubmitHttpOutcome> {
        let url = format!("{}/solution/{}/{}/{}", self.base_url, address, challenge_id, nonce_hex);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(60))
            .send()
            .await
            .context("POST /solution request failed")?;
        let status = resp.status();
        if status.is_server_error() {
            bail!("submission failed with server error {}", status);
        }
        let body = resp.json::<Value>().await.unwrap_or(Value::Null);
        Ok(SubmitHttpOutcome { status, body })
    }
}

/// Classification of a submission's outcome. This is a pure function over the raw HTTP outcome so it can be
/// exercised without a live server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionResult {
    Accepted { crypto_receipt: Option<Value> },
    Duplicate,
    Unregistered,
    Rejected(String),
}

pub fn classify_submission(outcome: &SubmitHttpOutcome) -> SubmissionResult {
    if outcome.status.is_success() {
        let crypto_receipt = outcome.body.get("crypto_receipt").cloned();
        return SubmissionResult::Accepted { crypto_receipt };
    }

    let message = extract_message(&outcome.body).unwrap_or_default();
    let lower = message.to_lowercase();

    if lower.contains("already exists") || lower.contains("duplicate") {
        return SubmissionResult::Duplicate;
    }
    if outcome.status == StatusCode::FORBIDDEN || lower.contains("not registered") || lower.contains("unregistered") {
        return SubmissionResult::Unregistered;
    }
    SubmissionResult::Rejected(message)
}

fn extract_message(body: &Value) -> Option<String> {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outcome(status: StatusCode, body: Value) -> SubmitHttpOutcome {
        SubmitHttpOutcome { status, body }
    }

    #[test]
    fn success_status_is_accepted() {
        let o = outcome(StatusCode::OK, json!({"crypto_receipt": {"id": "abc"}}));
        match classify_submission(&o) {
            SubmissionResult::Accepted { crypto_receipt } => {
                assert_eq!(crypto_receipt, Some(json!({"id": "abc"})));
            }
            other => panic!("expected Accepted, got {:?}", other),
        }
    }

    #[test]
    fn already_exists_message_is_duplicate() {
        let o = outcome(StatusCode::BAD_REQUEST, json!({"error": "solution already exists"}));
        assert_eq!(classify_submission(&o), SubmissionResult::Duplicate);
    }

    #[test]
    fn duplicate_keyword_is_duplicate_regardless_of_case() {
        let o = outcome(StatusCode::BAD_REQUEST, json!({"error": "Duplicate submission"}));
        assert_eq!(classify_submission(&o), SubmissionResult::Duplicate);
    }

    #[test]
    fn forbidden_status_is_unregistered() {
        let o = outcome(StatusCode::FORBIDDEN, json!({"error": "forbidden"}));
        assert_eq!(classify_submission(&o), SubmissionResult::Unregistered);
    }

    #[test]
    fn not_registered_message_is_unregistered_even_without_403() {
        let o = outcome(StatusCode::BAD_REQUEST, json!({"error": "address not registered"}));
        assert_eq!(classify_submission(&o), SubmissionResult::Unregistered);
    }

    #[test]
    fn other_4xx_is_rejected_with_message() {
        let o = outcome(StatusCode::BAD_REQUEST, json!({"error": "difficulty not met"}));
        assert_eq!(
            classify_submission(&o),
            SubmissionResult::Rejected("difficulty not met".to_string())
        );
    }

    #[test]
    fn missing_message_still_classifies_as_rejected() {
        let o = outcome(StatusCode::BAD_REQUEST, Value::Null);
        assert_eq!(classify_submission(&o), SubmissionResult::Rejected(String::new()));
    }
}
