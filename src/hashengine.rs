use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{anyhow, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::MiningError;

/// Configuration for the hash engine driver.
#[derive(Debug, Clone)]
pub struct HashEngineConfig {
    pub endpoint: String,
    pub rom_init_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HashEngineConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:9090".to_string(),
            rom_init_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Serialize)]
struct InitRequest<'a> {
    no_pre_mine: &'a str,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(rename = "romInitialized")]
    rom_initialized: bool,
}

#[derive(Debug, Serialize)]
struct BatchHashRequest<'a> {
    preimages: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchHashResponse {
    hashes: Vec<String>,
}

/// Stateful client for the hash engine process: holds no ROM state itself
/// (that lives in the driven process) but tracks whether the last known
/// ROM matches what we asked it to build.
pub struct HashEngineClient {
    client: Client,
    config: HashEngineConfig,
    rom_ready: AtomicBool,
    current_no_pre_mine: std::sync::Mutex<Option<String>>,
}

impl HashEngineClient {
    pub fn new(config: HashEngineConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self {
            client,
            config,
            rom_ready: AtomicBool::new(false),
            current_no_pre_mine: std::sync::Mutex::new(None),
        })
    }

    /// Idempotent: a repeated call with the same `no_pre_mine` is a no-op.
    /// Blocks until the driver reports readiness or `rom_init_timeout`
    /// elapses, returning `MiningError::RomInitTimeout` on expiry.
    pub async fn init_rom(&self, no_pre_mine: &str) -> Result<(), MiningError> {
        {
            let current = self.current_no_pre_mine.lock().unwrap();
            if current.as_deref() == Some(no_pre_mine) && self.rom_ready.load(Ordering::SeqCst) {
                debug!("ROM already initialized for this no_pre_mine, skipping");
                return Ok(());
            }
        }

        self.rom_ready.store(false, Ordering::SeqCst);
        info!("requesting ROM init");

        let url = format!("{}/init", self.config.endpoint);
        self.client
            .post(&url)
            .json(&InitRequest { no_pre_mine })
            .send()
            .await
            .map_err(|_| MiningError::TransientBackend)?;

        {
            let mut current = self.current_no_pre_mine.lock().unwrap();
            *current = Some(no_pre_mine.to_string());
        }

        let deadline = tokio::time::Instant::now() + self.config.rom_init_timeout;
        loop {
            if self.poll_ready().await {
                self.rom_ready.store(true, Ordering::SeqCst);
                info!("ROM initialized");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(MiningError::RomInitTimeout);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }

    async fn poll_ready(&self) -> bool {
        let url = format!("{}/health", self.config.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => resp
                .json::<HealthResponse>()
                .await
                .map(|h| h.rom_initialized)
                .unwrap_or(false),
            _ => false,
        }
    }

    pub fn is_rom_ready(&self) -> bool {
        self.rom_ready.load(Ordering::SeqCst)
    }

    /// Hash a batch of preimages, preserving input order. The
    /// preimages built by `crate::preimage::build_preimage` are ASCII byte
    /// strings, so they travel over the wire as UTF-8 (the driver also
    /// accepts plain hex, but this client always sends UTF-8).
    pub async fn hash_batch(&self, preimages: &[Vec<u8>]) -> Result<Vec<Vec<u8>>, MiningError> {
        let encoded: Vec<String> = preimages
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();

        let url = format!("{}/hash-batch", self.config.endpoint);
        let response = self
            .client
            .post(&url)
            .json(&BatchHashRequest { preimages: &encoded })
            .send()
            .await;

        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(MiningError::TransientBackend),
            Err(_) => return Err(MiningError::TransientBackend),
        };

        match response.status() {
            StatusCode::REQUEST_TIMEOUT => Err(MiningError::TransientBackend),
            StatusCode::SERVICE_UNAVAILABLE => Err(MiningError::TransientBackend),
            status if status.is_success() => {
                let body: BatchHashResponse = response
                    .json()
                    .await
                    .map_err(|_| MiningError::TransientBackend)?;
                if body.hashes.len() != preimages.len() {
                    warn!(
                        "hash engine returned {} hashes for {} preimages",
                        body.hashes.len(),
                        preimages.len()
                    );
                }
                body.hashes
                    .iter()
                    .map(|h| hex::decode(h).map_err(|_| MiningError::TransientBackend))
                    .collect()
            }
            _ => Err(MiningError::TransientBackend),
        }
    }

    /// Tear down internal worker state on the driven process to allow a
    /// clean reinit. Best-effort: a driver that doesn't expose this endpoint is
    /// tolerated, since the subsequent `init_rom` call will reinitialize
    /// regardless. Does not touch `rom_ready`: killing workers doesn't by
    /// itself invalidate the ROM the driver already built, so callers can
    /// still consult `is_rom_ready()` afterward to decide whether a reinit
    /// is actually needed.
    pub async fn kill_workers(&self) {
        let url = format!("{}/kill", self.config.endpoint);
        if let Err(e) = self.client.post(&url).send().await {
            debug!("kill_workers call failed (driver may not expose /kill): {}", e);
        }
    }
}

pub fn default_error() -> anyhow::Error {
    anyhow!("hash engine driver unavailable")
}
