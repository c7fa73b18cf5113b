use anyhow::anyhow;
use log::{error, info};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Seed value used until the first successful oracle refresh, and kept as
/// the floor if the oracle never answers again.
pub const FALLBACK_MICRO_LAMPORTS: u64 = 1_273_683;

const FEE_ORACLE_METHOD: &str = "qn_estimatePriorityFees";
const FEE_ORACLE_LAST_N_BLOCKS: u32 = 100;
const FEE_ORACLE_API_VERSION: u32 = 2;

#[derive(Debug, Serialize)]
struct FeeOracleRequest {
    jsonrpc: &'static str,
    id: u32,
    method: &'static str,
    params: FeeOracleParams,
}

#[derive(Debug, Serialize)]
struct FeeOracleParams {
    account: Option<String>,
    last_n_blocks: u32,
    api_version: u32,
}

#[derive(Debug, Deserialize)]
struct FeeOracleResponse {
    result: FeeOracleResult,
}

#[derive(Debug, Deserialize)]
struct FeeOracleResult {
    per_compute_unit: PerComputeUnit,
}

#[derive(Debug, Deserialize)]
struct PerComputeUnit {
    medium: u64,
    high: u64,
}

/// Samples the priority-fee oracle and exposes the medium/high
/// micro-lamports-per-compute-unit values as lock-free atomics.
///
/// Both values are seeded with [`FALLBACK_MICRO_LAMPORTS`]; construction
/// performs one refresh and fails if the oracle cannot be reached, so a
/// running service always carries real market data. Later refresh failures
/// keep the last good values.
pub struct PriorityFees {
    medium: AtomicU64,
    high: AtomicU64,
    // Single attempt per tick, so no retry middleware on this client.
    client: reqwest::Client,
    oracle_url: String,
}

impl PriorityFees {
    pub async fn new(oracle_url: String) -> Result<Arc<Self>, anyhow::Error> {
        let fees = Arc::new(Self {
            medium: AtomicU64::new(FALLBACK_MICRO_LAMPORTS),
            high: AtomicU64::new(FALLBACK_MICRO_LAMPORTS),
            client: reqwest::Client::new(),
            oracle_url,
        });

        fees.refresh()
            .await
            .map_err(|e| anyhow!("could not update priority fee stats: {}", e))?;

        Ok(fees)
    }

    #[cfg(test)]
    pub fn seeded_for_tests(medium: u64, high: u64) -> Arc<Self> {
        Arc::new(Self {
            medium: AtomicU64::new(medium),
            high: AtomicU64::new(high),
            client: reqwest::Client::new(),
            oracle_url: String::new(),
        })
    }

    pub fn medium_micro_lamports(&self) -> u64 {
        self.medium.load(Ordering::Relaxed)
    }

    pub fn high_micro_lamports(&self) -> u64 {
        self.high.load(Ordering::Relaxed)
    }

    /// One fee-oracle round trip. A non-200 response or zero medium/high
    /// values fail the refresh and leave the previous values in place.
    pub async fn refresh(&self) -> Result<(), anyhow::Error> {
        let request = FeeOracleRequest {
            jsonrpc: "2.0",
            id: 1,
            method: FEE_ORACLE_METHOD,
            params: FeeOracleParams {
                account: None,
                last_n_blocks: FEE_ORACLE_LAST_N_BLOCKS,
                api_version: FEE_ORACLE_API_VERSION,
            },
        };

        let response = self
            .client
            .post(&self.oracle_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("could not send fee oracle request: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "invalid fee oracle response code: {}, body: {}",
                status,
                body
            ));
        }

        let parsed: FeeOracleResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("could not decode fee oracle response: {}", e))?;

        let cu = parsed.result.per_compute_unit;
        if cu.high == 0 || cu.medium == 0 {
            return Err(anyhow!(
                "fee oracle returned zero per-compute-unit values: medium={}, high={}",
                cu.medium,
                cu.high
            ));
        }

        self.medium.store(cu.medium, Ordering::Relaxed);
        self.high.store(cu.high, Ordering::Relaxed);

        Ok(())
    }
}

/// Periodic refresh driver for [`PriorityFees`]. Failures are logged and
/// never propagated; the sampler keeps its last good values.
pub struct FeeRefreshWatcher {
    fees: Arc<PriorityFees>,
    refresh_interval: Duration,
    cancel_token: CancellationToken,
}

impl FeeRefreshWatcher {
    pub fn new(
        fees: Arc<PriorityFees>,
        cancel_token: CancellationToken,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            fees,
            refresh_interval,
            cancel_token,
        }
    }

    pub async fn watch(&self) -> Result<(), anyhow::Error> {
        info!("Starting priority fee watcher");

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Priority fee watcher received cancellation");
                break;
            }

            tokio::select! {
                _ = sleep(self.refresh_interval) => {}
                _ = self.cancel_token.cancelled() => {
                    info!("Priority fee watcher cancelled during sleep");
                    break;
                }
            }

            if let Err(e) = self.fees.refresh().await {
                error!("Priority fee refresh error: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_values_are_readable() {
        let fees = PriorityFees::seeded_for_tests(100, 200);
        assert_eq!(fees.medium_micro_lamports(), 100);
        assert_eq!(fees.high_micro_lamports(), 200);
    }

    #[tokio::test]
    async fn refresh_failure_keeps_last_good_values() {
        // Unroutable endpoint: the request errors, the seeds survive.
        let fees = PriorityFees {
            medium: AtomicU64::new(FALLBACK_MICRO_LAMPORTS),
            high: AtomicU64::new(FALLBACK_MICRO_LAMPORTS),
            client: reqwest::Client::new(),
            oracle_url: "http://127.0.0.1:1/".to_string(),
        };

        assert!(fees.refresh().await.is_err());
        assert_eq!(fees.medium_micro_lamports(), FALLBACK_MICRO_LAMPORTS);
        assert_eq!(fees.high_micro_lamports(), FALLBACK_MICRO_LAMPORTS);
    }

    #[test]
    fn oracle_request_shape() {
        let request = FeeOracleRequest {
            jsonrpc: "2.0",
            id: 1,
            method: FEE_ORACLE_METHOD,
            params: FeeOracleParams {
                account: None,
                last_n_blocks: FEE_ORACLE_LAST_N_BLOCKS,
                api_version: FEE_ORACLE_API_VERSION,
            },
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["method"], "qn_estimatePriorityFees");
        assert_eq!(body["params"]["last_n_blocks"], 100);
        assert_eq!(body["params"]["api_version"], 2);
        assert!(body["params"]["account"].is_null());
    }
}
