//! Bounded-concurrency, retrying wrapper around any [`LedgerClient`].
//!
//! - At most `concurrency` requests are in flight; the permit is released
//!   before any backoff sleep.
//! - Each attempt has its own timeout, which counts as a transient failure.
//! - Transient failures are retried with exponential backoff up to
//!   `max_attempts`; permanent ones are returned immediately.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use ethers::types::{Address, U256};
use futures::{stream, StreamExt};
use tokio::sync::Semaphore;

use crate::chain::ledger::{dispatch, LedgerCall, LedgerClient, LedgerResponse};
use crate::config::FetchConfig;
use crate::error::{AnalysisError, Result};
use crate::models::{Direction, Height, PoolId, PoolSnapshot, TickBitmapWord, TickLiquidity};

pub struct GatedLedger<C> {
    inner: C,
    permits: Arc<Semaphore>,
    config: FetchConfig,
}

impl<C: LedgerClient> GatedLedger<C> {
    pub fn new(inner: C, config: FetchConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self { inner, permits, config }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            // attempts are capped by count, not elapsed time
            max_elapsed_time: None,
            ..Default::default()
        }
    }

    async fn guarded<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.config.max_attempts.max(1);
        let (attempts, op, permits, timeout) = (&attempts, &op, &self.permits, self.config.request_timeout);

        retry_notify(
            self.policy(),
            move || async move {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
                let outcome = {
                    let _permit = permits
                        .acquire()
                        .await
                        .map_err(|_| backoff::Error::permanent(AnalysisError::Rpc("ledger gate closed".into())))?;
                    match tokio::time::timeout(timeout, op()).await {
                        Ok(res) => res,
                        Err(_) => Err(AnalysisError::Rpc(format!("{} timed out after {:?}", what, timeout))),
                    }
                };
                match outcome {
                    Ok(v) => Ok(v),
                    Err(e) if e.is_transient() && attempt < max_attempts => Err(backoff::Error::transient(e)),
                    Err(e) => {
                        if e.is_transient() {
                            log::warn!("{} gave up after {} attempts: {}", what, attempt, e);
                        }
                        Err(backoff::Error::permanent(e))
                    }
                }
            },
            |err: AnalysisError, wait| {
                log::debug!("{} failed ({}), retrying in {:?}", what, err, wait);
            },
        )
        .await
    }
}

#[async_trait]
impl<C: LedgerClient> LedgerClient for GatedLedger<C> {
    async fn get_snapshot(&self, pool: PoolId, height: Height) -> Result<PoolSnapshot> {
        self.guarded("get_snapshot", || self.inner.get_snapshot(pool, height)).await
    }

    async fn get_bitmap_word(&self, pool: PoolId, word_index: i32, height: Height) -> Result<TickBitmapWord> {
        self.guarded("get_bitmap_word", || self.inner.get_bitmap_word(pool, word_index, height))
            .await
    }

    async fn get_tick_liquidity(&self, pool: PoolId, tick: i32, height: Height) -> Result<TickLiquidity> {
        self.guarded("get_tick_liquidity", || self.inner.get_tick_liquidity(pool, tick, height))
            .await
    }

    async fn quote(&self, pool: PoolId, amount_in: U256, direction: Direction, height: Height) -> Result<U256> {
        self.guarded("quote", || self.inner.quote(pool, amount_in, direction, height)).await
    }

    async fn get_reserves(&self, pair: Address, height: Height) -> Result<(U256, U256)> {
        self.guarded("get_reserves", || self.inner.get_reserves(pair, height)).await
    }

    async fn get_vault_underlying(&self, vault: Address, height: Height) -> Result<(U256, U256)> {
        self.guarded("get_vault_underlying", || self.inner.get_vault_underlying(vault, height))
            .await
    }

    async fn get_vault_ranges(&self, vault: Address, height: Height) -> Result<Vec<(i32, i32)>> {
        self.guarded("get_vault_ranges", || self.inner.get_vault_ranges(vault, height))
            .await
    }

    async fn get_timestamp(&self, height: Height) -> Result<i64> {
        self.guarded("get_timestamp", || self.inner.get_timestamp(height)).await
    }

    /// One gated round trip for the whole batch; items that failed
    /// transiently are retried one by one.
    async fn batch(&self, calls: Vec<LedgerCall>) -> Vec<Result<LedgerResponse>> {
        let first = {
            let _permit = self.permits.acquire().await;
            tokio::time::timeout(self.config.request_timeout, self.inner.batch(calls.clone())).await
        };
        let first = match first {
            Ok(results) if results.len() == calls.len() => results,
            Ok(_) | Err(_) => {
                log::warn!("batch of {} calls failed as a whole, issuing them one by one", calls.len());
                calls
                    .iter()
                    .map(|_| Err(AnalysisError::Rpc("batch failed".into())))
                    .collect()
            }
        };

        stream::iter(calls.into_iter().zip(first).map(|(call, res)| async move {
            match res {
                Err(e) if e.is_transient() => {
                    self.guarded("batched call", || dispatch(&self.inner, call.clone())).await
                }
                other => other,
            }
        }))
        .buffered(self.config.concurrency.max(1))
        .collect::<Vec<_>>()
        .await
    }
}
