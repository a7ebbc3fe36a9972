// Migration signals
// -----------------
// Three heights mark the move from the pair to the pool:
//   - the pool's first initialized height
//   - the vault's first non-empty height (the migration itself)
//   - the first daily sample where the pair's reserves fall by more than a
//     threshold against the previous sample

use ethers::types::{Address, U256};
use futures::{stream, StreamExt};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::chain::ledger::LedgerClient;
use crate::config::SearchConfig;
use crate::engine::boundary::{locate_transition, BoundaryHit};
use crate::error::{AnalysisError, Result};
use crate::models::{Height, PoolId};

/// True once the pool exists. Queries before creation are expected to fail
/// with `NotInitialized`.
pub async fn pool_initialized<C: LedgerClient + ?Sized>(ledger: &C, pool: PoolId, height: Height) -> Result<bool> {
    match ledger.get_snapshot(pool, height).await {
        Ok(_) => Ok(true),
        Err(AnalysisError::NotInitialized { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

/// True once the vault holds anything.
pub async fn vault_funded<C: LedgerClient + ?Sized>(ledger: &C, vault: Address, height: Height) -> Result<bool> {
    match ledger.get_vault_underlying(vault, height).await {
        Ok((a0, a1)) => Ok(!a0.is_zero() || !a1.is_zero()),
        Err(AnalysisError::NotInitialized { .. }) => Ok(false),
        Err(e) => Err(e),
    }
}

pub async fn pool_creation_height<C: LedgerClient + ?Sized>(
    ledger: &C,
    pool: PoolId,
    lo: Height,
    hi: Height,
    search: &SearchConfig,
) -> Result<BoundaryHit> {
    locate_transition("pool creation", lo, hi, search, |h| pool_initialized(ledger, pool, h)).await
}

pub async fn first_deposit_height<C: LedgerClient + ?Sized>(
    ledger: &C,
    vault: Address,
    lo: Height,
    hi: Height,
    search: &SearchConfig,
) -> Result<BoundaryHit> {
    locate_transition("first vault deposit", lo, hi, search, |h| vault_funded(ledger, vault, h)).await
}

/// `start, start + per_day, ...` and always `end`.
pub fn daily_heights(start: Height, end: Height, per_day: u64) -> Vec<Height> {
    if start > end {
        return Vec::new();
    }
    let step = per_day.max(1) as usize;
    let mut heights: Vec<Height> = (start..=end).step_by(step).collect();
    if heights.last() != Some(&end) {
        heights.push(end);
    }
    heights
}

/// First height whose reserve total is more than `threshold_pct` below the
/// previous total. Samples must be in height order.
pub fn first_drop(totals: &[(Height, U256)], threshold_pct: f64) -> Option<Height> {
    totals.windows(2).find_map(|pair| {
        let (_, prev) = pair[0];
        let (height, total) = pair[1];
        if prev.is_zero() || total >= prev {
            return None;
        }
        let drop_pct = crate::math::u256_to_f64(prev - total) / crate::math::u256_to_f64(prev) * 100.0;
        (drop_pct > threshold_pct).then_some(height)
    })
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct LiquidityDrop {
    pub height: Option<Height>,
    pub samples: usize,
    /// Heights whose reserves could not be read.
    pub skipped: Vec<Height>,
}

/// Sample the pair's reserves at `heights` and find the first sharp drop.
/// Unreadable heights are skipped.
pub async fn detect_liquidity_drop<C: LedgerClient + ?Sized>(
    ledger: &C,
    pair: Address,
    heights: &[Height],
    threshold_pct: f64,
    concurrency: usize,
) -> Result<LiquidityDrop> {
    let reads: Vec<(Height, Result<(U256, U256)>)> = stream::iter(heights.iter().copied())
        .map(|h| async move { (h, ledger.get_reserves(pair, h).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut totals = Vec::with_capacity(reads.len());
    let mut skipped = Vec::new();
    for (height, read) in reads {
        match read {
            Ok((r0, r1)) => {
                let total = r0
                    .checked_add(r1)
                    .ok_or_else(|| AnalysisError::PrecisionOverflow(format!("reserve sum at {}", height)))?;
                totals.push((height, total));
            }
            Err(e) => {
                log::warn!("reserves unavailable at {}: {}", height, e);
                skipped.push(height);
            }
        }
    }
    let height = first_drop(&totals, threshold_pct);
    if let Some(h) = height {
        log::info!("pair liquidity dropped more than {}% at {}", threshold_pct, h);
    }
    Ok(LiquidityDrop { height, samples: totals.len(), skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{FakePool, FakeVault, InMemoryLedger};

    const POOL: PoolId = [1u8; 32];
    const VAULT: Address = Address::repeat_byte(0xaa);
    const PAIR: Address = Address::repeat_byte(0xbb);

    fn search() -> SearchConfig {
        SearchConfig { monotonic_check_points: 3 }
    }

    #[test]
    fn daily_heights_include_the_end() {
        assert_eq!(daily_heights(100, 130, 10), vec![100, 110, 120, 130]);
        assert_eq!(daily_heights(100, 135, 10), vec![100, 110, 120, 130, 135]);
        assert_eq!(daily_heights(5, 5, 7200), vec![5]);
        assert!(daily_heights(6, 5, 7200).is_empty());
    }

    #[test]
    fn drop_needs_to_exceed_the_threshold() {
        let t = |h, v: u64| (h, U256::from(v));
        assert_eq!(first_drop(&[t(1, 100), t(2, 60), t(3, 20)], 50.0), Some(3));
        assert_eq!(first_drop(&[t(1, 100), t(2, 50)], 50.0), None);
        assert_eq!(first_drop(&[t(1, 0), t(2, 0), t(3, 100), t(4, 10)], 50.0), Some(4));
        assert_eq!(first_drop(&[], 50.0), None);
    }

    #[tokio::test]
    async fn finds_pool_creation_and_first_deposit() {
        let pool = FakePool::new(0, 60, 3000).unwrap().with_position(-60, 60, 1_000);
        let ledger = InMemoryLedger::new()
            .with_pool(POOL, 1_234, pool)
            .with_vault(VAULT, 0, FakeVault::default())
            .with_vault(
                VAULT,
                1_500,
                FakeVault { amount0: U256::zero(), amount1: U256::from(5u8), ranges: vec![(-60, 60)] },
            );

        let created = pool_creation_height(&ledger, POOL, 1_000, 2_000, &search()).await.unwrap();
        assert_eq!(created.height, 1_234);
        let deposit = first_deposit_height(&ledger, VAULT, 1_000, 2_000, &search()).await.unwrap();
        assert_eq!(deposit.height, 1_500);
        assert!(matches!(
            pool_creation_height(&ledger, POOL, 1_300, 2_000, &search()).await,
            Err(AnalysisError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn reserve_drop_is_located() {
        let ledger = InMemoryLedger::new()
            .with_reserves(PAIR, 0, U256::from(1_000_000u64), U256::from(1_000_000u64))
            .with_reserves(PAIR, 250, U256::from(100_000u64), U256::from(100_000u64));
        let heights = daily_heights(0, 500, 100);
        let drop = detect_liquidity_drop(&ledger, PAIR, &heights, 50.0, 3).await.unwrap();
        assert_eq!(drop.height, Some(300));
        assert_eq!(drop.samples, 6);
        assert!(drop.skipped.is_empty());
    }
}
