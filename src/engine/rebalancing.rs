//! Vault range history: where the managed position sat over time, when it was
//! moved, and how concentrated it was relative to a full-range position.

use ethers::types::Address;
use futures::{stream, StreamExt};
use num_bigint::BigInt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::chain::ledger::LedgerClient;
use crate::error::Result;
use crate::math::position::{capital_efficiency, liquidity_for_amounts};
use crate::math::tick_math::{price_at_tick, sqrt_ratio_at_tick};
use crate::math::u256_to_bigint;
use crate::models::{Height, PoolId, SampleGap};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct RangeSample {
    pub height: Height,
    pub active_tick: i32,
    /// Raw spot price, currency1 per currency0.
    pub price: f64,
    pub active_liquidity: BigInt,
    pub ranges: Vec<(i32, i32)>,
    /// `ranges` as raw prices.
    pub price_ranges: Vec<(f64, f64)>,
    /// Liquidity the vault's holdings support across the span of its ranges.
    /// None when the price sits outside that span.
    pub position_liquidity: Option<BigInt>,
    /// Active liquidity over the full-range liquidity the vault's holdings
    /// would provide.
    pub capital_efficiency: Option<f64>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RangeHistory {
    pub samples: Vec<RangeSample>,
    pub gaps: Vec<SampleGap>,
}

async fn range_sample<C: LedgerClient + ?Sized>(
    ledger: &C,
    pool: PoolId,
    vault: Address,
    height: Height,
) -> Result<RangeSample> {
    let snapshot = ledger.get_snapshot(pool, height).await?;
    let ranges = ledger.get_vault_ranges(vault, height).await?;
    let (a0, a1) = ledger.get_vault_underlying(vault, height).await?;
    let (a0, a1) = (u256_to_bigint(a0), u256_to_bigint(a1));
    Ok(RangeSample {
        height,
        active_tick: snapshot.active_tick,
        price: snapshot.spot_price(),
        price_ranges: ranges_to_prices(&ranges)?,
        position_liquidity: position_liquidity(&snapshot.sqrt_price_x96, &ranges, &a0, &a1)?,
        capital_efficiency: capital_efficiency(&snapshot.active_liquidity, &a0, &a1),
        active_liquidity: snapshot.active_liquidity,
        ranges,
    })
}

fn position_liquidity(sqrt_p: &BigInt, ranges: &[(i32, i32)], amount0: &BigInt, amount1: &BigInt) -> Result<Option<BigInt>> {
    let lower = ranges.iter().map(|r| r.0).min();
    let upper = ranges.iter().map(|r| r.1).max();
    let (lower, upper) = match (lower, upper) {
        (Some(l), Some(u)) if l < u => (l, u),
        _ => return Ok(None),
    };
    let sa = sqrt_ratio_at_tick(lower)?;
    let sb = sqrt_ratio_at_tick(upper)?;
    if !(&sa < sqrt_p && sqrt_p < &sb) {
        return Ok(None);
    }
    liquidity_for_amounts(&sa, sqrt_p, &sb, amount0, amount1).map(Some)
}

/// Pool state and vault ranges at each height, in height order. Unreadable
/// heights are recorded as gaps.
pub async fn collect_range_history<C: LedgerClient + ?Sized>(
    ledger: &C,
    pool: PoolId,
    vault: Address,
    heights: &[Height],
    concurrency: usize,
) -> Result<RangeHistory> {
    let reads: Vec<(Height, Result<RangeSample>)> = stream::iter(heights.iter().copied())
        .map(|h| async move { (h, range_sample(ledger, pool, vault, h).await) })
        .buffered(concurrency.max(1))
        .collect()
        .await;

    let mut history = RangeHistory::default();
    for (height, read) in reads {
        match read {
            Ok(sample) => history.samples.push(sample),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("vault ranges unavailable at {}: {}", height, e);
                history.gaps.push(SampleGap::new(height, None, &e));
            }
        }
    }
    Ok(history)
}

/// Indices whose ranges differ from the previous sample's.
pub fn detect_rebalances(samples: &[RangeSample]) -> Vec<usize> {
    samples
        .windows(2)
        .enumerate()
        .filter(|(_, pair)| pair[0].ranges != pair[1].ranges)
        .map(|(i, _)| i + 1)
        .collect()
}

/// Tick ranges as raw price ranges, currency1 per currency0.
pub fn ranges_to_prices(ranges: &[(i32, i32)]) -> Result<Vec<(f64, f64)>> {
    ranges
        .iter()
        .map(|&(lower, upper)| Ok((price_at_tick(lower)?, price_at_tick(upper)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{Failure, FakePool, FakeVault, InMemoryLedger};
    use ethers::types::U256;
    use num_traits::ToPrimitive;

    const POOL: PoolId = [4u8; 32];
    const VAULT: Address = Address::repeat_byte(0x44);

    fn sample(height: Height, ranges: Vec<(i32, i32)>) -> RangeSample {
        RangeSample {
            height,
            active_tick: 0,
            price: 1.0,
            active_liquidity: BigInt::from(1),
            price_ranges: Vec::new(),
            position_liquidity: None,
            ranges,
            capital_efficiency: None,
        }
    }

    #[test]
    fn rebalances_are_range_changes() {
        let samples = vec![
            sample(1, vec![(-60, 60)]),
            sample(2, vec![(-60, 60)]),
            sample(3, vec![(-120, 0)]),
            sample(4, vec![(-120, 0), (0, 120)]),
            sample(5, vec![(-120, 0), (0, 120)]),
        ];
        assert_eq!(detect_rebalances(&samples), vec![2, 3]);
        assert!(detect_rebalances(&samples[..1]).is_empty());
    }

    #[test]
    fn tick_ranges_map_to_prices() {
        let prices = ranges_to_prices(&[(0, 6932)]).unwrap();
        assert!((prices[0].0 - 1.0).abs() < 1e-12);
        // 1.0001^6932 is just above 2
        assert!((prices[0].1 - 2.0).abs() < 1e-3);
        assert!(ranges_to_prices(&[(0, 900_000)]).is_err());
    }

    #[tokio::test]
    async fn history_records_gaps_and_efficiency() {
        let pool = FakePool::new(0, 60, 3000).unwrap().with_position(-60, 60, 1_000_000);
        let vault = FakeVault {
            amount0: U256::from(10_000u64),
            amount1: U256::from(10_000u64),
            ranges: vec![(-60, 60)],
        };
        let ledger = InMemoryLedger::new()
            .with_pool(POOL, 0, pool)
            .with_vault(VAULT, 0, vault.clone())
            .with_vault(VAULT, 30, FakeVault { ranges: vec![(-120, 120)], ..vault })
            .with_failure(20, Failure::Permanent);

        let history = collect_range_history(&ledger, POOL, VAULT, &[10, 20, 30, 40], 2).await.unwrap();
        let heights: Vec<Height> = history.samples.iter().map(|s| s.height).collect();
        assert_eq!(heights, vec![10, 30, 40]);
        assert_eq!(history.gaps.len(), 1);
        assert_eq!(detect_rebalances(&history.samples), vec![1]);
        // L = 1e6 over sqrt(1e4 * 1e4) = 1e4
        assert_eq!(history.samples[0].capital_efficiency, Some(100.0));

        let first = &history.samples[0];
        assert_eq!(first.price_ranges.len(), 1);
        assert!(first.price_ranges[0].0 < first.price && first.price < first.price_ranges[0].1);
        // 1e4 per side over +-30 bps of price: about 1e4 / 0.003
        let l = first.position_liquidity.as_ref().and_then(|l| l.to_f64()).unwrap();
        assert!(l > 3.3e6 && l < 3.4e6, "{}", l);
        // the wider range after the rebalance holds the same tokens more thinly
        let wider = history.samples[1].position_liquidity.as_ref().and_then(|l| l.to_f64()).unwrap();
        assert!(wider < l);
    }

    #[test]
    fn price_outside_the_ranges_has_no_position_liquidity() {
        let sqrt_p = sqrt_ratio_at_tick(500).unwrap();
        let amounts = (BigInt::from(10_000), BigInt::from(10_000));
        assert_eq!(position_liquidity(&sqrt_p, &[(-60, 60)], &amounts.0, &amounts.1).unwrap(), None);
        assert_eq!(position_liquidity(&sqrt_p, &[], &amounts.0, &amounts.1).unwrap(), None);
        assert!(position_liquidity(&sqrt_p, &[(0, 120), (480, 600)], &amounts.0, &amounts.1)
            .unwrap()
            .is_some());
    }
}
