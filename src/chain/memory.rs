//! In-memory ledger for tests and offline runs.
//!
//! State is versioned by height: each `with_*` entry takes effect from its
//! height until the next entry for the same key. Failures can be injected
//! per height to exercise retry, gap and timeout handling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, U256};
use num_bigint::BigInt;
use num_traits::Zero;

use crate::chain::ledger::LedgerClient;
use crate::error::{AnalysisError, Result};
use crate::math::concentrated::ConcentratedState;
use crate::math::tick_math::{sqrt_ratio_at_tick, tick_position, usable_tick_bounds};
use crate::math::{bigint_to_u256, u256_to_bigint};
use crate::models::{Direction, Height, PoolId, PoolSnapshot, TickBitmapWord, TickLiquidity};

/// A concentrated-liquidity pool built from positions.
#[derive(Clone, Debug)]
pub struct FakePool {
    pub sqrt_price_x96: BigInt,
    pub active_tick: i32,
    pub fee_pips: u32,
    pub tick_spacing: i32,
    pub ticks: BTreeMap<i32, TickLiquidity>,
    active_liquidity_override: Option<BigInt>,
    /// Extra output the quoter pays on top of the swap, as a hook rebate would.
    quote_rebate_bps: u32,
}

impl FakePool {
    /// Pool priced exactly at `active_tick`.
    pub fn new(active_tick: i32, tick_spacing: i32, fee_pips: u32) -> Result<Self> {
        Ok(Self {
            sqrt_price_x96: sqrt_ratio_at_tick(active_tick)?,
            active_tick,
            fee_pips,
            tick_spacing,
            ticks: BTreeMap::new(),
            active_liquidity_override: None,
            quote_rebate_bps: 0,
        })
    }

    /// Add a position; both bounds must be multiples of the spacing.
    pub fn with_position(mut self, tick_lower: i32, tick_upper: i32, liquidity: u128) -> Self {
        let l = BigInt::from(liquidity);
        for (tick, net) in [(tick_lower, l.clone()), (tick_upper, -l.clone())] {
            let entry = self.ticks.entry(tick).or_insert_with(|| TickLiquidity {
                tick,
                liquidity_gross: BigInt::zero(),
                liquidity_net: BigInt::zero(),
            });
            entry.liquidity_gross += &l;
            entry.liquidity_net += net;
        }
        self
    }

    /// Report an active liquidity that disagrees with the positions.
    pub fn with_active_liquidity(mut self, liquidity: BigInt) -> Self {
        self.active_liquidity_override = Some(liquidity);
        self
    }

    /// Quotes pay `bps` on top of the swap output. Scanned state is unchanged.
    pub fn with_quote_rebate(mut self, bps: u32) -> Self {
        self.quote_rebate_bps = bps;
        self
    }

    pub fn active_liquidity(&self) -> BigInt {
        if let Some(l) = &self.active_liquidity_override {
            return l.clone();
        }
        self.ticks
            .range(..=self.active_tick)
            .map(|(_, t)| t.liquidity_net.clone())
            .sum()
    }

    fn bitmap_word(&self, word_index: i32, word_width: u32) -> U256 {
        let mut bits = U256::zero();
        for (tick, info) in &self.ticks {
            if info.liquidity_gross.is_zero() {
                continue;
            }
            let (word, bit) = tick_position(*tick, self.tick_spacing, word_width);
            if word == word_index {
                bits = bits | (U256::one() << bit as usize);
            }
        }
        bits
    }

    fn snapshot(&self, height: Height) -> PoolSnapshot {
        PoolSnapshot {
            height,
            sqrt_price_x96: self.sqrt_price_x96.clone(),
            active_tick: self.active_tick,
            active_liquidity: self.active_liquidity(),
            fee_pips: self.fee_pips,
            tick_spacing: self.tick_spacing,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct FakeVault {
    pub amount0: U256,
    pub amount1: U256,
    pub ranges: Vec<(i32, i32)>,
}

/// Scripted failure for every call at one height.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    /// The next `n` calls fail with a transient rpc error.
    Transient(u32),
    /// Every call reverts.
    Permanent,
    /// Calls never answer.
    Hang,
}

#[derive(Debug)]
pub struct InMemoryLedger {
    pools: HashMap<PoolId, Vec<(Height, FakePool)>>,
    pairs: HashMap<Address, Vec<(Height, (U256, U256))>>,
    vaults: HashMap<Address, Vec<(Height, FakeVault)>>,
    genesis_timestamp: i64,
    block_time_secs: i64,
    word_width: u32,
    latency: Option<Duration>,
    failures: Mutex<HashMap<Height, Failure>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            pools: HashMap::new(),
            pairs: HashMap::new(),
            vaults: HashMap::new(),
            genesis_timestamp: 1_700_000_000,
            block_time_secs: 12,
            word_width: 256,
            latency: None,
            failures: Mutex::new(HashMap::new()),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Pool state effective from `height` on.
    pub fn with_pool(mut self, pool: PoolId, height: Height, state: FakePool) -> Self {
        insert_versioned(self.pools.entry(pool).or_default(), height, state);
        self
    }

    pub fn with_reserves(mut self, pair: Address, height: Height, reserve0: U256, reserve1: U256) -> Self {
        insert_versioned(self.pairs.entry(pair).or_default(), height, (reserve0, reserve1));
        self
    }

    pub fn with_vault(mut self, vault: Address, height: Height, state: FakeVault) -> Self {
        insert_versioned(self.vaults.entry(vault).or_default(), height, state);
        self
    }

    pub fn with_word_width(mut self, word_width: u32) -> Self {
        self.word_width = word_width;
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_clock(mut self, genesis_timestamp: i64, block_time_secs: i64) -> Self {
        self.genesis_timestamp = genesis_timestamp;
        self.block_time_secs = block_time_secs;
        self
    }

    pub fn with_failure(self, height: Height, failure: Failure) -> Self {
        self.inject_failure(height, failure);
        self
    }

    pub fn inject_failure(&self, height: Height, failure: Failure) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(height, failure);
        }
    }

    /// Calls answered or attempted so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, height: Height) -> Result<InFlight<'_>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let guard = InFlight(&self.in_flight);

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let scripted = match self.failures.lock() {
            Ok(mut failures) => match failures.get_mut(&height) {
                Some(Failure::Transient(n)) if *n > 0 => {
                    *n -= 1;
                    Some(Failure::Transient(1))
                }
                Some(Failure::Transient(_)) => None,
                Some(other) => Some(*other),
                None => None,
            },
            Err(_) => None,
        };
        match scripted {
            Some(Failure::Transient(_)) => Err(AnalysisError::Rpc(format!("injected failure at {}", height))),
            Some(Failure::Permanent) => Err(AnalysisError::Revert(format!("injected revert at {}", height))),
            Some(Failure::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(AnalysisError::Rpc(format!("hung call at {}", height)))
            }
            None => Ok(guard),
        }
    }

    fn pool_at(&self, pool: &PoolId, height: Height) -> Result<&FakePool> {
        self.pools
            .get(pool)
            .and_then(|history| at_height(history, height))
            .ok_or(AnalysisError::NotInitialized { height })
    }
}

fn insert_versioned<T>(history: &mut Vec<(Height, T)>, height: Height, value: T) {
    history.retain(|(h, _)| *h != height);
    history.push((height, value));
    history.sort_by_key(|(h, _)| *h);
}

fn at_height<T>(history: &[(Height, T)], height: Height) -> Option<&T> {
    history.iter().rev().find(|(h, _)| *h <= height).map(|(_, v)| v)
}

#[async_trait]
impl LedgerClient for InMemoryLedger {
    async fn get_snapshot(&self, pool: PoolId, height: Height) -> Result<PoolSnapshot> {
        let _guard = self.enter(height).await?;
        Ok(self.pool_at(&pool, height)?.snapshot(height))
    }

    async fn get_bitmap_word(&self, pool: PoolId, word_index: i32, height: Height) -> Result<TickBitmapWord> {
        let _guard = self.enter(height).await?;
        let state = self.pool_at(&pool, height)?;
        Ok(TickBitmapWord {
            word_index,
            bits: state.bitmap_word(word_index, self.word_width),
        })
    }

    async fn get_tick_liquidity(&self, pool: PoolId, tick: i32, height: Height) -> Result<TickLiquidity> {
        let _guard = self.enter(height).await?;
        let state = self.pool_at(&pool, height)?;
        Ok(state.ticks.get(&tick).cloned().unwrap_or(TickLiquidity {
            tick,
            liquidity_gross: BigInt::zero(),
            liquidity_net: BigInt::zero(),
        }))
    }

    async fn quote(&self, pool: PoolId, amount_in: U256, direction: Direction, height: Height) -> Result<U256> {
        let _guard = self.enter(height).await?;
        let state = self.pool_at(&pool, height)?;
        let sim = ConcentratedState::new(
            state.sqrt_price_x96.clone(),
            state.active_tick,
            state.active_liquidity(),
            state.fee_pips,
            state.ticks.iter().map(|(t, info)| (*t, info.liquidity_net.clone())),
            usable_tick_bounds(state.tick_spacing),
        )?;
        match sim.swap(&u256_to_bigint(amount_in), direction, state.fee_pips) {
            Ok(outcome) => {
                let rebate = &outcome.amount_out * BigInt::from(state.quote_rebate_bps) / BigInt::from(10_000);
                bigint_to_u256(&(outcome.amount_out + rebate))
            }
            Err(AnalysisError::InsufficientLiquidity { .. }) => {
                Err(AnalysisError::Revert("not enough liquidity".into()))
            }
            Err(e) => Err(e),
        }
    }

    async fn get_reserves(&self, pair: Address, height: Height) -> Result<(U256, U256)> {
        let _guard = self.enter(height).await?;
        self.pairs
            .get(&pair)
            .and_then(|history| at_height(history, height))
            .copied()
            .ok_or(AnalysisError::NotInitialized { height })
    }

    async fn get_vault_underlying(&self, vault: Address, height: Height) -> Result<(U256, U256)> {
        let _guard = self.enter(height).await?;
        self.vaults
            .get(&vault)
            .and_then(|history| at_height(history, height))
            .map(|v| (v.amount0, v.amount1))
            .ok_or(AnalysisError::NotInitialized { height })
    }

    async fn get_vault_ranges(&self, vault: Address, height: Height) -> Result<Vec<(i32, i32)>> {
        let _guard = self.enter(height).await?;
        self.vaults
            .get(&vault)
            .and_then(|history| at_height(history, height))
            .map(|v| v.ranges.clone())
            .ok_or(AnalysisError::NotInitialized { height })
    }

    async fn get_timestamp(&self, height: Height) -> Result<i64> {
        let _guard = self.enter(height).await?;
        Ok(self.genesis_timestamp + height as i64 * self.block_time_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL: PoolId = [7u8; 32];

    fn pool() -> FakePool {
        FakePool::new(-30, 60, 3000)
            .unwrap()
            .with_position(-600, 600, 1_000_000)
            .with_position(-120, 0, 500_000)
    }

    #[tokio::test]
    async fn history_is_versioned_by_height() {
        let ledger = InMemoryLedger::new()
            .with_pool(POOL, 100, pool())
            .with_pool(POOL, 200, FakePool::new(60, 60, 500).unwrap().with_position(0, 120, 10));

        assert!(matches!(
            ledger.get_snapshot(POOL, 99).await,
            Err(AnalysisError::NotInitialized { height: 99 })
        ));
        let early = ledger.get_snapshot(POOL, 150).await.unwrap();
        assert_eq!(early.active_tick, -30);
        assert_eq!(early.active_liquidity, BigInt::from(1_500_000));
        let late = ledger.get_snapshot(POOL, 200).await.unwrap();
        assert_eq!(late.fee_pips, 500);
        assert_eq!(late.active_liquidity, BigInt::from(10));
    }

    #[tokio::test]
    async fn negative_ticks_land_in_negative_words() {
        let ledger = InMemoryLedger::new().with_pool(POOL, 1, pool());
        let below = ledger.get_bitmap_word(POOL, -1, 1).await.unwrap();
        // -600/60 = -10 -> bit 246, -120/60 = -2 -> bit 254
        assert_eq!(below.set_bits(256), vec![246, 254]);
        let above = ledger.get_bitmap_word(POOL, 0, 1).await.unwrap();
        assert_eq!(above.set_bits(256), vec![0, 10]);
    }

    #[tokio::test]
    async fn transient_failures_run_out() {
        let ledger = InMemoryLedger::new()
            .with_clock(1_000, 12)
            .with_failure(5, Failure::Transient(2));
        assert!(ledger.get_timestamp(5).await.unwrap_err().is_transient());
        assert!(ledger.get_timestamp(5).await.is_err());
        assert_eq!(ledger.get_timestamp(5).await.unwrap(), 1_060);
        assert_eq!(ledger.call_count(), 3);
    }

    #[tokio::test]
    async fn quote_reverts_past_available_liquidity() {
        let ledger = InMemoryLedger::new().with_pool(POOL, 1, pool());
        let small = ledger.quote(POOL, U256::from(100u64), Direction::Forward, 1).await.unwrap();
        assert!(small > U256::zero());
        assert!(matches!(
            ledger.quote(POOL, U256::from(10u64).pow(U256::from(12)), Direction::Forward, 1).await,
            Err(AnalysisError::Revert(_))
        ));
    }

    #[tokio::test]
    async fn rebate_only_touches_quotes() {
        let plain = InMemoryLedger::new().with_pool(POOL, 1, pool());
        let rebated = InMemoryLedger::new().with_pool(POOL, 1, pool().with_quote_rebate(100));
        let amount = U256::from(10_000u64);
        let base = plain.quote(POOL, amount, Direction::Reverse, 1).await.unwrap();
        let boosted = rebated.quote(POOL, amount, Direction::Reverse, 1).await.unwrap();
        assert_eq!(boosted, base + base / U256::from(100u8));
        assert_eq!(
            plain.get_snapshot(POOL, 1).await.unwrap(),
            rebated.get_snapshot(POOL, 1).await.unwrap()
        );
    }
}
