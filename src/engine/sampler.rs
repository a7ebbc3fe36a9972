// Slippage sampling over heights
// ------------------------------
// Every (height, trade size, direction) sample is independent. Heights are worked
// through a bounded `buffer_unordered` pool; results arrive in completion order
// and are sorted by height before any series is built.
//
// Each height also records the tokens locked in the source: reserves for the
// pair, the scanned ranges valued at spot for the pool (not in ledger-quote
// mode, which skips the scan).
//
// Failure policy:
//   - a sample that cannot be produced becomes a gap with its cause
//   - PrecisionOverflow aborts the job
//   - once gaps exceed `max_gap_fraction` of the planned samples the job aborts

use std::collections::BTreeMap;

use ethers::types::Address;
use futures::{stream, StreamExt};
use num_bigint::BigInt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::chain::ledger::LedgerClient;
use crate::config::{FetchConfig, QuoteMode, ScanConfig};
use crate::engine::scanner::TickBitmapScanner;
use crate::error::{AnalysisError, Result};
use crate::math::concentrated::{execution_shortfall, ConcentratedState};
use crate::math::constant_product::ConstantProductState;
use crate::math::model::{gross_from_net, AmmModel};
use crate::math::position::total_value_locked;
use crate::math::tick_math::sqrt_ratio_at_tick;
use crate::math::u256_to_bigint;
use crate::models::{
    Direction, Height, PairDecimals, PoolId, PoolSnapshot, SampleGap, SeriesKey, SlippageSample, SlippageSeries,
    TvlPoint,
};

/// Where a job reads its pricing state from.
#[derive(Clone, Debug, PartialEq)]
pub enum QuoteSource {
    /// Constant-product pair and its fee.
    Pair { address: Address, fee_bps: u32 },
    /// Concentrated-liquidity pool; the fee comes from each snapshot.
    Pool { pool_id: PoolId },
}

#[derive(Clone, Debug)]
pub struct SamplingJob {
    pub label: String,
    pub source: QuoteSource,
    pub heights: Vec<Height>,
    /// Notional sizes in currency1 units.
    pub trade_sizes: Vec<f64>,
    pub directions: Vec<Direction>,
    pub decimals: PairDecimals,
    pub quote_mode: QuoteMode,
    /// (lower, upper) ticks a simulated pool trade may not cross.
    pub price_limit_ticks: Option<(i32, i32)>,
}

impl SamplingJob {
    pub fn keys(&self) -> Vec<SeriesKey> {
        self.trade_sizes
            .iter()
            .flat_map(|&trade_size| {
                self.directions
                    .iter()
                    .map(move |&direction| SeriesKey { trade_size, direction })
            })
            .collect()
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default)]
pub struct SamplingReport {
    pub label: String,
    /// One series per key, in job order.
    pub series: Vec<SlippageSeries>,
    pub gaps: Vec<SampleGap>,
    pub timestamps: BTreeMap<Height, i64>,
    /// Height-ordered.
    pub tvl: Vec<TvlPoint>,
    pub planned: usize,
}

impl SamplingReport {
    pub fn series_for(&self, key: &SeriesKey) -> Option<&SlippageSeries> {
        self.series
            .iter()
            .find(|s| s.key.trade_size == key.trade_size && s.key.direction == key.direction)
    }

    pub fn sample_count(&self) -> usize {
        self.series.iter().map(|s| s.samples.len()).sum()
    }
}

struct HeightOutcome {
    height: Height,
    timestamp: Option<i64>,
    tvl: Option<TvlPoint>,
    samples: Vec<SlippageSample>,
    gaps: Vec<SampleGap>,
}

enum Pricer {
    Model(AmmModel),
    Quoter { pool_id: PoolId, snapshot: PoolSnapshot },
}

struct Priced {
    pricer: Pricer,
    /// Raw (amount0, amount1) locked, when known.
    locked: Option<(BigInt, BigInt)>,
}

pub struct Sampler<'a, C: ?Sized> {
    ledger: &'a C,
    fetch: FetchConfig,
    scan: ScanConfig,
}

impl<'a, C: LedgerClient + ?Sized> Sampler<'a, C> {
    pub fn new(ledger: &'a C, fetch: FetchConfig, scan: ScanConfig) -> Self {
        Self { ledger, fetch, scan }
    }

    pub async fn run(&self, job: &SamplingJob) -> Result<SamplingReport> {
        let mut heights = job.heights.clone();
        heights.sort_unstable();
        heights.dedup();
        let keys = job.keys();
        let planned = heights.len() * keys.len();
        let gap_budget = self.fetch.max_gap_fraction * planned as f64;
        log::info!(
            "{}: sampling {} heights x {} keys ({} samples)",
            job.label,
            heights.len(),
            keys.len(),
            planned
        );

        let mut pending = stream::iter(heights.iter().copied())
            .map(|height| self.sample_height(job, &keys, height))
            .buffer_unordered(self.fetch.concurrency.max(1));

        let mut outcomes = Vec::with_capacity(heights.len());
        let mut gap_count = 0usize;
        while let Some(outcome) = pending.next().await {
            let outcome = outcome.map_err(|e| {
                log::error!("{}: aborted: {}", job.label, e);
                e
            })?;
            gap_count += outcome.gaps.len();
            if gap_count as f64 > gap_budget {
                log::error!("{}: {} gaps out of {} planned samples, aborting", job.label, gap_count, planned);
                return Err(AnalysisError::TooManyGaps {
                    gaps: gap_count,
                    samples: planned,
                    limit: self.fetch.max_gap_fraction,
                });
            }
            outcomes.push(outcome);
        }

        // completion order is arbitrary
        outcomes.sort_by_key(|o| o.height);

        let mut report = SamplingReport {
            label: job.label.clone(),
            series: keys.iter().map(|k| SlippageSeries::new(*k)).collect(),
            planned,
            ..Default::default()
        };
        for outcome in outcomes {
            if let Some(ts) = outcome.timestamp {
                report.timestamps.insert(outcome.height, ts);
            }
            report.tvl.extend(outcome.tvl);
            for sample in outcome.samples {
                let key = SeriesKey { trade_size: sample.trade_size, direction: sample.direction };
                if let Some(series) = report.series.iter_mut().find(|s| s.key == key) {
                    series.push(sample)?;
                }
            }
            report.gaps.extend(outcome.gaps);
        }
        log::info!(
            "{}: {} samples, {} gaps",
            job.label,
            report.sample_count(),
            report.gaps.len()
        );
        Ok(report)
    }

    async fn sample_height(&self, job: &SamplingJob, keys: &[SeriesKey], height: Height) -> Result<HeightOutcome> {
        let mut outcome = HeightOutcome {
            height,
            timestamp: None,
            tvl: None,
            samples: Vec::with_capacity(keys.len()),
            gaps: Vec::new(),
        };
        match self.ledger.get_timestamp(height).await {
            Ok(ts) => outcome.timestamp = Some(ts),
            Err(e) => log::warn!("{}: no timestamp for {}: {}", job.label, height, e),
        }

        let Priced { pricer, locked } = match self.pricer(job, height).await {
            Ok(p) => p,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("{}: no state at {}: {}", job.label, height, e);
                outcome
                    .gaps
                    .extend(keys.iter().map(|k| SampleGap::new(height, Some(*k), &e)));
                return Ok(outcome);
            }
        };
        if let Some((raw0, raw1)) = locked {
            let spot = match &pricer {
                Pricer::Model(model) => model.spot_price(),
                Pricer::Quoter { snapshot, .. } => snapshot.spot_price(),
            };
            outcome.tvl = Some(job.decimals.tvl_point(height, &raw0, &raw1, spot));
        }

        for key in keys {
            match self.sample_one(job, &pricer, height, *key).await {
                Ok(sample) => outcome.samples.push(sample),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    log::warn!(
                        "{}: gap at {} for {} {:?}: {}",
                        job.label,
                        height,
                        key.trade_size,
                        key.direction,
                        e
                    );
                    outcome.gaps.push(SampleGap::new(height, Some(*key), &e));
                }
            }
        }
        Ok(outcome)
    }

    async fn pricer(&self, job: &SamplingJob, height: Height) -> Result<Priced> {
        match &job.source {
            QuoteSource::Pair { address, fee_bps } => {
                let (r0, r1) = self.ledger.get_reserves(*address, height).await?;
                let state = ConstantProductState::new(r0, r1, *fee_bps)?;
                Ok(Priced {
                    pricer: Pricer::Model(AmmModel::ConstantProduct(state)),
                    locked: Some((u256_to_bigint(r0), u256_to_bigint(r1))),
                })
            }
            QuoteSource::Pool { pool_id } => {
                let snapshot = self.ledger.get_snapshot(*pool_id, height).await?;
                if job.quote_mode == QuoteMode::Ledger {
                    return Ok(Priced { pricer: Pricer::Quoter { pool_id: *pool_id, snapshot }, locked: None });
                }
                let scan = TickBitmapScanner::new(self.ledger, self.scan.clone())
                    .scan(*pool_id, &snapshot)
                    .await?;
                let mut state = ConcentratedState::from_scan(&snapshot, &scan.ranges)?;
                if let Some((lower, upper)) = job.price_limit_ticks {
                    state = state.with_price_limits(sqrt_ratio_at_tick(lower)?, sqrt_ratio_at_tick(upper)?);
                }
                let locked = match total_value_locked(&snapshot, &scan.ranges) {
                    Ok(amounts) => Some(amounts),
                    Err(e) => {
                        log::warn!("{}: no tvl at {}: {}", job.label, height, e);
                        None
                    }
                };
                Ok(Priced { pricer: Pricer::Model(AmmModel::ConcentratedLiquidity(state)), locked })
            }
        }
    }

    async fn sample_one(&self, job: &SamplingJob, pricer: &Pricer, height: Height, key: SeriesKey) -> Result<SlippageSample> {
        let (gross_pct, net_pct, price_impact_pct) = match pricer {
            Pricer::Model(model) => {
                let amount_in = job.decimals.amount_in_for(key.trade_size, key.direction, model.spot_price())?;
                let quote = model.quote(amount_in, key.direction)?;
                (quote.gross_pct, quote.net_pct, Some(quote.price_impact_pct))
            }
            Pricer::Quoter { pool_id, snapshot } => {
                let amount_in = job
                    .decimals
                    .amount_in_for(key.trade_size, key.direction, snapshot.spot_price())?;
                let amount_out = self.ledger.quote(*pool_id, amount_in, key.direction, height).await?;
                // the quoter's output already has the fee taken out; beating
                // spot is a gap, not a negative cost
                let net_pct = execution_shortfall(
                    &snapshot.sqrt_price_x96,
                    &u256_to_bigint(amount_in),
                    &u256_to_bigint(amount_out),
                    key.direction,
                )? * 100.0;
                (gross_from_net(net_pct, snapshot.fee_rate_bps()), net_pct, None)
            }
        };
        Ok(SlippageSample {
            height,
            trade_size: key.trade_size,
            direction: key.direction,
            gross_pct,
            net_pct,
            price_impact_pct,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::memory::{Failure, FakePool, InMemoryLedger};
    use ethers::types::U256;
    use std::time::Duration;

    const PAIR: Address = Address::repeat_byte(0x22);
    const POOL: PoolId = [9u8; 32];
    const RAW: PairDecimals = PairDecimals { decimals0: 0, decimals1: 0 };

    fn fetch(max_gap_fraction: f64) -> FetchConfig {
        FetchConfig {
            concurrency: 4,
            request_timeout: Duration::from_secs(1),
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
            max_gap_fraction,
        }
    }

    fn pair_job(heights: Vec<Height>) -> SamplingJob {
        SamplingJob {
            label: "v2".into(),
            source: QuoteSource::Pair { address: PAIR, fee_bps: 30 },
            heights,
            trade_sizes: vec![1_000.0, 10_000.0],
            directions: Direction::BOTH.to_vec(),
            decimals: RAW,
            quote_mode: QuoteMode::Simulated,
            price_limit_ticks: None,
        }
    }

    fn reserves(ledger: InMemoryLedger, height: Height) -> InMemoryLedger {
        ledger.with_reserves(PAIR, height, U256::from(1_000_000u64), U256::from(1_000_000u64))
    }

    #[tokio::test]
    async fn series_come_back_in_height_order() {
        let ledger = reserves(InMemoryLedger::new().with_latency(Duration::from_millis(2)), 0);
        let sampler = Sampler::new(&ledger, fetch(0.0), ScanConfig::default());
        let report = sampler.run(&pair_job(vec![50, 10, 40, 20, 30, 10])).await.unwrap();

        assert_eq!(report.planned, 20);
        assert_eq!(report.series.len(), 4);
        assert!(report.gaps.is_empty());
        for series in &report.series {
            let heights: Vec<Height> = series.samples.iter().map(|s| s.height).collect();
            assert_eq!(heights, vec![10, 20, 30, 40, 50]);
        }
        let key = SeriesKey { trade_size: 10_000.0, direction: Direction::Forward };
        let sample = &report.series_for(&key).unwrap().samples[0];
        assert!((sample.gross_pct - 0.990099).abs() < 1e-4, "{}", sample.gross_pct);
        assert!((sample.net_pct - sample.gross_pct - 0.30).abs() < 1e-12);
        assert_eq!(report.timestamps.len(), 5);
        assert!(sample.price_impact_pct.unwrap() > sample.gross_pct);

        let tvl: Vec<Height> = report.tvl.iter().map(|p| p.height).collect();
        assert_eq!(tvl, vec![10, 20, 30, 40, 50]);
        // 1e6 of each side at a spot of 1
        assert!((report.tvl[0].value - 2_000_000.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn failed_heights_become_gaps() {
        let ledger = reserves(InMemoryLedger::new(), 0).with_failure(30, Failure::Permanent);
        let sampler = Sampler::new(&ledger, fetch(0.25), ScanConfig::default());
        let report = sampler.run(&pair_job(vec![10, 20, 30, 40])).await.unwrap();

        assert_eq!(report.gaps.len(), 4);
        assert!(report.gaps.iter().all(|g| g.height == 30 && g.kind == "revert"));
        assert_eq!(report.sample_count(), 12);
    }

    #[tokio::test]
    async fn too_many_gaps_abort_the_job() {
        let ledger = reserves(InMemoryLedger::new(), 0)
            .with_failure(30, Failure::Permanent)
            .with_failure(40, Failure::Permanent);
        let sampler = Sampler::new(&ledger, fetch(0.25), ScanConfig::default());
        assert!(matches!(
            sampler.run(&pair_job(vec![10, 20, 30, 40])).await,
            Err(AnalysisError::TooManyGaps { samples: 16, .. })
        ));
    }

    #[tokio::test]
    async fn missing_pair_is_a_gap_not_an_abort() {
        let ledger = reserves(InMemoryLedger::new(), 20);
        let sampler = Sampler::new(&ledger, fetch(0.5), ScanConfig::default());
        let report = sampler.run(&pair_job(vec![10, 20])).await.unwrap();
        assert!(report.gaps.iter().all(|g| g.kind == "not_initialized"));
        assert_eq!(report.gaps.len(), 4);
    }

    #[tokio::test]
    async fn overflow_is_fatal() {
        let huge = U256::MAX / 4;
        let ledger = InMemoryLedger::new().with_reserves(PAIR, 0, huge, huge);
        let sampler = Sampler::new(&ledger, fetch(1.0), ScanConfig::default());
        assert!(matches!(
            sampler.run(&pair_job(vec![1, 2])).await,
            Err(AnalysisError::PrecisionOverflow(_))
        ));
    }

    fn pool_job(mode: QuoteMode) -> SamplingJob {
        SamplingJob {
            label: "v4".into(),
            source: QuoteSource::Pool { pool_id: POOL },
            heights: vec![5, 6],
            trade_sizes: vec![1_000.0],
            directions: Direction::BOTH.to_vec(),
            decimals: PairDecimals { decimals0: 18, decimals1: 18 },
            quote_mode: mode,
            price_limit_ticks: None,
        }
    }

    fn deep_pool() -> FakePool {
        FakePool::new(0, 60, 3000)
            .unwrap()
            .with_position(-6_000, 6_000, 10u128.pow(24))
            .with_position(-60, 60, 4 * 10u128.pow(24))
    }

    #[tokio::test]
    async fn pool_samples_from_simulation_and_quoter_agree() {
        let ledger = InMemoryLedger::new().with_pool(POOL, 0, deep_pool());
        let sampler = Sampler::new(&ledger, fetch(0.0), ScanConfig::default());
        let simulated = sampler.run(&pool_job(QuoteMode::Simulated)).await.unwrap();
        let quoted = sampler.run(&pool_job(QuoteMode::Ledger)).await.unwrap();

        for (a, b) in simulated.series.iter().zip(&quoted.series) {
            for (x, y) in a.samples.iter().zip(&b.samples) {
                assert!(x.gross_pct >= 0.0 && y.gross_pct >= 0.0);
                // same traversal, fee applied to input vs added to the shortfall
                assert!((x.net_pct - y.net_pct).abs() < 1e-3, "{} vs {}", x.net_pct, y.net_pct);
            }
        }
        assert_eq!(simulated.sample_count(), 4);
        assert_eq!(quoted.sample_count(), 4);

        let impact = |r: &SamplingReport| r.series.iter().flat_map(|s| &s.samples).map(|s| s.price_impact_pct).collect::<Vec<_>>();
        assert!(impact(&simulated).iter().all(|p| p.is_some()));
        assert!(impact(&quoted).iter().all(|p| p.is_none()));
        // the quoter path never scans, so it has nothing to sum
        assert_eq!(simulated.tvl.len(), 2);
        assert!(simulated.tvl[0].amount0 > 0.0 && simulated.tvl[0].amount1 > 0.0);
        assert!(quoted.tvl.is_empty());
    }

    #[tokio::test]
    async fn quote_better_than_spot_is_a_gap() {
        // a 1% rebate beats the 0.3% fee at this depth
        let ledger = InMemoryLedger::new().with_pool(POOL, 0, deep_pool().with_quote_rebate(100));
        let report = Sampler::new(&ledger, fetch(1.0), ScanConfig::default())
            .run(&pool_job(QuoteMode::Ledger))
            .await
            .unwrap();
        assert_eq!(report.sample_count(), 0);
        assert_eq!(report.gaps.len(), 4);
        assert!(report.gaps.iter().all(|g| g.kind == "quote_above_spot"));

        // and counts against the gap limit like any other gap
        let strict = Sampler::new(&ledger, fetch(0.0), ScanConfig::default());
        assert!(matches!(
            strict.run(&pool_job(QuoteMode::Ledger)).await,
            Err(AnalysisError::TooManyGaps { .. })
        ));
    }

    #[tokio::test]
    async fn price_limit_turns_large_trades_into_gaps() {
        let ledger = InMemoryLedger::new().with_pool(POOL, 0, deep_pool());
        let sampler = Sampler::new(&ledger, fetch(1.0), ScanConfig::default());

        let wide = SamplingJob { price_limit_ticks: Some((-30, 30)), ..pool_job(QuoteMode::Simulated) };
        assert_eq!(sampler.run(&wide).await.unwrap().sample_count(), 4);

        // 1e21 in moves the price a few ticks
        let tight = SamplingJob { price_limit_ticks: Some((-1, 1)), ..pool_job(QuoteMode::Simulated) };
        let report = sampler.run(&tight).await.unwrap();
        assert_eq!(report.sample_count(), 0);
        assert!(report.gaps.iter().all(|g| g.kind == "insufficient_liquidity"));
    }
}
