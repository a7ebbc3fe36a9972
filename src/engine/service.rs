// Study orchestration
// -------------------
//   1) migration signals: pool creation, first vault deposit, pair liquidity drop
//   2) daily sample heights from the migration on
//   3) slippage sampling of the pair and the pool, side by side
//   4) capital efficiency and breakeven
//   5) vault benchmarks, decomposition and range history
// A failed step is recorded in the report; steps that do not depend on it
// still run.

use ethers::types::Address;
use futures::{stream, StreamExt};

use crate::chain::ledger::LedgerClient;
use crate::config::{FetchConfig, QuoteMode, ScanConfig, SearchConfig};
use crate::engine::decomposition::{build_benchmarks, decompose, performance};
use crate::engine::efficiency::analyze;
use crate::engine::migration::{daily_heights, detect_liquidity_drop, first_deposit_height, pool_creation_height};
use crate::engine::rebalancing::{collect_range_history, detect_rebalances};
use crate::engine::sampler::{QuoteSource, Sampler, SamplingJob, SamplingReport};
use crate::error::{AnalysisError, Result};
use crate::models::{Direction, Height, PairDecimals, PoolId, SampleGap, VaultSnapshot};
use crate::report::{
    decomposition_rows, range_rows, slippage_rows, tvl_rows, GapManifest, JobOutcome, MigrationReport, StudyReport,
    VaultReport,
};

/// Days of pair reserves sampled on each side of the migration.
const DROP_WINDOW_DAYS: u64 = 30;
const SECONDS_PER_DAY: f64 = 86_400.0;

pub const PAIR_LABEL: &str = "constant_product";
pub const POOL_LABEL: &str = "concentrated_liquidity";

/// Everything one study run needs, already parsed.
#[derive(Clone, Debug)]
pub struct StudyConfig {
    pub pool_id: PoolId,
    pub pair: Address,
    pub pair_fee_bps: u32,
    pub vault: Option<Address>,
    pub decimals: PairDecimals,
    pub search_start: Height,
    pub search_end: Height,
    /// Defaults to the migration height.
    pub sample_start: Option<Height>,
    pub sample_end: Height,
    pub blocks_per_day: u64,
    pub trade_sizes: Vec<f64>,
    pub drop_threshold_pct: f64,
    pub quote_mode: QuoteMode,
    /// (lower, upper) ticks simulated pool trades stop at.
    pub price_limit_ticks: Option<(i32, i32)>,
    pub scan: ScanConfig,
    pub fetch: FetchConfig,
    pub search: SearchConfig,
}

pub async fn run_study<C: LedgerClient + ?Sized>(ledger: &C, cfg: &StudyConfig) -> Result<StudyReport> {
    log::info!(
        "study over [{}, {}], sampling to {}, {} trade sizes",
        cfg.search_start,
        cfg.search_end,
        cfg.sample_end,
        cfg.trade_sizes.len()
    );
    if cfg.trade_sizes.is_empty() {
        return Err(AnalysisError::InvalidInput("no trade sizes".into()));
    }

    let migration = detect_migration(ledger, cfg).await;
    let heights = sampling_start(cfg, &migration).map(|start| daily_heights(start, cfg.sample_end, cfg.blocks_per_day));
    let mut gaps = GapManifest::default();

    let (pair_report, pool_report) = match &heights {
        Ok(heights) => {
            let sampler = Sampler::new(ledger, cfg.fetch.clone(), cfg.scan.clone());
            let pair_job = job(cfg, PAIR_LABEL, QuoteSource::Pair { address: cfg.pair, fee_bps: cfg.pair_fee_bps }, heights);
            let pool_job = job(cfg, POOL_LABEL, QuoteSource::Pool { pool_id: cfg.pool_id }, heights);
            tokio::join!(sampler.run(&pair_job), sampler.run(&pool_job))
        }
        Err(e) => (Err(e.clone()), Err(e.clone())),
    };

    let mut slippage = Vec::new();
    let mut tvl = Vec::new();
    for report in [&pair_report, &pool_report].into_iter().flatten() {
        slippage.extend(slippage_rows(report));
        tvl.extend(tvl_rows(report));
        gaps.extend(&report.label, &report.gaps);
    }
    let efficiency = JobOutcome::from_result("capital efficiency", compare(&pair_report, &pool_report));

    let vault = match (cfg.vault, &heights) {
        (Some(vault), Ok(heights)) => {
            let outcome = vault_report(ledger, cfg, vault, heights).await.map(|(report, vault_gaps)| {
                gaps.extend("vault", &vault_gaps);
                report
            });
            Some(JobOutcome::from_result("vault analysis", outcome))
        }
        (Some(_), Err(e)) => Some(JobOutcome::from_result("vault analysis", Err(e.clone()))),
        (None, _) => None,
    };

    let report = StudyReport {
        generated_at: chrono::Utc::now(),
        migration,
        sample_heights: heights.unwrap_or_default(),
        slippage,
        tvl,
        efficiency,
        vault,
        gaps,
    };
    log::info!(
        "study done: {} slippage rows, {} gaps, failed jobs {:?}",
        report.slippage.len(),
        report.gaps.len(),
        report.failed_jobs()
    );
    Ok(report)
}

fn job(cfg: &StudyConfig, label: &str, source: QuoteSource, heights: &[Height]) -> SamplingJob {
    SamplingJob {
        label: label.to_string(),
        source,
        heights: heights.to_vec(),
        trade_sizes: cfg.trade_sizes.clone(),
        directions: Direction::BOTH.to_vec(),
        decimals: cfg.decimals,
        quote_mode: cfg.quote_mode,
        price_limit_ticks: cfg.price_limit_ticks,
    }
}

fn compare(
    pair: &Result<SamplingReport>,
    pool: &Result<SamplingReport>,
) -> Result<crate::engine::efficiency::EfficiencyReport> {
    match (pair, pool) {
        (Ok(a), Ok(b)) => Ok(analyze(&a.series, &b.series)),
        (Err(e), _) | (_, Err(e)) => Err(e.clone()),
    }
}

async fn detect_migration<C: LedgerClient + ?Sized>(ledger: &C, cfg: &StudyConfig) -> MigrationReport {
    // each search steps sequentially and the searches run one after another
    let pool_created = JobOutcome::from_result(
        "pool creation search",
        pool_creation_height(ledger, cfg.pool_id, cfg.search_start, cfg.search_end, &cfg.search).await,
    );
    let first_deposit = match cfg.vault {
        Some(vault) => Some(JobOutcome::from_result(
            "first deposit search",
            first_deposit_height(ledger, vault, cfg.search_start, cfg.search_end, &cfg.search).await,
        )),
        None => None,
    };

    let anchor = first_deposit
        .as_ref()
        .and_then(|o| o.done())
        .or_else(|| pool_created.done())
        .map(|hit| hit.height);
    let (lo, hi) = match anchor {
        Some(at) => {
            let span = DROP_WINDOW_DAYS * cfg.blocks_per_day;
            (at.saturating_sub(span).max(cfg.search_start), (at + span).min(cfg.search_end))
        }
        None => (cfg.search_start, cfg.search_end),
    };
    let liquidity_drop = JobOutcome::from_result(
        "pair liquidity drop",
        detect_liquidity_drop(
            ledger,
            cfg.pair,
            &daily_heights(lo, hi, cfg.blocks_per_day),
            cfg.drop_threshold_pct,
            cfg.fetch.concurrency,
        )
        .await,
    );

    MigrationReport { pool_created, first_deposit, liquidity_drop }
}

/// Configured start, else the first deposit, else the pool's creation.
fn sampling_start(cfg: &StudyConfig, migration: &MigrationReport) -> Result<Height> {
    cfg.sample_start
        .or_else(|| migration.first_deposit.as_ref().and_then(|o| o.done()).map(|h| h.height))
        .or_else(|| migration.pool_created.done().map(|h| h.height))
        .ok_or_else(|| AnalysisError::InvalidInput("no sampling start height: migration not located".into()))
}

struct VaultPoint {
    snapshot: VaultSnapshot,
    raw_price: f64,
    timestamp: Option<i64>,
}

async fn vault_point<C: LedgerClient + ?Sized>(
    ledger: &C,
    pool: PoolId,
    vault: Address,
    height: Height,
) -> Result<VaultPoint> {
    let (amount0, amount1) = ledger.get_vault_underlying(vault, height).await?;
    let pool_state = ledger.get_snapshot(pool, height).await?;
    let timestamp = ledger.get_timestamp(height).await.ok();
    Ok(VaultPoint {
        snapshot: VaultSnapshot { height, amount0, amount1 },
        raw_price: pool_state.spot_price(),
        timestamp,
    })
}

async fn vault_report<C: LedgerClient + ?Sized>(
    ledger: &C,
    cfg: &StudyConfig,
    vault: Address,
    heights: &[Height],
) -> Result<(VaultReport, Vec<SampleGap>)> {
    let reads: Vec<(Height, Result<VaultPoint>)> = stream::iter(heights.iter().copied())
        .map(|h| async move { (h, vault_point(ledger, cfg.pool_id, vault, h).await) })
        .buffered(cfg.fetch.concurrency.max(1))
        .collect()
        .await;

    let mut gaps = Vec::new();
    let mut snapshots = Vec::new();
    let mut prices = Vec::new();
    let mut timestamps = std::collections::BTreeMap::new();
    for (height, read) in reads {
        match read {
            Ok(point) if point.snapshot.amount0.is_zero() && point.snapshot.amount1.is_zero() => {
                log::debug!("vault empty at {}, skipped", height);
            }
            Ok(point) => {
                if let Some(ts) = point.timestamp {
                    timestamps.insert(height, ts);
                }
                prices.push((height, point.raw_price));
                snapshots.push(point.snapshot);
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                log::warn!("vault state unavailable at {}: {}", height, e);
                gaps.push(SampleGap::new(height, None, &e));
            }
        }
    }

    let series = build_benchmarks(&snapshots, &prices, cfg.decimals)?;
    let points = decompose(&series)?;

    let days = match (snapshots.first(), snapshots.last()) {
        (Some(first), Some(last)) => match (timestamps.get(&first.height), timestamps.get(&last.height)) {
            (Some(t0), Some(t1)) => (t1 - t0) as f64 / SECONDS_PER_DAY,
            _ => (last.height - first.height) as f64 / cfg.blocks_per_day.max(1) as f64,
        },
        _ => 0.0,
    };
    let performance = if days > 0.0 {
        match performance(&series, days) {
            Ok(summary) => Some(summary),
            Err(e) => {
                log::warn!("no performance summary: {}", e);
                None
            }
        }
    } else {
        None
    };

    let history = collect_range_history(ledger, cfg.pool_id, vault, heights, cfg.fetch.concurrency).await?;
    gaps.extend(history.gaps.iter().cloned());
    let rebalances = detect_rebalances(&history.samples)
        .into_iter()
        .map(|i| history.samples[i].height)
        .collect();
    let efficiencies: Vec<f64> = history.samples.iter().filter_map(|s| s.capital_efficiency).collect();
    let mean_capital_efficiency =
        (!efficiencies.is_empty()).then(|| efficiencies.iter().sum::<f64>() / efficiencies.len() as f64);

    Ok((
        VaultReport {
            decomposition: decomposition_rows(&points, &timestamps),
            performance,
            rebalances,
            mean_capital_efficiency,
            ranges: range_rows(&history.samples, &timestamps, cfg.decimals),
        },
        gaps,
    ))
}
