// Output rows and the study report
// --------------------------------
// Tabular series for downstream export plus a manifest of every gap and failed
// sub-job, so a report always shows what is missing and why.

use std::collections::BTreeMap;

use chrono::{DateTime, TimeZone, Utc};
use num_bigint::BigInt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::engine::boundary::BoundaryHit;
use crate::engine::decomposition::{DecompositionPoint, PerformanceSummary};
use crate::engine::efficiency::EfficiencyReport;
use crate::engine::migration::LiquidityDrop;
use crate::engine::rebalancing::RangeSample;
use crate::engine::sampler::SamplingReport;
use crate::error::{AnalysisError, Result};
use crate::models::{Direction, Height, PairDecimals, SampleGap};

/// Result of one sub-job. A failure is recorded and the rest of the study
/// carries on.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum JobOutcome<T> {
    Done(T),
    Failed { kind: String, cause: String },
}

impl<T> JobOutcome<T> {
    pub fn from_result(job: &str, result: Result<T>) -> Self {
        match result {
            Ok(v) => JobOutcome::Done(v),
            Err(e) => {
                log::error!("{} failed: {}", job, e);
                JobOutcome::Failed { kind: e.kind().to_string(), cause: e.to_string() }
            }
        }
    }

    pub fn done(&self) -> Option<&T> {
        match self {
            JobOutcome::Done(v) => Some(v),
            JobOutcome::Failed { .. } => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.done().is_some()
    }
}

pub fn to_utc(timestamp: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0).single()
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SlippageRow {
    pub model: String,
    pub height: Height,
    pub timestamp: Option<DateTime<Utc>>,
    pub trade_size: f64,
    pub direction: Direction,
    pub gross_pct: f64,
    pub net_pct: f64,
    pub price_impact_pct: Option<f64>,
}

/// Every sample of a sampling job, ordered by height, then size, then direction.
pub fn slippage_rows(report: &SamplingReport) -> Vec<SlippageRow> {
    let mut rows: Vec<SlippageRow> = report
        .series
        .iter()
        .flat_map(|s| s.samples.iter())
        .map(|s| SlippageRow {
            model: report.label.clone(),
            height: s.height,
            timestamp: report.timestamps.get(&s.height).and_then(|ts| to_utc(*ts)),
            trade_size: s.trade_size,
            direction: s.direction,
            gross_pct: s.gross_pct,
            net_pct: s.net_pct,
            price_impact_pct: s.price_impact_pct,
        })
        .collect();
    rows.sort_by(|a, b| {
        a.height
            .cmp(&b.height)
            .then(a.trade_size.total_cmp(&b.trade_size))
            .then(a.direction.cmp(&b.direction))
    });
    rows
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct TvlRow {
    pub model: String,
    pub height: Height,
    pub timestamp: Option<DateTime<Utc>>,
    pub amount0: f64,
    pub amount1: f64,
    /// currency1 units.
    pub value: f64,
}

pub fn tvl_rows(report: &SamplingReport) -> Vec<TvlRow> {
    report
        .tvl
        .iter()
        .map(|p| TvlRow {
            model: report.label.clone(),
            height: p.height,
            timestamp: report.timestamps.get(&p.height).and_then(|ts| to_utc(*ts)),
            amount0: p.amount0,
            amount1: p.amount1,
            value: p.value,
        })
        .collect()
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct DecompositionRow {
    pub height: Height,
    pub timestamp: Option<DateTime<Utc>>,
    pub managed: f64,
    pub hold: f64,
    pub full_range: f64,
    pub price_return: f64,
    pub il_full_range: f64,
    pub management_premium: f64,
}

pub fn decomposition_rows(points: &[DecompositionPoint], timestamps: &BTreeMap<Height, i64>) -> Vec<DecompositionRow> {
    points
        .iter()
        .map(|p| DecompositionRow {
            height: p.height,
            timestamp: timestamps.get(&p.height).and_then(|ts| to_utc(*ts)),
            managed: p.managed,
            hold: p.hold,
            full_range: p.full_range,
            price_return: p.price_return,
            il_full_range: p.il_full_range,
            management_premium: p.management_premium,
        })
        .collect()
}

/// Where the vault's liquidity sat at one height. Prices are human units,
/// currency1 per currency0.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct RangeRow {
    pub height: Height,
    pub timestamp: Option<DateTime<Utc>>,
    pub price: f64,
    pub ranges: Vec<(i32, i32)>,
    pub price_ranges: Vec<(f64, f64)>,
    pub position_liquidity: Option<BigInt>,
    pub capital_efficiency: Option<f64>,
}

pub fn range_rows(samples: &[RangeSample], timestamps: &BTreeMap<Height, i64>, decimals: PairDecimals) -> Vec<RangeRow> {
    samples
        .iter()
        .map(|s| RangeRow {
            height: s.height,
            timestamp: timestamps.get(&s.height).and_then(|ts| to_utc(*ts)),
            price: decimals.human_price(s.price),
            ranges: s.ranges.clone(),
            price_ranges: s
                .price_ranges
                .iter()
                .map(|&(lo, hi)| (decimals.human_price(lo), decimals.human_price(hi)))
                .collect(),
            position_liquidity: s.position_liquidity.clone(),
            capital_efficiency: s.capital_efficiency,
        })
        .collect()
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct GapEntry {
    pub job: String,
    #[cfg_attr(feature = "serde", serde(flatten))]
    pub gap: SampleGap,
}

/// Unresolved samples across the whole study.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GapManifest {
    pub entries: Vec<GapEntry>,
}

impl GapManifest {
    pub fn extend(&mut self, job: &str, gaps: &[SampleGap]) {
        self.entries.extend(gaps.iter().map(|gap| GapEntry { job: job.to_string(), gap: gap.clone() }));
    }

    /// Gap counts per error kind.
    pub fn by_kind(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.entries {
            *counts.entry(entry.gap.kind.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct MigrationReport {
    pub pool_created: JobOutcome<BoundaryHit>,
    pub first_deposit: Option<JobOutcome<BoundaryHit>>,
    pub liquidity_drop: JobOutcome<LiquidityDrop>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct VaultReport {
    pub decomposition: Vec<DecompositionRow>,
    pub performance: Option<PerformanceSummary>,
    /// Heights where the vault's ranges changed.
    pub rebalances: Vec<Height>,
    pub mean_capital_efficiency: Option<f64>,
    pub ranges: Vec<RangeRow>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct StudyReport {
    pub generated_at: DateTime<Utc>,
    pub migration: MigrationReport,
    pub sample_heights: Vec<Height>,
    pub slippage: Vec<SlippageRow>,
    pub tvl: Vec<TvlRow>,
    pub efficiency: JobOutcome<EfficiencyReport>,
    pub vault: Option<JobOutcome<VaultReport>>,
    pub gaps: GapManifest,
}

impl StudyReport {
    pub fn failed_jobs(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.migration.pool_created.is_done() {
            failed.push("pool_created");
        }
        if matches!(self.migration.first_deposit, Some(JobOutcome::Failed { .. })) {
            failed.push("first_deposit");
        }
        if !self.migration.liquidity_drop.is_done() {
            failed.push("liquidity_drop");
        }
        if !self.efficiency.is_done() {
            failed.push("efficiency");
        }
        if matches!(self.vault, Some(JobOutcome::Failed { .. })) {
            failed.push("vault");
        }
        failed
    }
}

/// Fails with `InvalidInput` when the job never ran.
pub fn require<'a, T>(what: &str, outcome: &'a JobOutcome<T>) -> Result<&'a T> {
    outcome
        .done()
        .ok_or_else(|| AnalysisError::InvalidInput(format!("{} is unavailable", what)))
}
