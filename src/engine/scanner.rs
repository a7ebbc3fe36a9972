// Tick bitmap scanner
// -------------------
// Rebuilds the liquidity distribution around the active tick at one height:
//   1) bitmap words intersecting [active - radius, active + radius], one batch
//   2) liquidityNet at every set bit inside the window, chunked batches with
//      bounded parallelism
//   3) ascending accumulation into ranges
// The accumulated liquidity at the active tick must equal the snapshot's active
// liquidity. Positions opened below the window are invisible to the scan, so a
// mismatch is retried once with twice the radius.

use std::collections::BTreeMap;

use futures::{stream, StreamExt};
use num_bigint::BigInt;
use num_traits::{Signed, Zero};

use crate::chain::ledger::{LedgerCall, LedgerClient, LedgerResponse};
use crate::config::ScanConfig;
use crate::error::{AnalysisError, Result};
use crate::math::tick_math::{tick_at_position, tick_position, usable_tick_bounds, MIN_TICK};
use crate::models::{LiquidityRange, PoolId, PoolSnapshot, TickLiquidity};

#[derive(Clone, Debug)]
pub struct ScanResult {
    pub ranges: Vec<LiquidityRange>,
    /// Window the ranges cover, inclusive.
    pub window: (i32, i32),
    pub radius_used: i32,
    pub words_fetched: usize,
    pub initialized_ticks: usize,
}

pub struct TickBitmapScanner<'a, C: ?Sized> {
    ledger: &'a C,
    config: ScanConfig,
}

impl<'a, C: LedgerClient + ?Sized> TickBitmapScanner<'a, C> {
    pub fn new(ledger: &'a C, config: ScanConfig) -> Self {
        Self { ledger, config }
    }

    /// Scan with the configured radius, doubling it once on a liquidity mismatch.
    pub async fn scan(&self, pool: PoolId, snapshot: &PoolSnapshot) -> Result<ScanResult> {
        let radius = self.config.radius_ticks;
        match self.scan_radius(pool, snapshot, radius).await {
            Err(AnalysisError::InconsistentLiquidity { scanned, expected, .. }) => {
                log::warn!(
                    "scan at {} found {} active liquidity, expected {}; retrying with radius {}",
                    snapshot.height,
                    scanned,
                    expected,
                    radius.saturating_mul(2)
                );
                self.scan_radius(pool, snapshot, radius.saturating_mul(2)).await
            }
            other => other,
        }
    }

    pub async fn scan_radius(&self, pool: PoolId, snapshot: &PoolSnapshot, radius: i32) -> Result<ScanResult> {
        let spacing = snapshot.tick_spacing;
        let width = self.config.word_width;
        if spacing <= 0 || width == 0 || width > 256 {
            return Err(AnalysisError::InvalidInput(format!(
                "tick spacing {} / word width {}",
                spacing, width
            )));
        }
        let height = snapshot.height;
        let window = scan_window(snapshot.active_tick, radius, spacing);

        // 1) bitmap words covering the window
        let (first_word, _) = tick_position(window.0, spacing, width);
        let (last_word, _) = tick_position(window.1, spacing, width);
        let word_calls: Vec<LedgerCall> = (first_word..=last_word)
            .map(|word_index| LedgerCall::BitmapWord { pool, word_index, height })
            .collect();
        let words_fetched = word_calls.len();
        let words = self
            .ledger
            .batch(word_calls)
            .await
            .into_iter()
            .map(|r| r.and_then(LedgerResponse::into_bitmap_word))
            .collect::<Result<Vec<_>>>()?;

        let ticks: Vec<i32> = words
            .iter()
            .flat_map(|w| {
                w.set_bits(width)
                    .into_iter()
                    .map(move |bit| tick_at_position(w.word_index, bit, spacing, width))
            })
            .filter(|t| (window.0 as i64..=window.1 as i64).contains(t))
            .map(|t| t as i32)
            .collect();
        log::debug!(
            "height {}: {} words, {} initialized ticks in [{}, {}]",
            height,
            words_fetched,
            ticks.len(),
            window.0,
            window.1
        );

        // 2) tick infos, chunked + bounded parallel
        let chunk = self.config.tickinfo_chunk.max(1);
        let batches: Vec<Vec<LedgerCall>> = ticks
            .chunks(chunk)
            .map(|c| c.iter().map(|&tick| LedgerCall::TickLiquidity { pool, tick, height }).collect())
            .collect();
        let fetched: Vec<Vec<Result<LedgerResponse>>> = stream::iter(batches)
            .map(|calls| self.ledger.batch(calls))
            .buffer_unordered(self.config.parallel_chunks.max(1))
            .collect()
            .await;
        let infos = fetched
            .into_iter()
            .flatten()
            .map(|r| r.and_then(LedgerResponse::into_tick_liquidity))
            .collect::<Result<Vec<_>>>()?;

        // 3) accumulate
        let ranges = reconstruct_ranges(window, spacing, &infos);
        verify_active_liquidity(&ranges, snapshot.active_tick, &snapshot.active_liquidity)?;

        Ok(ScanResult {
            window: ranges
                .first()
                .zip(ranges.last())
                .map(|(f, l)| (f.tick_lower, l.tick_upper))
                .unwrap_or(window),
            ranges,
            radius_used: radius,
            words_fetched,
            initialized_ticks: infos.iter().filter(|t| t.liquidity_gross.is_positive()).count(),
        })
    }
}

/// `[active - radius, active + radius]` clamped to the usable ticks, in i64 so
/// a huge radius near the domain edge cannot overflow.
pub fn scan_window(active_tick: i32, radius: i32, tick_spacing: i32) -> (i32, i32) {
    let (min_usable, max_usable) = usable_tick_bounds(tick_spacing);
    let radius = radius.max(0) as i64;
    let active = active_tick as i64;
    let lo = (active - radius).clamp(min_usable as i64, max_usable as i64);
    let hi = (active + radius).clamp(min_usable as i64, max_usable as i64);
    (lo as i32, hi.max(lo) as i32)
}

/// Partition `window` at the initialized ticks and accumulate deltas upward.
///
/// A delta sitting exactly on the lower window edge is the upper bound of an
/// extra band one spacing below, so every delta is some range's
/// `liquidity_net`.
pub fn reconstruct_ranges(window: (i32, i32), tick_spacing: i32, ticks: &[TickLiquidity]) -> Vec<LiquidityRange> {
    let deltas: BTreeMap<i32, BigInt> = ticks
        .iter()
        .filter(|t| t.liquidity_gross.is_positive() && (window.0..=window.1).contains(&t.tick))
        .map(|t| (t.tick, t.liquidity_net.clone()))
        .collect();

    let mut lower_edge = window.0;
    if deltas.contains_key(&window.0) {
        lower_edge = (window.0 as i64 - tick_spacing as i64).max(MIN_TICK as i64) as i32;
    }

    let mut bounds: Vec<i32> = Vec::with_capacity(deltas.len() + 2);
    bounds.push(lower_edge);
    bounds.extend(deltas.keys().copied().filter(|t| *t != lower_edge && *t != window.1));
    bounds.push(window.1);

    let mut running = BigInt::zero();
    let mut ranges = Vec::with_capacity(bounds.len());
    if lower_edge == window.0 && deltas.contains_key(&window.0) {
        // only at MIN_TICK: a zero-width band carrying the edge delta
        let net = deltas[&window.0].clone();
        ranges.push(LiquidityRange {
            tick_lower: window.0,
            tick_upper: window.0,
            liquidity_net: net.clone(),
            liquidity_gross: BigInt::zero(),
        });
        running += net;
    }
    for pair in bounds.windows(2) {
        let (a, b) = (pair[0], pair[1]);
        if a == b {
            continue;
        }
        let net = deltas.get(&b).cloned().unwrap_or_else(BigInt::zero);
        ranges.push(LiquidityRange {
            tick_lower: a,
            tick_upper: b,
            liquidity_net: net.clone(),
            liquidity_gross: running.clone(),
        });
        running += net;
    }
    ranges
}

/// Sum of `liquidity_net` over ranges ending at or below the active tick.
pub fn accumulated_at(ranges: &[LiquidityRange], active_tick: i32) -> BigInt {
    ranges
        .iter()
        .filter(|r| r.tick_upper <= active_tick)
        .map(|r| &r.liquidity_net)
        .sum()
}

pub fn verify_active_liquidity(ranges: &[LiquidityRange], active_tick: i32, expected: &BigInt) -> Result<()> {
    let scanned = accumulated_at(ranges, active_tick);
    if &scanned != expected {
        return Err(AnalysisError::InconsistentLiquidity {
            tick: active_tick,
            scanned,
            expected: expected.clone(),
        });
    }
    Ok(())
}
