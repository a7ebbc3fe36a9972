// Return decomposition against passive benchmarks
// -----------------------------------------------
// Three aligned value series in currency1 units:
//   managed     vault holdings at current price
//   hold        the initial holdings, never traded
//   full range  the hold value scaled by the full-range IL factor 2√r / (1 + r),
//               r = p(t) / p(0)
// and the additive split
//   managed(t) = hold(0) + price_return + il_full_range + management_premium
// which is checked at every point.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::math::u256_to_f64;
use crate::models::{Height, PairDecimals, VaultSnapshot};

const IDENTITY_TOLERANCE: f64 = 1e-9;
const DAYS_PER_YEAR: f64 = 365.0;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct ValuePoint {
    pub height: Height,
    /// Human price, currency1 per currency0.
    pub price: f64,
    pub managed: f64,
    pub hold: f64,
    pub full_range: f64,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BenchmarkSeries {
    pub points: Vec<ValuePoint>,
}

impl BenchmarkSeries {
    pub fn managed(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.managed).collect()
    }

    pub fn hold(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.hold).collect()
    }

    pub fn full_range(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.full_range).collect()
    }
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct DecompositionPoint {
    pub height: Height,
    pub managed: f64,
    pub hold: f64,
    pub full_range: f64,
    pub price_return: f64,
    pub il_full_range: f64,
    pub management_premium: f64,
}

/// Value of a full-range position relative to holding, `2√r / (1 + r)`.
#[inline]
pub fn il_factor(price_ratio: f64) -> f64 {
    2.0 * price_ratio.sqrt() / (1.0 + price_ratio)
}

#[inline]
pub fn full_range_value(hold_value: f64, price_ratio: f64) -> f64 {
    hold_value * il_factor(price_ratio)
}

/// Managed, hold and full-range values from vault holdings and raw prices
/// (currency1 raw per currency0 raw) sampled at the same heights.
pub fn build_benchmarks(
    vaults: &[VaultSnapshot],
    raw_prices: &[(Height, f64)],
    decimals: PairDecimals,
) -> Result<BenchmarkSeries> {
    if vaults.len() != raw_prices.len() {
        return Err(AnalysisError::InvalidInput(format!(
            "{} vault snapshots vs {} prices",
            vaults.len(),
            raw_prices.len()
        )));
    }
    let scale0 = 10f64.powi(decimals.decimals0 as i32);
    let scale1 = 10f64.powi(decimals.decimals1 as i32);
    let human = |v: &VaultSnapshot| (u256_to_f64(v.amount0) / scale0, u256_to_f64(v.amount1) / scale1);

    let (first, first_price) = match (vaults.first(), raw_prices.first()) {
        (Some(v), Some((_, p))) => (v, decimals.human_price(*p)),
        _ => return Ok(BenchmarkSeries::default()),
    };
    if !(first_price.is_finite() && first_price > 0.0) {
        return Err(AnalysisError::InvalidInput(format!("initial price {}", first_price)));
    }
    let (hold0, hold1) = human(first);

    let mut points = Vec::with_capacity(vaults.len());
    for (vault, (height, raw)) in vaults.iter().zip(raw_prices) {
        if vault.height != *height {
            return Err(AnalysisError::InvalidInput(format!(
                "vault snapshot at {} paired with price at {}",
                vault.height, height
            )));
        }
        let price = decimals.human_price(*raw);
        if !(price.is_finite() && price > 0.0) {
            return Err(AnalysisError::InvalidInput(format!("price {} at {}", price, height)));
        }
        let (a0, a1) = human(vault);
        let hold = hold0 * price + hold1;
        points.push(ValuePoint {
            height: *height,
            price,
            managed: a0 * price + a1,
            hold,
            full_range: full_range_value(hold, price / first_price),
        });
    }
    Ok(BenchmarkSeries { points })
}

/// Consistency assertion: `|managed - (hold0 + price_return + il + premium)|`
/// within tolerance.
///
/// The terms are derived from `managed` itself, so this only catches float
/// drift and bookkeeping slips in [`decompose`], not wrong vault readings.
pub fn verify_identity(index: usize, hold0: f64, point: &DecompositionPoint) -> Result<()> {
    let rebuilt = hold0 + point.price_return + point.il_full_range + point.management_premium;
    let drift = (point.managed - rebuilt).abs();
    if drift > IDENTITY_TOLERANCE * point.managed.abs().max(1.0) {
        return Err(AnalysisError::DecompositionDrift { index, drift });
    }
    Ok(())
}

pub fn decompose(series: &BenchmarkSeries) -> Result<Vec<DecompositionPoint>> {
    let hold0 = match series.points.first() {
        Some(p) => p.hold,
        None => return Ok(Vec::new()),
    };
    series
        .points
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let point = DecompositionPoint {
                height: p.height,
                managed: p.managed,
                hold: p.hold,
                full_range: p.full_range,
                price_return: p.hold - hold0,
                il_full_range: p.full_range - p.hold,
                management_premium: p.managed - p.full_range,
            };
            verify_identity(i, hold0, &point)?;
            Ok(point)
        })
        .collect()
}

/// `(final / initial)^(365 / days) - 1`, as a fraction.
pub fn annualized_return(initial: f64, final_value: f64, days: f64) -> Result<f64> {
    if !(initial > 0.0 && days > 0.0) || !final_value.is_finite() {
        return Err(AnalysisError::InvalidInput(format!(
            "annualizing {} -> {} over {} days",
            initial, final_value, days
        )));
    }
    Ok((final_value / initial).powf(DAYS_PER_YEAR / days) - 1.0)
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct PerformanceSummary {
    pub days: f64,
    pub managed_annualized: f64,
    pub hold_annualized: f64,
    pub full_range_annualized: f64,
    /// Final managed value over final hold value, minus one.
    pub managed_vs_hold: f64,
    pub managed_vs_full_range: f64,
}

/// Annualized returns of all three series over the same span.
pub fn performance(series: &BenchmarkSeries, days: f64) -> Result<PerformanceSummary> {
    let (first, last) = match (series.points.first(), series.points.last()) {
        (Some(f), Some(l)) => (f, l),
        _ => return Err(AnalysisError::InvalidInput("empty benchmark series".into())),
    };
    Ok(PerformanceSummary {
        days,
        managed_annualized: annualized_return(first.managed, last.managed, days)?,
        hold_annualized: annualized_return(first.hold, last.hold, days)?,
        full_range_annualized: annualized_return(first.full_range, last.full_range, days)?,
        managed_vs_hold: last.managed / last.hold - 1.0,
        managed_vs_full_range: last.managed / last.full_range - 1.0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::U256;

    const DEC: PairDecimals = PairDecimals { decimals0: 18, decimals1: 6 };

    fn vault(height: Height, eth: u64, usdc: u64) -> VaultSnapshot {
        VaultSnapshot {
            height,
            amount0: U256::from(eth) * U256::exp10(18),
            amount1: U256::from(usdc) * U256::exp10(6),
        }
    }

    fn raw(human: f64) -> f64 {
        human * 1e6 / 1e18
    }

    #[test]
    fn il_factor_is_one_at_unchanged_price() {
        assert!((il_factor(1.0) - 1.0).abs() < 1e-15);
        assert!((il_factor(4.0) - 0.8).abs() < 1e-12);
        assert!(il_factor(0.25) < 1.0);
        assert!((full_range_value(1000.0, 4.0) - 800.0).abs() < 1e-9);
    }

    #[test]
    fn benchmarks_from_vault_holdings() {
        let vaults = vec![vault(1, 10, 30_000), vault(2, 12, 24_000), vault(3, 8, 40_000)];
        let prices = vec![(1, raw(3000.0)), (2, raw(2500.0)), (3, raw(4000.0))];
        let series = build_benchmarks(&vaults, &prices, DEC).unwrap();

        let p = &series.points;
        assert!((p[0].managed - 60_000.0).abs() < 1e-6);
        assert!((p[0].hold - 60_000.0).abs() < 1e-6);
        assert!((p[0].full_range - 60_000.0).abs() < 1e-6);
        assert!((p[1].managed - 54_000.0).abs() < 1e-6);
        assert!((p[1].hold - 55_000.0).abs() < 1e-6);
        assert!(p[1].full_range < p[1].hold);
        assert!((p[2].hold - 70_000.0).abs() < 1e-6);
    }

    #[test]
    fn misaligned_inputs_are_rejected() {
        let vaults = vec![vault(1, 1, 1), vault(2, 1, 1)];
        assert!(build_benchmarks(&vaults, &[(1, raw(3000.0))], DEC).is_err());
        assert!(build_benchmarks(&vaults, &[(1, raw(3000.0)), (3, raw(3000.0))], DEC).is_err());
        assert!(build_benchmarks(&vaults, &[(1, 0.0), (2, raw(3000.0))], DEC).is_err());
    }

    #[test]
    fn decomposition_identity_holds_everywhere() {
        let vaults: Vec<VaultSnapshot> = (0..50u64).map(|i| vault(i, 10 + i % 3, 30_000 + 700 * i)).collect();
        let prices: Vec<(Height, f64)> = (0..50u64)
            .map(|i| (i, raw(3000.0 * (1.0 + 0.4 * ((i as f64) / 7.0).sin()))))
            .collect();
        let series = build_benchmarks(&vaults, &prices, DEC).unwrap();
        let points = decompose(&series).unwrap();
        let hold0 = series.points[0].hold;
        for p in &points {
            let rebuilt = hold0 + p.price_return + p.il_full_range + p.management_premium;
            assert!((p.managed - rebuilt).abs() < 1e-9 * p.managed);
        }
        assert_eq!(points[0].price_return, 0.0);
    }

    #[test]
    fn drift_is_reported_not_accepted() {
        let point = DecompositionPoint {
            height: 7,
            managed: 1_000.0,
            hold: 900.0,
            full_range: 850.0,
            price_return: -100.0,
            il_full_range: -50.0,
            management_premium: 150.001,
        };
        assert!(matches!(
            verify_identity(3, 1_000.0, &point),
            Err(AnalysisError::DecompositionDrift { index: 3, .. })
        ));
    }

    #[test]
    fn rebuilt_points_pass_the_consistency_check() {
        let vaults = vec![vault(1, 10, 30_000), vault(2, 9, 34_000), vault(3, 12, 27_000)];
        let prices = vec![(1, raw(3000.0)), (2, raw(3300.0)), (3, raw(2700.0))];
        let series = build_benchmarks(&vaults, &prices, DEC).unwrap();
        let points = decompose(&series).unwrap();
        let hold0 = series.points[0].hold;
        for (i, point) in points.iter().enumerate() {
            assert!(verify_identity(i, hold0, point).is_ok());
        }
        // a bookkeeping slip in one term is caught
        let mut slipped = points[2].clone();
        slipped.il_full_range += 1.0;
        assert!(verify_identity(2, hold0, &slipped).is_err());
    }

    #[test]
    fn annualization_is_applied_uniformly() {
        assert!((annualized_return(100.0, 110.0, 365.0).unwrap() - 0.10).abs() < 1e-12);
        let half_year = annualized_return(100.0, 110.0, 182.5).unwrap();
        assert!((half_year - 0.21).abs() < 1e-9);
        assert!(annualized_return(0.0, 1.0, 10.0).is_err());
        assert!(annualized_return(1.0, 1.0, 0.0).is_err());

        let vaults = vec![vault(1, 10, 30_000), vault(2, 10, 33_000)];
        let prices = vec![(1, raw(3000.0)), (2, raw(3000.0))];
        let summary = performance(&build_benchmarks(&vaults, &prices, DEC).unwrap(), 365.0).unwrap();
        assert!((summary.managed_annualized - 0.05).abs() < 1e-9);
        assert!(summary.hold_annualized.abs() < 1e-12);
        assert!((summary.full_range_annualized - summary.hold_annualized).abs() < 1e-12);
    }
}
