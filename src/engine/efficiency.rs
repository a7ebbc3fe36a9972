// Capital efficiency across the two pricing models
// ------------------------------------------------
// Pure functions over height-ordered slippage series. "First" and "second" are
// the two models being compared (the pair is conventionally first); ratios and
// improvements are first relative to second.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, CheaperSeries, Result};
use crate::models::{Direction, SeriesKey, SlippageSeries};

/// Mean gross and net slippage of one series.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SeriesAverage {
    pub key: SeriesKey,
    pub gross_avg: f64,
    pub net_avg: f64,
    pub samples: usize,
}

/// `None` for an empty series.
pub fn time_average(series: &SlippageSeries) -> Option<SeriesAverage> {
    if series.is_empty() {
        return None;
    }
    let n = series.samples.len() as f64;
    let (gross, net) = series
        .samples
        .iter()
        .fold((0.0, 0.0), |(g, t), s| (g + s.gross_pct, t + s.net_pct));
    Some(SeriesAverage {
        key: series.key,
        gross_avg: gross / n,
        net_avg: net / n,
        samples: series.samples.len(),
    })
}

/// first.gross_avg / second.gross_avg; infinite when the second is zero.
pub fn efficiency_ratio(first: &SeriesAverage, second: &SeriesAverage) -> f64 {
    if second.gross_avg <= 0.0 {
        return f64::INFINITY;
    }
    first.gross_avg / second.gross_avg
}

/// Time-averaged net cost per trade size for one direction, ascending by size.
pub fn cost_curve(series: &[SlippageSeries], direction: Direction) -> Vec<(f64, f64)> {
    let mut curve: Vec<(f64, f64)> = series
        .iter()
        .filter(|s| s.key.direction == direction)
        .filter_map(time_average)
        .map(|avg| (avg.key.trade_size, avg.net_avg))
        .collect();
    curve.sort_by(|a, b| a.0.total_cmp(&b.0));
    curve
}

/// Trade size where the first model's net cost curve meets the second's.
pub fn find_breakeven(first: &[SlippageSeries], second: &[SlippageSeries], direction: Direction) -> Result<f64> {
    let a = cost_curve(first, direction);
    let b = cost_curve(second, direction);
    let points: Vec<(f64, f64, f64)> = a
        .iter()
        .filter_map(|&(size, net_a)| {
            b.iter()
                .find(|(s, _)| *s == size)
                .map(|&(_, net_b)| (size, net_a, net_b))
        })
        .collect();
    breakeven_from_curves(&points)
}

/// `points` are `(trade_size, net_first, net_second)` ascending by size.
///
/// Interpolates linearly across the first sign change of `net_first -
/// net_second`. A sample where the two are equal is returned as is.
pub fn breakeven_from_curves(points: &[(f64, f64, f64)]) -> Result<f64> {
    if points.is_empty() {
        return Err(AnalysisError::InvalidInput("no common trade sizes to compare".into()));
    }
    let diffs: Vec<(f64, f64)> = points.iter().map(|&(x, a, b)| (x, a - b)).collect();

    for (i, &(x, d)) in diffs.iter().enumerate() {
        if d == 0.0 {
            return Ok(x);
        }
        if let Some(&(x_next, d_next)) = diffs.get(i + 1) {
            if d_next != 0.0 && d.signum() != d_next.signum() {
                let frac = d.abs() / (d.abs() + d_next.abs());
                return Ok(x + (x_next - x) * frac);
            }
        }
    }

    let cheaper = if diffs.iter().all(|(_, d)| *d < 0.0) {
        CheaperSeries::First
    } else if diffs.iter().all(|(_, d)| *d > 0.0) {
        CheaperSeries::Second
    } else {
        CheaperSeries::Neither
    };
    Err(AnalysisError::NoBreakeven { cheaper })
}

/// A breakeven search result as shown to users: a crossing or a dominance.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub enum BreakevenOutcome {
    Crossing { trade_size: f64 },
    Dominance { cheaper: CheaperSeries },
}

impl BreakevenOutcome {
    pub fn from_search(result: Result<f64>) -> Result<Self> {
        match result {
            Ok(trade_size) => Ok(BreakevenOutcome::Crossing { trade_size }),
            Err(AnalysisError::NoBreakeven { cheaper }) => Ok(BreakevenOutcome::Dominance { cheaper }),
            Err(e) => Err(e),
        }
    }
}

/// Side-by-side averages for one (trade size, direction).
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SlippageComparison {
    pub trade_size: f64,
    pub direction: Direction,
    pub first: SeriesAverage,
    pub second: SeriesAverage,
    pub efficiency_ratio: f64,
    /// (first - second) / first, in percent.
    pub gross_improvement_pct: f64,
    pub net_improvement_pct: f64,
}

fn improvement_pct(first: f64, second: f64) -> f64 {
    if first == 0.0 {
        return 0.0;
    }
    (first - second) / first * 100.0
}

/// Compare every key present in both sets of series.
pub fn summarize(first: &[SlippageSeries], second: &[SlippageSeries]) -> Vec<SlippageComparison> {
    first
        .iter()
        .filter_map(|a| {
            let b = second.iter().find(|b| b.key == a.key)?;
            let (avg_a, avg_b) = (time_average(a)?, time_average(b)?);
            Some(SlippageComparison {
                trade_size: a.key.trade_size,
                direction: a.key.direction,
                efficiency_ratio: efficiency_ratio(&avg_a, &avg_b),
                gross_improvement_pct: improvement_pct(avg_a.gross_avg, avg_b.gross_avg),
                net_improvement_pct: improvement_pct(avg_a.net_avg, avg_b.net_avg),
                first: avg_a,
                second: avg_b,
            })
        })
        .collect()
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct EfficiencyReport {
    pub comparisons: Vec<SlippageComparison>,
    pub breakeven: Vec<(Direction, BreakevenOutcome)>,
}

pub fn analyze(first: &[SlippageSeries], second: &[SlippageSeries]) -> EfficiencyReport {
    let breakeven = Direction::BOTH
        .iter()
        .filter_map(|&direction| {
            match BreakevenOutcome::from_search(find_breakeven(first, second, direction)) {
                Ok(outcome) => Some((direction, outcome)),
                Err(e) => {
                    log::warn!("no breakeven verdict for {:?}: {}", direction, e);
                    None
                }
            }
        })
        .collect();
    EfficiencyReport { comparisons: summarize(first, second), breakeven }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SlippageSample;

    fn series(trade_size: f64, direction: Direction, values: &[(f64, f64)]) -> SlippageSeries {
        let mut s = SlippageSeries::new(SeriesKey { trade_size, direction });
        for (i, &(gross_pct, net_pct)) in values.iter().enumerate() {
            s.push(SlippageSample { height: i as u64, trade_size, direction, gross_pct, net_pct, price_impact_pct: None })
                .unwrap();
        }
        s
    }

    fn curve(f: impl Fn(f64) -> f64, sizes: &[f64]) -> Vec<SlippageSeries> {
        sizes
            .iter()
            .map(|&x| series(x, Direction::Forward, &[(f(x), f(x)), (f(x), f(x))]))
            .collect()
    }

    #[test]
    fn averages_and_ratio() {
        let a = time_average(&series(1000.0, Direction::Forward, &[(1.0, 1.3), (3.0, 3.3)])).unwrap();
        let b = time_average(&series(1000.0, Direction::Forward, &[(0.5, 0.8), (0.5, 0.8)])).unwrap();
        assert_eq!(a.gross_avg, 2.0);
        assert!((a.net_avg - 2.3).abs() < 1e-12);
        assert_eq!(efficiency_ratio(&a, &b), 4.0);

        let zero = time_average(&series(1000.0, Direction::Forward, &[(0.0, 0.3)])).unwrap();
        assert!(efficiency_ratio(&a, &zero).is_infinite());
        assert!(time_average(&SlippageSeries::new(a.key)).is_none());
    }

    #[test]
    fn crossing_is_interpolated() {
        let points = [(1_000.0, 0.45, 0.73), (5_000.0, 0.85, 0.81)];
        assert!((breakeven_from_curves(&points).unwrap() - 4_500.0).abs() < 1e-9);
    }

    #[test]
    fn exact_tie_returns_the_sample() {
        let points = [(1_000.0, 0.5, 0.6), (5_000.0, 0.7, 0.7), (10_000.0, 0.9, 0.8)];
        assert_eq!(breakeven_from_curves(&points).unwrap(), 5_000.0);
    }

    #[test]
    fn reference_curves_never_cross() {
        // netA = 0.003x stays below netB = 0.007x - 0.0004 sqrt(x) at every size
        let sizes = [1_000.0, 5_000.0, 10_000.0, 50_000.0];
        let a = curve(|x| 0.003 * x, &sizes);
        let b = curve(|x| 0.007 * x - 0.0004 * x.sqrt(), &sizes);
        assert!(matches!(
            find_breakeven(&a, &b, Direction::Forward),
            Err(AnalysisError::NoBreakeven { cheaper: CheaperSeries::First })
        ));
        assert!(matches!(
            find_breakeven(&b, &a, Direction::Forward),
            Err(AnalysisError::NoBreakeven { cheaper: CheaperSeries::Second })
        ));
    }

    #[test]
    fn crossing_falls_strictly_between_bracketing_samples() {
        // fixed cost 30 vs 0.004x: equal at 7500
        let sizes = [1_000.0, 5_000.0, 10_000.0, 50_000.0];
        let a = curve(|x| 0.004 * x, &sizes);
        let b = curve(|_| 30.0, &sizes);
        let x = find_breakeven(&a, &b, Direction::Forward).unwrap();
        assert!(x > 5_000.0 && x < 10_000.0, "{}", x);
        assert!((x - 7_500.0).abs() < 1e-6);
        // no reverse samples at all
        assert!(matches!(
            find_breakeven(&a, &b, Direction::Reverse),
            Err(AnalysisError::InvalidInput(_))
        ));
    }

    #[test]
    fn summary_reports_improvement() {
        let first = vec![series(10_000.0, Direction::Forward, &[(1.0, 1.3)])];
        let second = vec![
            series(10_000.0, Direction::Forward, &[(0.25, 0.55)]),
            series(10_000.0, Direction::Reverse, &[(0.25, 0.55)]),
        ];
        let rows = summarize(&first, &second);
        assert_eq!(rows.len(), 1);
        assert!((rows[0].gross_improvement_pct - 75.0).abs() < 1e-9);
        assert!((rows[0].net_improvement_pct - (1.3 - 0.55) / 1.3 * 100.0).abs() < 1e-9);
        assert_eq!(rows[0].efficiency_ratio, 4.0);

        let report = analyze(&first, &second);
        assert_eq!(
            report.breakeven,
            vec![(Direction::Forward, BreakevenOutcome::Dominance { cheaper: CheaperSeries::Second })]
        );
    }
}
