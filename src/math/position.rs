// Liquidity <-> token amounts for tick ranges, TVL over scanned ranges and
// capital efficiency of a concentrated position vs full range.

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::{AnalysisError, Result};
use crate::math::tick_math::{amount0_delta, amount1_delta, q96, sqrt_ratio_at_tick};
use crate::models::{LiquidityRange, PoolSnapshot};

/// Token amounts held by liquidity `liquidity` in [sqrt_a, sqrt_b] at price sqrt_p.
pub fn amounts_for_liquidity(
    sqrt_p: &BigInt,
    sqrt_a: &BigInt,
    sqrt_b: &BigInt,
    liquidity: &BigInt,
) -> (BigInt, BigInt) {
    let (sa, sb) = if sqrt_a < sqrt_b { (sqrt_a, sqrt_b) } else { (sqrt_b, sqrt_a) };
    if sqrt_p <= sa {
        (amount0_delta(sa, sb, liquidity, false), BigInt::zero())
    } else if sqrt_p < sb {
        (
            amount0_delta(sqrt_p, sb, liquidity, false),
            amount1_delta(sa, sqrt_p, liquidity, false),
        )
    } else {
        (BigInt::zero(), amount1_delta(sa, sb, liquidity, false))
    }
}

/// Largest liquidity the amounts support in [sa, sb] around sp (sa < sp < sb).
pub fn liquidity_for_amounts(
    sa: &BigInt,
    sp: &BigInt,
    sb: &BigInt,
    amount0: &BigInt,
    amount1: &BigInt,
) -> Result<BigInt> {
    if !(sa < sp && sp < sb) {
        return Err(AnalysisError::InvalidInput("expected sa < sp < sb".into()));
    }
    // L0 = amount0 * sb * sp / ((sb - sp) << 96)
    let l0 = (amount0 * sb * sp) / ((sb - sp) * q96());
    // L1 = amount1 * Q96 / (sp - sa)
    let l1 = (amount1 * q96()) / (sp - sa);
    Ok(if l0 < l1 { l0 } else { l1 })
}

/// Total raw token amounts locked in the scanned ranges at the snapshot price.
pub fn total_value_locked(snapshot: &PoolSnapshot, ranges: &[LiquidityRange]) -> Result<(BigInt, BigInt)> {
    let mut amount0 = BigInt::zero();
    let mut amount1 = BigInt::zero();
    for range in ranges {
        if range.liquidity_gross.is_zero() {
            continue;
        }
        if range.liquidity_gross.is_negative() {
            return Err(AnalysisError::InconsistentLiquidity {
                tick: range.tick_lower,
                scanned: range.liquidity_gross.clone(),
                expected: BigInt::zero(),
            });
        }
        let sa = sqrt_ratio_at_tick(range.tick_lower)?;
        let sb = sqrt_ratio_at_tick(range.tick_upper)?;
        let (a0, a1) = amounts_for_liquidity(&snapshot.sqrt_price_x96, &sa, &sb, &range.liquidity_gross);
        amount0 += a0;
        amount1 += a1;
    }
    Ok((amount0, amount1))
}

/// Actual liquidity over the full-range liquidity the same raw amounts
/// would give, `L / sqrt(x * y)`. 1.0 for a full-range position.
pub fn capital_efficiency(liquidity: &BigInt, raw_amount0: &BigInt, raw_amount1: &BigInt) -> Option<f64> {
    if !liquidity.is_positive() || !raw_amount0.is_positive() || !raw_amount1.is_positive() {
        return None;
    }
    let full_range = (raw_amount0 * raw_amount1).sqrt();
    if full_range.is_zero() {
        return None;
    }
    Some(liquidity.to_f64()? / full_range.to_f64()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::tick_math::{MAX_TICK, MIN_TICK};

    #[test]
    fn price_below_range_is_all_currency0() {
        let l = BigInt::from(10u128.pow(20));
        let sa = sqrt_ratio_at_tick(100).unwrap();
        let sb = sqrt_ratio_at_tick(200).unwrap();
        let p = sqrt_ratio_at_tick(0).unwrap();
        let (a0, a1) = amounts_for_liquidity(&p, &sa, &sb, &l);
        assert!(a0 > BigInt::zero());
        assert!(a1.is_zero());
        let above = sqrt_ratio_at_tick(300).unwrap();
        let (b0, b1) = amounts_for_liquidity(&above, &sa, &sb, &l);
        assert!(b0.is_zero() && b1 > BigInt::zero());
    }

    #[test]
    fn liquidity_round_trips_through_amounts() {
        let l = BigInt::from(10u128.pow(22));
        let sa = sqrt_ratio_at_tick(-1200).unwrap();
        let sp = sqrt_ratio_at_tick(0).unwrap();
        let sb = sqrt_ratio_at_tick(1200).unwrap();
        let (a0, a1) = amounts_for_liquidity(&sp, &sa, &sb, &l);
        let back = liquidity_for_amounts(&sa, &sp, &sb, &a0, &a1).unwrap();
        let diff = (&l - &back).abs();
        assert!(diff <= BigInt::from(10u128.pow(4)), "diff {}", diff);
    }

    #[test]
    fn full_range_efficiency_is_about_one() {
        let l = BigInt::from(10u128.pow(20));
        let sa = sqrt_ratio_at_tick(MIN_TICK).unwrap();
        let sb = sqrt_ratio_at_tick(MAX_TICK).unwrap();
        let sp = sqrt_ratio_at_tick(0).unwrap();
        let (a0, a1) = amounts_for_liquidity(&sp, &sa, &sb, &l);
        let ce = capital_efficiency(&l, &a0, &a1).unwrap();
        assert!((ce - 1.0).abs() < 1e-6, "ce {}", ce);
    }

    #[test]
    fn narrow_range_is_more_efficient() {
        let l = BigInt::from(10u128.pow(20));
        let sa = sqrt_ratio_at_tick(-600).unwrap();
        let sb = sqrt_ratio_at_tick(600).unwrap();
        let sp = sqrt_ratio_at_tick(0).unwrap();
        let (a0, a1) = amounts_for_liquidity(&sp, &sa, &sb, &l);
        let ce = capital_efficiency(&l, &a0, &a1).unwrap();
        // 1 / (1 - 1.0001^-300) ~ 33.8
        assert!(ce > 30.0 && ce < 40.0, "ce {}", ce);
        assert!(capital_efficiency(&l, &BigInt::zero(), &a1).is_none());
    }

    #[test]
    fn tvl_sums_active_ranges() {
        let l = BigInt::from(10u128.pow(20));
        let snapshot = PoolSnapshot {
            height: 1,
            sqrt_price_x96: sqrt_ratio_at_tick(0).unwrap(),
            active_tick: 0,
            active_liquidity: l.clone(),
            fee_pips: 3000,
            tick_spacing: 60,
        };
        let ranges = vec![
            LiquidityRange { tick_lower: -1200, tick_upper: -600, liquidity_net: l.clone(), liquidity_gross: BigInt::zero() },
            LiquidityRange { tick_lower: -600, tick_upper: 600, liquidity_net: -l.clone(), liquidity_gross: l.clone() },
            LiquidityRange { tick_lower: 600, tick_upper: 1200, liquidity_net: BigInt::zero(), liquidity_gross: BigInt::zero() },
        ];
        let (a0, a1) = total_value_locked(&snapshot, &ranges).unwrap();
        let sa = sqrt_ratio_at_tick(-600).unwrap();
        let sb = sqrt_ratio_at_tick(600).unwrap();
        let expected = amounts_for_liquidity(&snapshot.sqrt_price_x96, &sa, &sb, &l);
        assert_eq!((a0, a1), expected);
    }
}
