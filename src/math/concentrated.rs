// Concentrated-liquidity exact-input traversal
// --------------------------------------------
// State is a snapshot plus the initialized ticks recovered by the bitmap scanner,
// bounded by the scanned window. A trade consumes the active range, crosses the
// next initialized tick (moving left subtracts liquidityNet, moving right adds it),
// and continues until the input is exhausted. Running into the window edge or a
// configured price limit with input left is InsufficientLiquidity: the scan does
// not know what lies beyond.
//
// Slippage is read off the blended execution price of the whole traversal
// (sum of per-range outputs over the input) against the pre-trade spot, which is
// the single-range closed form applied piecewise.

use std::collections::BTreeMap;

use ethers::types::U256;
use num_bigint::BigInt;
use num_traits::{Signed, Zero};

use crate::error::{AnalysisError, Result};
use crate::math::tick_math::{
    amount0_delta, amount1_delta, ceil_div, max_sqrt_ratio, min_sqrt_ratio,
    next_sqrt_from_amount0_in, next_sqrt_from_amount1_in, q96, sqrt_ratio_at_tick,
    tick_at_sqrt_ratio,
};
use crate::math::{bigint_to_u256, ratio_f64, u256_to_bigint};
use crate::models::{Direction, LiquidityRange, PoolSnapshot};

const FEE_DENOMINATOR_PIPS: u32 = 1_000_000;

#[derive(Clone, Debug)]
pub struct ConcentratedState {
    pub sqrt_price_x96: BigInt,
    pub active_tick: i32,
    pub liquidity: BigInt,
    pub fee_pips: u32,
    /// initialized tick -> liquidityNet
    ticks: BTreeMap<i32, BigInt>,
    /// Scanned window, inclusive.
    window: (i32, i32),
    /// Optional (lower, upper) sqrt price bounds a trade may not cross.
    price_limits: Option<(BigInt, BigInt)>,
}

/// One traversed band.
#[derive(Clone, Debug, PartialEq)]
pub struct Segment {
    pub sqrt_start: BigInt,
    pub sqrt_end: BigInt,
    pub liquidity: BigInt,
    pub amount_in: BigInt,
    pub amount_out: BigInt,
}

#[derive(Clone, Debug)]
pub struct SwapOutcome {
    /// Input consumed, fee included.
    pub amount_in: BigInt,
    pub amount_out: BigInt,
    pub fee_paid: BigInt,
    pub sqrt_price_after: BigInt,
    pub tick_after: i32,
    pub liquidity_after: BigInt,
    pub ticks_crossed: usize,
    pub segments: Vec<Segment>,
}

impl ConcentratedState {
    /// Build from a snapshot and the ranges the scanner produced.
    pub fn from_scan(snapshot: &PoolSnapshot, ranges: &[LiquidityRange]) -> Result<Self> {
        let (first, last) = match (ranges.first(), ranges.last()) {
            (Some(f), Some(l)) => (f, l),
            _ => {
                return Err(AnalysisError::InvalidInput(format!(
                    "no liquidity ranges at height {}",
                    snapshot.height
                )))
            }
        };
        let ticks = ranges
            .iter()
            .filter(|r| !r.liquidity_net.is_zero())
            .map(|r| (r.tick_upper, r.liquidity_net.clone()));
        Self::new(
            snapshot.sqrt_price_x96.clone(),
            snapshot.active_tick,
            snapshot.active_liquidity.clone(),
            snapshot.fee_pips,
            ticks,
            (first.tick_lower, last.tick_upper),
        )
    }

    pub fn new(
        sqrt_price_x96: BigInt,
        active_tick: i32,
        liquidity: BigInt,
        fee_pips: u32,
        ticks: impl IntoIterator<Item = (i32, BigInt)>,
        window: (i32, i32),
    ) -> Result<Self> {
        check_sqrt_price(&sqrt_price_x96)?;
        check_liquidity(&liquidity)?;
        if fee_pips >= FEE_DENOMINATOR_PIPS {
            return Err(AnalysisError::InvalidInput(format!("fee {} pips", fee_pips)));
        }
        if window.0 > window.1 {
            return Err(AnalysisError::InvalidInput(format!("window {:?}", window)));
        }
        // validates both edges against the tick domain
        sqrt_ratio_at_tick(window.0)?;
        sqrt_ratio_at_tick(window.1)?;

        let mut map = BTreeMap::new();
        for (tick, net) in ticks {
            check_liquidity(&net.abs())?;
            map.insert(tick, net);
        }
        Ok(Self {
            sqrt_price_x96,
            active_tick,
            liquidity,
            fee_pips,
            ticks: map,
            window,
            price_limits: None,
        })
    }

    pub fn with_price_limits(mut self, lower: BigInt, upper: BigInt) -> Self {
        self.price_limits = Some((lower, upper));
        self
    }

    pub fn window(&self) -> (i32, i32) {
        self.window
    }

    pub fn initialized_ticks(&self) -> impl Iterator<Item = (&i32, &BigInt)> {
        self.ticks.iter()
    }

    /// Raw spot price, currency1 per currency0.
    pub fn spot_price(&self) -> f64 {
        crate::models::sqrt_price_x96_to_price(&self.sqrt_price_x96)
    }

    fn next_initialized_tick(&self, current_tick: i32, direction: Direction) -> Option<i32> {
        let (lo, hi) = self.window;
        match direction {
            Direction::Forward => {
                if current_tick < lo {
                    return None;
                }
                let upper = current_tick.min(hi);
                self.ticks.range(lo..=upper).next_back().map(|(t, _)| *t)
            }
            Direction::Reverse => {
                let lower = current_tick.saturating_add(1).max(lo);
                if lower > hi {
                    return None;
                }
                self.ticks.range(lower..=hi).next().map(|(t, _)| *t)
            }
        }
    }

    /// The furthest price a trade may reach: window edge, tightened by any limit.
    fn price_bound(&self, direction: Direction) -> Result<BigInt> {
        match direction {
            Direction::Forward => {
                let edge = sqrt_ratio_at_tick(self.window.0)?;
                Ok(match &self.price_limits {
                    Some((lower, _)) if *lower > edge => lower.clone(),
                    _ => edge,
                })
            }
            Direction::Reverse => {
                let edge = sqrt_ratio_at_tick(self.window.1)?;
                Ok(match &self.price_limits {
                    Some((_, upper)) if *upper < edge => upper.clone(),
                    _ => edge,
                })
            }
        }
    }

    /// Exact-input swap across initialized ticks.
    pub fn swap(&self, amount_in: &BigInt, direction: Direction, fee_pips: u32) -> Result<SwapOutcome> {
        if amount_in.is_negative() {
            return Err(AnalysisError::InvalidInput(format!("amount_in {}", amount_in)));
        }
        if fee_pips >= FEE_DENOMINATOR_PIPS {
            return Err(AnalysisError::InvalidInput(format!("fee {} pips", fee_pips)));
        }
        let zero_for_one = direction.zero_for_one();
        let bound = self.price_bound(direction)?;

        let mut remaining = amount_in.clone();
        let mut sqrt_price = self.sqrt_price_x96.clone();
        let mut liquidity = self.liquidity.clone();
        let mut current_tick = self.active_tick;
        let mut amount_out = BigInt::zero();
        let mut fee_paid = BigInt::zero();
        let mut ticks_crossed = 0usize;
        let mut segments = Vec::new();

        while remaining > BigInt::zero() {
            let at_bound = if zero_for_one { sqrt_price <= bound } else { sqrt_price >= bound };
            if at_bound {
                return Err(AnalysisError::InsufficientLiquidity {
                    requested: amount_in.clone(),
                    remaining,
                });
            }

            let next_tick = self.next_initialized_tick(current_tick, direction);
            let sqrt_next = match next_tick {
                Some(t) => sqrt_ratio_at_tick(t)?,
                None => bound.clone(),
            };
            let target = if zero_for_one {
                if sqrt_next > bound { sqrt_next.clone() } else { bound.clone() }
            } else if sqrt_next < bound {
                sqrt_next.clone()
            } else {
                bound.clone()
            };

            let step = compute_swap_step(&sqrt_price, &target, &liquidity, &remaining, fee_pips, zero_for_one);
            remaining -= &step.amount_in + &step.fee;
            fee_paid += &step.fee;
            amount_out += &step.amount_out;
            if !step.amount_in.is_zero() {
                segments.push(Segment {
                    sqrt_start: sqrt_price.clone(),
                    sqrt_end: step.sqrt_next.clone(),
                    liquidity: liquidity.clone(),
                    amount_in: step.amount_in.clone(),
                    amount_out: step.amount_out.clone(),
                });
            }
            sqrt_price = step.sqrt_next;
            check_sqrt_price(&sqrt_price)?;

            match next_tick {
                Some(tick) if sqrt_price == sqrt_next => {
                    let net = self.ticks.get(&tick).cloned().unwrap_or_default();
                    if zero_for_one {
                        liquidity -= net;
                        current_tick = tick - 1;
                    } else {
                        liquidity += net;
                        current_tick = tick;
                    }
                    ticks_crossed += 1;
                    if liquidity.is_negative() {
                        return Err(AnalysisError::InconsistentLiquidity {
                            tick,
                            scanned: liquidity,
                            expected: BigInt::zero(),
                        });
                    }
                    check_liquidity(&liquidity)?;
                }
                _ if sqrt_price == target => {
                    // reached the window edge or the limit; the loop head decides
                    current_tick = tick_at_sqrt_ratio(&sqrt_price)?;
                }
                _ => {
                    current_tick = tick_at_sqrt_ratio(&sqrt_price)?;
                    break;
                }
            }
        }

        if amount_out.bits() > 256 {
            return Err(AnalysisError::PrecisionOverflow(format!("amount out {}", amount_out)));
        }

        Ok(SwapOutcome {
            amount_in: amount_in - &remaining,
            amount_out,
            fee_paid,
            sqrt_price_after: sqrt_price,
            tick_after: current_tick,
            liquidity_after: liquidity,
            ticks_crossed,
            segments,
        })
    }

    /// Execution quality of one exact-input trade.
    ///
    /// `amount_out` is the fee-paying output; both slippage figures come from a
    /// fee-free traversal so the fee is only added once, by the caller.
    pub fn quote(&self, amount_in: U256, direction: Direction) -> Result<ConcentratedQuote> {
        let amount_in_bi = u256_to_bigint(amount_in);
        let with_fee = self.swap(&amount_in_bi, direction, self.fee_pips)?;
        let fee_free = self.swap(&amount_in_bi, direction, 0)?;
        // output rounds down at every step, so beating spot means the price
        // convention was inverted somewhere
        let gross_fraction =
            match execution_shortfall(&self.sqrt_price_x96, &amount_in_bi, &fee_free.amount_out, direction) {
                Err(AnalysisError::QuoteAboveSpot { amount_in, amount_out }) => panic!(
                    "negative slippage for {:?}: in {} out {} at sqrt price {}",
                    direction, amount_in, amount_out, self.sqrt_price_x96
                ),
                other => other?,
            };

        Ok(ConcentratedQuote {
            amount_out: bigint_to_u256(&with_fee.amount_out)?,
            gross_fraction,
            price_impact_fraction: marginal_price_move(
                &self.sqrt_price_x96,
                &fee_free.sqrt_price_after,
                direction,
            ),
            ticks_crossed: with_fee.ticks_crossed,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConcentratedQuote {
    pub amount_out: U256,
    /// Fee-free execution shortfall vs spot, fraction.
    pub gross_fraction: f64,
    /// Move of the marginal price, fraction.
    pub price_impact_fraction: f64,
    pub ticks_crossed: usize,
}

/// 1 - exec/spot for forward trades, 1 - spot/exec for reverse ones, with
/// exec always in currency1 per currency0 (out/in forward, in/out reverse).
///
/// An execution better than spot is `QuoteAboveSpot`. External quoters can
/// produce one (rebating hooks, rounding at dust sizes); a local traversal
/// never should, see [`ConcentratedState::quote`].
pub fn execution_shortfall(
    sqrt_price_x96: &BigInt,
    amount_in: &BigInt,
    amount_out: &BigInt,
    direction: Direction,
) -> Result<f64> {
    if amount_in.is_zero() {
        return Ok(0.0);
    }
    let price_x192 = sqrt_price_x96 * sqrt_price_x96;
    let q192 = q96() * q96();
    let (num, den) = match direction {
        // (in*P - out) / (in*P), scaled by 2^192
        Direction::Forward => {
            let den = amount_in * &price_x192;
            (&den - amount_out * &q192, den)
        }
        // (in - P*out) / in, scaled by 2^192
        Direction::Reverse => {
            let den = amount_in * &q192;
            (&den - amount_out * &price_x192, den)
        }
    };
    if num.is_negative() {
        return Err(AnalysisError::QuoteAboveSpot {
            amount_in: amount_in.clone(),
            amount_out: amount_out.clone(),
        });
    }
    Ok(ratio_f64(&num, &den))
}

/// 1 - P_after/P_before forward, 1 - P_before/P_after reverse.
pub fn marginal_price_move(sqrt_before: &BigInt, sqrt_after: &BigInt, direction: Direction) -> f64 {
    let before = sqrt_before * sqrt_before;
    let after = sqrt_after * sqrt_after;
    match direction {
        Direction::Forward => ratio_f64(&(&before - &after), &before),
        Direction::Reverse => ratio_f64(&(&after - &before), &after),
    }
}

// ------------------------------- Swap math step -------------------------------

struct SwapStep {
    sqrt_next: BigInt,
    amount_in: BigInt,
    amount_out: BigInt,
    fee: BigInt,
}

fn compute_swap_step(
    sqrt_price_x96: &BigInt,
    sqrt_target_x96: &BigInt,
    liquidity: &BigInt,
    amount_remaining: &BigInt,
    fee_pips: u32,
    zero_for_one: bool,
) -> SwapStep {
    let denom = BigInt::from(FEE_DENOMINATOR_PIPS);
    let fee_complement = BigInt::from(FEE_DENOMINATOR_PIPS - fee_pips);
    let fee_pips_bi = BigInt::from(fee_pips);
    let remaining_less_fee = (amount_remaining * &fee_complement) / &denom;

    let amount_in_to_target = if zero_for_one {
        amount0_delta(sqrt_target_x96, sqrt_price_x96, liquidity, true)
    } else {
        amount1_delta(sqrt_price_x96, sqrt_target_x96, liquidity, true)
    };

    if remaining_less_fee >= amount_in_to_target {
        let amount_out = if zero_for_one {
            amount1_delta(sqrt_target_x96, sqrt_price_x96, liquidity, false)
        } else {
            amount0_delta(sqrt_price_x96, sqrt_target_x96, liquidity, false)
        };
        let fee = ceil_div(&(&amount_in_to_target * &fee_pips_bi), &fee_complement);
        SwapStep {
            sqrt_next: sqrt_target_x96.clone(),
            amount_in: amount_in_to_target,
            amount_out,
            fee,
        }
    } else {
        let sqrt_next = if zero_for_one {
            next_sqrt_from_amount0_in(liquidity, sqrt_price_x96, &remaining_less_fee)
        } else {
            next_sqrt_from_amount1_in(liquidity, sqrt_price_x96, &remaining_less_fee)
        };
        let (amount_in, amount_out) = if zero_for_one {
            (
                amount0_delta(&sqrt_next, sqrt_price_x96, liquidity, true),
                amount1_delta(&sqrt_next, sqrt_price_x96, liquidity, false),
            )
        } else {
            (
                amount1_delta(sqrt_price_x96, &sqrt_next, liquidity, true),
                amount0_delta(sqrt_price_x96, &sqrt_next, liquidity, false),
            )
        };
        // target not reached: the remainder is fee
        let fee = amount_remaining - &amount_in;
        SwapStep { sqrt_next, amount_in, amount_out, fee }
    }
}

fn check_sqrt_price(sqrt_price_x96: &BigInt) -> Result<()> {
    if *sqrt_price_x96 < min_sqrt_ratio() || *sqrt_price_x96 > max_sqrt_ratio() {
        return Err(AnalysisError::PrecisionOverflow(format!(
            "sqrt price {} outside the uint160 domain",
            sqrt_price_x96
        )));
    }
    Ok(())
}

fn check_liquidity(liquidity: &BigInt) -> Result<()> {
    if liquidity.bits() > 128 {
        return Err(AnalysisError::PrecisionOverflow(format!(
            "liquidity {} exceeds 128 bits",
            liquidity
        )));
    }
    Ok(())
}
