// Exact Uniswap tick / sqrt-price math in BigInt
// ---------------------------------------------
// - Q64.96 sqrt prices, Q128.128 intermediate ratio, Uniswap rounding everywhere.
// - Every intermediate is an arbitrary-precision integer; callers check the
//   on-chain bit widths (uint160 prices, uint128 liquidity) where it matters.
// - Tick -> bitmap position uses floor division so negative ticks land in the
//   right word (-1 / 256 is word -1, not word 0).

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Zero};

use crate::error::{AnalysisError, Result};

pub const MIN_TICK: i32 = -887_272;
pub const MAX_TICK: i32 = 887_272;
pub const Q96: u128 = 1u128 << 96;
pub const MIN_SQRT_RATIO: u128 = 4_295_128_739;
/// 1461446703485210103287273052203988822378723970342, upper bound of uint160 prices.
pub const MAX_SQRT_RATIO_HEX: &[u8] = b"fffd8963efd1fc6a506488495d951d5263988d26";

pub fn min_sqrt_ratio() -> BigInt {
    BigInt::from(MIN_SQRT_RATIO)
}

pub fn max_sqrt_ratio() -> BigInt {
    BigInt::parse_bytes(MAX_SQRT_RATIO_HEX, 16).unwrap_or_else(|| (BigInt::one() << 160) - 1)
}

#[inline]
pub fn q96() -> BigInt {
    BigInt::from(Q96)
}

#[inline]
pub fn ceil_div(a: &BigInt, b: &BigInt) -> BigInt {
    // a >= 0, b > 0
    if a.is_zero() {
        return BigInt::zero();
    }
    (a + (b - BigInt::one())) / b
}

// -------------------------------- Tick Math --------------------------------

/// TickMath.getSqrtRatioAtTick (Q64.96).
pub fn sqrt_ratio_at_tick(tick: i32) -> Result<BigInt> {
    if !(MIN_TICK..=MAX_TICK).contains(&tick) {
        return Err(AnalysisError::InvalidInput(format!("tick {} out of range", tick)));
    }
    let abs_tick = tick.unsigned_abs();

    // Q128.128
    let mut ratio = if abs_tick & 0x1 != 0 {
        BigInt::from(0xfffcb933bd6fad37aa2d162d1a594001u128)
    } else {
        BigInt::one() << 128
    };

    macro_rules! ms {
        ($mask:expr, $k:literal) => {
            if abs_tick & $mask != 0 {
                ratio = (&ratio * BigInt::from($k)) >> 128;
            }
        };
    }

    ms!(0x2, 0xfff97272373d413259a46990580e213au128);
    ms!(0x4, 0xfff2e50f5f656932ef12357cf3c7fdccu128);
    ms!(0x8, 0xffe5caca7e10e4e61c3624eaa0941cd0u128);
    ms!(0x10, 0xffcb9843d60f6159c9db58835c926644u128);
    ms!(0x20, 0xff973b41fa98c081472e6896dfb254c0u128);
    ms!(0x40, 0xff2ea16466c96a3843ec78b326b52861u128);
    ms!(0x80, 0xfe5dee046a99a2a811c461f1969c3053u128);
    ms!(0x100, 0xfcbe86c7900a88aedcffc83b479aa3a4u128);
    ms!(0x200, 0xf987a7253ac413176f2b074cf7815e54u128);
    ms!(0x400, 0xf3392b0822b70005940c7a398e4b70f3u128);
    ms!(0x800, 0xe7159475a2c29b7443b29c7fa6e889d9u128);
    ms!(0x1000, 0xd097f3bdfd2022b8845ad8f792aa5825u128);
    ms!(0x2000, 0xa9f746462d870fdf8a65dc1f90e061e5u128);
    ms!(0x4000, 0x70d869a156d2a1b890bb3df62baf32f7u128);
    ms!(0x8000, 0x31be135f97d08fd981231505542fcfa6u128);
    ms!(0x10000, 0x9aa508b5b7a84e1c677de54f3e99bc9u128);
    ms!(0x20000, 0x5d6af8dedb81196699c329225ee604u128);
    ms!(0x40000, 0x2216e584f5fa1ea926041bedfe98u128);
    ms!(0x80000, 0x48a170391f7dc42444e8fa2u128);

    if tick > 0 {
        let max = (BigInt::one() << 256) - 1;
        ratio = max / ratio;
    }
    // Q128.128 -> Q64.96, rounding up
    Ok((&ratio + ((BigInt::one() << 32) - 1)) >> 32)
}

/// Greatest tick whose sqrt ratio is <= the given price.
pub fn tick_at_sqrt_ratio(sqrt_price_x96: &BigInt) -> Result<i32> {
    if *sqrt_price_x96 < min_sqrt_ratio() || *sqrt_price_x96 >= max_sqrt_ratio() {
        return Err(AnalysisError::PrecisionOverflow(format!(
            "sqrt price {} outside the uint160 price domain",
            sqrt_price_x96
        )));
    }
    let mut lo = MIN_TICK;
    let mut hi = MAX_TICK;
    while lo < hi {
        let mid = lo + (hi - lo + 1) / 2;
        if sqrt_ratio_at_tick(mid)? <= *sqrt_price_x96 {
            lo = mid;
        } else {
            hi = mid - 1;
        }
    }
    Ok(lo)
}

// --------------------------- Bitmap positions ---------------------------

/// (word index, bit position) of an initializable tick.
pub fn tick_position(tick: i32, tick_spacing: i32, word_width: u32) -> (i32, u32) {
    let compressed = Integer::div_floor(&tick, &tick_spacing);
    let width = word_width as i32;
    let word = Integer::div_floor(&compressed, &width);
    let bit = compressed.mod_floor(&width);
    (word, bit as u32)
}

/// Inverse of [`tick_position`].
pub fn tick_at_position(word_index: i32, bit: u32, tick_spacing: i32, word_width: u32) -> i64 {
    (word_index as i64 * word_width as i64 + bit as i64) * tick_spacing as i64
}

/// Lowest and highest ticks usable at this spacing.
pub fn usable_tick_bounds(tick_spacing: i32) -> (i32, i32) {
    let lo = -(MAX_TICK / tick_spacing) * tick_spacing;
    let hi = (MAX_TICK / tick_spacing) * tick_spacing;
    (lo, hi)
}

// --------------------------- SqrtPriceMath deltas ---------------------------

/// Uniswap-exact amount0 between two prices:
///   round_up:  ceil( ceil( (L << 96) * (sb - sa) / sb ) / sa )
///   otherwise: floor( floor( (L << 96) * (sb - sa) / sb ) / sa )
pub fn amount0_delta(sqrt_a: &BigInt, sqrt_b: &BigInt, liquidity: &BigInt, round_up: bool) -> BigInt {
    if liquidity.is_zero() {
        return BigInt::zero();
    }
    let (sa, sb) = if sqrt_a < sqrt_b { (sqrt_a, sqrt_b) } else { (sqrt_b, sqrt_a) };
    if sa.is_zero() || sa == sb {
        return BigInt::zero();
    }

    let numerator1 = liquidity << 96;
    let numerator2 = sb - sa;

    if round_up {
        let t = ceil_div(&(&numerator1 * &numerator2), sb);
        ceil_div(&t, sa)
    } else {
        ((&numerator1 * &numerator2) / sb) / sa
    }
}

/// Uniswap-exact amount1 between two prices: L * (sb - sa) / Q96.
pub fn amount1_delta(sqrt_a: &BigInt, sqrt_b: &BigInt, liquidity: &BigInt, round_up: bool) -> BigInt {
    if liquidity.is_zero() {
        return BigInt::zero();
    }
    let (sa, sb) = if sqrt_a < sqrt_b { (sqrt_a, sqrt_b) } else { (sqrt_b, sqrt_a) };
    if sa == sb {
        return BigInt::zero();
    }

    let num = liquidity * (sb - sa);
    if round_up {
        ceil_div(&num, &q96())
    } else {
        num / q96()
    }
}

// ----------------------------- Next price helpers -----------------------------

/// getNextSqrtPriceFromAmount0RoundingUp (adding currency0):
///   sqrtQ = ceil( (L<<96) * sqrtP / ((L<<96) + amountIn * sqrtP) )
pub fn next_sqrt_from_amount0_in(liquidity: &BigInt, sqrt_p_x96: &BigInt, amount_in: &BigInt) -> BigInt {
    if amount_in.is_zero() || liquidity.is_zero() {
        return sqrt_p_x96.clone();
    }
    let numerator1 = liquidity << 96;
    let numerator = &numerator1 * sqrt_p_x96;
    let denominator = &numerator1 + amount_in * sqrt_p_x96;
    ceil_div(&numerator, &denominator)
}

/// getNextSqrtPriceFromAmount1RoundingDown (adding currency1):
///   sqrtQ = sqrtP + floor( amountIn * Q96 / L )
pub fn next_sqrt_from_amount1_in(liquidity: &BigInt, sqrt_p_x96: &BigInt, amount_in: &BigInt) -> BigInt {
    if amount_in.is_zero() || liquidity.is_zero() {
        return sqrt_p_x96.clone();
    }
    sqrt_p_x96 + (amount_in * q96()) / liquidity
}

/// Raw price for a tick (currency1 per currency0, no decimal adjustment).
pub fn price_at_tick(tick: i32) -> Result<f64> {
    Ok(crate::models::sqrt_price_x96_to_price(&sqrt_ratio_at_tick(tick)?))
}
