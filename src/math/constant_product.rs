// Constant-product (x*y=k) pair math
// ----------------------------------
// out = ( (in * γ) * R_out ) / ( R_in + (in * γ) ),  γ = (10_000 - fee_bps) / 10_000
//
// - Integer math in raw token units; every multiplication is checked so a
//   256-bit overflow surfaces as PrecisionOverflow instead of wrapping.
// - Gross slippage is the fee-free execution shortfall vs spot: in / (R_in + in).

use ethers::types::U256;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::math::u256_to_f64;
use crate::models::Direction;

const BPS_DENOMINATOR: u32 = 10_000;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstantProductState {
    pub reserve0: U256,
    pub reserve1: U256,
    pub fee_bps: u32,
}

impl ConstantProductState {
    pub fn new(reserve0: U256, reserve1: U256, fee_bps: u32) -> Result<Self> {
        if fee_bps >= BPS_DENOMINATOR {
            return Err(AnalysisError::InvalidInput(format!("fee {} bps", fee_bps)));
        }
        Ok(Self { reserve0, reserve1, fee_bps })
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.reserve0.is_zero() || self.reserve1.is_zero()
    }

    /// (reserve_in, reserve_out) for a direction.
    #[inline]
    pub fn reserves_for(&self, direction: Direction) -> (U256, U256) {
        match direction {
            Direction::Forward => (self.reserve0, self.reserve1),
            Direction::Reverse => (self.reserve1, self.reserve0),
        }
    }

    /// Raw spot price, currency1 per currency0.
    pub fn spot_price(&self) -> f64 {
        if self.reserve0.is_zero() {
            return 0.0;
        }
        u256_to_f64(self.reserve1) / u256_to_f64(self.reserve0)
    }

    pub fn amount_out(&self, amount_in: U256, direction: Direction) -> Result<U256> {
        let (reserve_in, reserve_out) = self.reserves_for(direction);
        amount_out(amount_in, reserve_in, reserve_out, self.fee_bps)
    }

    /// Fee-free shortfall of execution vs spot, as a fraction in [0, 1).
    pub fn gross_slippage(&self, amount_in: U256, direction: Direction) -> Result<f64> {
        let (reserve_in, _) = self.reserves_for(direction);
        if reserve_in.is_zero() {
            return Err(empty_pool(amount_in));
        }
        let denominator = reserve_in
            .checked_add(amount_in)
            .ok_or_else(|| AnalysisError::PrecisionOverflow("reserve_in + amount_in".into()))?;
        Ok(u256_to_f64(amount_in) / u256_to_f64(denominator))
    }
}

/// Exact pair output for an exact input, fee taken from the input.
///
/// Both divisions floor in raw units, as the pair contract does: tiny inputs
/// may round to the same output (1 and 2 both give 0 against deep reserves)
/// and fractional outputs are truncated, so 9871.58 comes back as 9871.
pub fn amount_out(amount_in: U256, reserve_in: U256, reserve_out: U256, fee_bps: u32) -> Result<U256> {
    if reserve_in.is_zero() || reserve_out.is_zero() {
        return Err(empty_pool(amount_in));
    }
    if amount_in.is_zero() {
        return Ok(U256::zero());
    }
    if fee_bps >= BPS_DENOMINATOR {
        return Err(AnalysisError::InvalidInput(format!("fee {} bps", fee_bps)));
    }
    let gamma_num = U256::from(BPS_DENOMINATOR - fee_bps);
    let gamma_den = U256::from(BPS_DENOMINATOR);

    let in_after_fee = amount_in
        .checked_mul(gamma_num)
        .ok_or_else(|| AnalysisError::PrecisionOverflow("amount_in * (1 - fee)".into()))?
        / gamma_den;
    let numerator = in_after_fee
        .checked_mul(reserve_out)
        .ok_or_else(|| AnalysisError::PrecisionOverflow("amount_in' * reserve_out".into()))?;
    let denominator = reserve_in
        .checked_add(in_after_fee)
        .ok_or_else(|| AnalysisError::PrecisionOverflow("reserve_in + amount_in'".into()))?;
    Ok(numerator / denominator)
}

fn empty_pool(amount_in: U256) -> AnalysisError {
    let requested = crate::math::u256_to_bigint(amount_in);
    AnalysisError::InsufficientLiquidity { remaining: requested.clone(), requested }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(r0: u64, r1: u64, fee_bps: u32) -> ConstantProductState {
        ConstantProductState::new(U256::from(r0), U256::from(r1), fee_bps).unwrap()
    }

    #[test]
    fn reference_trade_on_balanced_pair() {
        let p = pair(1_000_000, 1_000_000, 30);
        let out = p.amount_out(U256::from(10_000u64), Direction::Forward).unwrap();
        // 9970 * 1e6 / 1_009_970 = 9871.58..
        assert_eq!(out, U256::from(9_871u64));
        let gross = p.gross_slippage(U256::from(10_000u64), Direction::Forward).unwrap();
        assert!((gross * 100.0 - 0.990099).abs() < 1e-6, "gross {}", gross);
    }

    #[test]
    fn output_is_monotonic_and_bounded() {
        let p = pair(5_000_000, 2_000_000, 30);
        for direction in Direction::BOTH {
            let (_, reserve_out) = p.reserves_for(direction);
            let mut last = U256::zero();
            for amount in [1_000u64, 10_000, 100_000, 1_000_000, 50_000_000, 10_000_000_000] {
                let out = p.amount_out(U256::from(amount), direction).unwrap();
                assert!(out > last, "{:?} not increasing at {}", direction, amount);
                assert!(out < reserve_out);
                last = out;
            }
        }
    }

    #[test]
    fn tiny_inputs_floor_to_the_same_output() {
        let p = pair(1_000_000, 1_000_000, 30);
        let one = p.amount_out(U256::one(), Direction::Forward).unwrap();
        let two = p.amount_out(U256::from(2u8), Direction::Forward).unwrap();
        assert_eq!(one, U256::zero());
        assert_eq!(one, two);
        // non-decreasing even where it is flat
        assert!(p.amount_out(U256::from(1_000u64), Direction::Forward).unwrap() >= two);
    }

    #[test]
    fn slippage_grows_with_size_and_stays_below_one() {
        let p = pair(1_000_000, 1_000_000, 30);
        let mut last = 0.0;
        for amount in [1u64, 1_000, 1_000_000, 1_000_000_000_000] {
            let s = p.gross_slippage(U256::from(amount), Direction::Reverse).unwrap();
            assert!(s > last && s < 1.0);
            last = s;
        }
    }

    #[test]
    fn zero_input_and_empty_reserves() {
        let p = pair(1_000, 1_000, 30);
        assert_eq!(p.amount_out(U256::zero(), Direction::Forward).unwrap(), U256::zero());
        let empty = pair(0, 1_000, 30);
        assert!(matches!(
            empty.amount_out(U256::from(5u8), Direction::Forward),
            Err(AnalysisError::InsufficientLiquidity { .. })
        ));
    }

    #[test]
    fn overflow_is_reported_not_wrapped() {
        let p = ConstantProductState::new(U256::MAX / 2, U256::MAX / 2, 30).unwrap();
        assert!(matches!(
            p.amount_out(U256::MAX / 2, Direction::Forward),
            Err(AnalysisError::PrecisionOverflow(_))
        ));
    }

    #[test]
    fn rejects_fee_of_one_hundred_percent() {
        assert!(ConstantProductState::new(U256::one(), U256::one(), 10_000).is_err());
    }
}
