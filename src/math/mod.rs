pub mod tick_math;
pub mod constant_product;
pub mod concentrated;
pub mod model;
pub mod position;

use ethers::types::U256;
use num_bigint::{BigInt, Sign};
use num_traits::{Signed, ToPrimitive, Zero};

use crate::error::{AnalysisError, Result};

pub fn u256_to_bigint(u: U256) -> BigInt {
    let mut buf = [0u8; 32];
    u.to_big_endian(&mut buf);
    BigInt::from_bytes_be(Sign::Plus, &buf)
}

pub fn bigint_to_u256(v: &BigInt) -> Result<U256> {
    if v.is_negative() {
        return Err(AnalysisError::InvalidInput(format!("negative amount {}", v)));
    }
    if v.bits() > 256 {
        return Err(AnalysisError::PrecisionOverflow(format!("{} exceeds 256 bits", v)));
    }
    let (_, bytes) = v.to_bytes_be();
    Ok(U256::from_big_endian(&bytes))
}

/// num / den as f64 without losing precision on huge operands.
pub fn ratio_f64(num: &BigInt, den: &BigInt) -> f64 {
    if den.is_zero() {
        return f64::INFINITY;
    }
    let scale = BigInt::from(10u64).pow(18);
    let scaled = (num * &scale) / den;
    scaled.to_f64().unwrap_or(f64::INFINITY) / 1e18
}

pub fn u256_to_f64(u: U256) -> f64 {
    u256_to_bigint(u).to_f64().unwrap_or(f64::INFINITY)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn u256_bigint_conversions_agree() {
        for val in [
            U256::zero(),
            U256::one(),
            U256::from(u64::MAX),
            U256::from(u128::MAX),
            U256::MAX,
        ] {
            let big = u256_to_bigint(val);
            assert_eq!(big.to_string(), val.to_string());
            assert_eq!(bigint_to_u256(&big).unwrap(), val);
        }
    }

    #[test]
    fn oversized_bigint_is_an_overflow() {
        let too_big = BigInt::from(1u8) << 256;
        assert!(matches!(
            bigint_to_u256(&too_big),
            Err(AnalysisError::PrecisionOverflow(_))
        ));
        assert!(bigint_to_u256(&BigInt::from(-1)).is_err());
    }

    #[test]
    fn ratio_keeps_precision_for_wide_operands() {
        let den = BigInt::from(1u8) << 200;
        let num = &den * 3 / 4;
        assert!((ratio_f64(&num, &den) - 0.75).abs() < 1e-15);
        assert_eq!(ratio_f64(&num, &BigInt::zero()), f64::INFINITY);
    }
}
