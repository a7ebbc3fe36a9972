// Value objects shared by the ledger client, the models and the analyzers.
// Everything here is built once by a single computation step and never mutated;
// series are append-only vectors owned by the orchestrator.

use ethers::types::U256;
use num_bigint::BigInt;
use num_traits::ToPrimitive;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{AnalysisError, Result};
use crate::math::tick_math::Q96;

/// Position in the append-only ledger.
pub type Height = u64;

/// keccak256 of the ABI-encoded pool key.
pub type PoolId = [u8; 32];

/// Trade direction relative to the fixed (currency0, currency1) ordering.
/// Prices are always quoted as currency1 per currency0.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// currency0 in, currency1 out.
    Forward,
    /// currency1 in, currency0 out.
    Reverse,
}

impl Direction {
    pub const BOTH: [Direction; 2] = [Direction::Forward, Direction::Reverse];

    #[inline]
    pub fn zero_for_one(self) -> bool {
        matches!(self, Direction::Forward)
    }

    pub fn flip(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// Concentrated-liquidity pool state at one height.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct PoolSnapshot {
    pub height: Height,
    pub sqrt_price_x96: BigInt,
    pub active_tick: i32,
    pub active_liquidity: BigInt,
    /// LP fee in hundredths of a basis point (3000 = 0.30%).
    pub fee_pips: u32,
    pub tick_spacing: i32,
}

impl PoolSnapshot {
    pub fn fee_rate_bps(&self) -> f64 {
        self.fee_pips as f64 / 100.0
    }

    /// Raw spot price, currency1 units per currency0 unit.
    pub fn spot_price(&self) -> f64 {
        sqrt_price_x96_to_price(&self.sqrt_price_x96)
    }
}

/// (sqrtP / 2^96)^2 as f64.
pub fn sqrt_price_x96_to_price(sqrt_price_x96: &BigInt) -> f64 {
    let s = sqrt_price_x96.to_f64().unwrap_or(0.0) / Q96 as f64;
    s * s
}

/// One word of a pool's tick bitmap. Absent words are all-zero.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickBitmapWord {
    pub word_index: i32,
    pub bits: U256,
}

impl TickBitmapWord {
    pub fn empty(word_index: i32) -> Self {
        Self { word_index, bits: U256::zero() }
    }

    /// Bit positions that are set, ascending.
    pub fn set_bits(&self, word_width: u32) -> Vec<u32> {
        if self.bits.is_zero() {
            return Vec::new();
        }
        (0..word_width.min(256))
            .filter(|bit| self.bits.bit(*bit as usize))
            .collect()
    }
}

/// Per-tick liquidity as stored by the pool.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickLiquidity {
    pub tick: i32,
    pub liquidity_gross: BigInt,
    pub liquidity_net: BigInt,
}

/// A band between two consecutive boundaries of the scanned window.
///
/// `liquidity_net` is the signed delta recorded at `tick_upper` (zero when the
/// upper bound is the window edge). `liquidity_gross` is the liquidity active
/// inside the band.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiquidityRange {
    pub tick_lower: i32,
    pub tick_upper: i32,
    pub liquidity_net: BigInt,
    pub liquidity_gross: BigInt,
}

/// Tokens locked in one pool at one height, in human units.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct TvlPoint {
    pub height: Height,
    pub amount0: f64,
    pub amount1: f64,
    /// currency1 units, amount0 valued at spot.
    pub value: f64,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TradeQuote {
    pub amount_in: U256,
    pub amount_out: U256,
    pub direction: Direction,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SlippageSample {
    pub height: Height,
    /// Notional trade size in currency1 units.
    pub trade_size: f64,
    pub direction: Direction,
    pub gross_pct: f64,
    pub net_pct: f64,
    /// Move of the marginal price. Unknown for ledger-quoted samples.
    pub price_impact_pct: Option<f64>,
}

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct SeriesKey {
    pub trade_size: f64,
    pub direction: Direction,
}

impl SeriesKey {
    pub fn matches(&self, sample: &SlippageSample) -> bool {
        self.trade_size == sample.trade_size && self.direction == sample.direction
    }
}

/// Height-ordered samples for one (trade size, direction) key.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SlippageSeries {
    pub key: SeriesKey,
    pub samples: Vec<SlippageSample>,
}

impl SlippageSeries {
    pub fn new(key: SeriesKey) -> Self {
        Self { key, samples: Vec::new() }
    }

    pub fn push(&mut self, sample: SlippageSample) -> Result<()> {
        if !self.key.matches(&sample) {
            return Err(AnalysisError::InvalidInput(format!(
                "sample ({}, {:?}) pushed into series ({}, {:?})",
                sample.trade_size, sample.direction, self.key.trade_size, self.key.direction
            )));
        }
        if let Some(last) = self.samples.last() {
            if sample.height < last.height {
                return Err(AnalysisError::InvalidInput(format!(
                    "height {} appended after {}",
                    sample.height, last.height
                )));
            }
        }
        self.samples.push(sample);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// A sample that could not be produced, and why.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq)]
pub struct SampleGap {
    pub height: Height,
    pub trade_size: Option<f64>,
    pub direction: Option<Direction>,
    pub kind: String,
    pub cause: String,
}

impl SampleGap {
    pub fn new(height: Height, key: Option<SeriesKey>, err: &AnalysisError) -> Self {
        Self {
            height,
            trade_size: key.map(|k| k.trade_size),
            direction: key.map(|k| k.direction),
            kind: err.kind().to_string(),
            cause: err.to_string(),
        }
    }
}

/// Underlying token amounts held by a managed vault.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VaultSnapshot {
    pub height: Height,
    pub amount0: U256,
    pub amount1: U256,
}

/// Token decimals needed to express raw amounts in human units.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PairDecimals {
    pub decimals0: u8,
    pub decimals1: u8,
}

impl PairDecimals {
    /// Raw price (currency1 raw per currency0 raw) to human units.
    pub fn human_price(&self, raw_price: f64) -> f64 {
        raw_price * 10f64.powi(self.decimals0 as i32 - self.decimals1 as i32)
    }

    pub fn tvl_point(&self, height: Height, raw0: &BigInt, raw1: &BigInt, raw_spot: f64) -> TvlPoint {
        let amount0 = raw0.to_f64().unwrap_or(f64::INFINITY) / 10f64.powi(self.decimals0 as i32);
        let amount1 = raw1.to_f64().unwrap_or(f64::INFINITY) / 10f64.powi(self.decimals1 as i32);
        TvlPoint {
            height,
            amount0,
            amount1,
            value: amount0 * self.human_price(raw_spot) + amount1,
        }
    }

    /// Raw input amount for a notional expressed in human currency1 units.
    ///
    /// Forward trades sell currency0, so the notional is converted at the raw
    /// spot price.
    pub fn amount_in_for(&self, notional: f64, direction: Direction, raw_spot: f64) -> Result<U256> {
        if !(notional.is_finite() && notional >= 0.0) {
            return Err(AnalysisError::InvalidInput(format!("trade size {}", notional)));
        }
        let raw_notional = notional * 10f64.powi(self.decimals1 as i32);
        let raw_in = match direction {
            Direction::Forward => {
                if !(raw_spot.is_finite() && raw_spot > 0.0) {
                    return Err(AnalysisError::InvalidInput(format!("spot price {}", raw_spot)));
                }
                raw_notional / raw_spot
            }
            Direction::Reverse => raw_notional,
        };
        let rounded = raw_in.round();
        if rounded >= u128::MAX as f64 {
            return Err(AnalysisError::PrecisionOverflow(format!(
                "trade size {} does not fit 128 bits",
                notional
            )));
        }
        Ok(U256::from(rounded as u128))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_flip_round_trips() {
        for d in Direction::BOTH {
            assert_eq!(d.flip().flip(), d);
        }
        assert!(Direction::Forward.zero_for_one());
        assert!(!Direction::Reverse.zero_for_one());
    }

    #[test]
    fn fee_rate_in_basis_points() {
        let snap = PoolSnapshot {
            height: 1,
            sqrt_price_x96: BigInt::from(Q96),
            active_tick: 0,
            active_liquidity: BigInt::from(1u8),
            fee_pips: 3000,
            tick_spacing: 60,
        };
        assert_eq!(snap.fee_rate_bps(), 30.0);
        assert!((snap.spot_price() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bitmap_word_lists_set_bits() {
        let bits = U256::one() | (U256::one() << 7) | (U256::one() << 255);
        let word = TickBitmapWord { word_index: -1, bits };
        assert_eq!(word.set_bits(256), vec![0, 7, 255]);
        assert!(TickBitmapWord::empty(3).set_bits(256).is_empty());
    }

    #[test]
    fn series_rejects_out_of_order_heights() {
        let key = SeriesKey { trade_size: 1000.0, direction: Direction::Forward };
        let mut series = SlippageSeries::new(key);
        let sample = |height| SlippageSample {
            height,
            trade_size: 1000.0,
            direction: Direction::Forward,
            gross_pct: 0.1,
            net_pct: 0.4,
            price_impact_pct: None,
        };
        series.push(sample(10)).unwrap();
        series.push(sample(12)).unwrap();
        assert!(series.push(sample(11)).is_err());
        assert_eq!(series.samples.len(), 2);
    }

    #[test]
    fn notional_converts_through_spot_for_forward_trades() {
        // WETH(18)/USDC(6) at 3000 USDC per WETH: raw spot = 3000e6 / 1e18.
        let dec = PairDecimals { decimals0: 18, decimals1: 6 };
        let raw_spot = 3000.0 * 1e6 / 1e18;
        let fwd = dec.amount_in_for(3000.0, Direction::Forward, raw_spot).unwrap();
        let one_eth = U256::exp10(18);
        let diff = if fwd > one_eth { fwd - one_eth } else { one_eth - fwd };
        assert!(diff < U256::exp10(6), "forward amount {}", fwd);

        let rev = dec.amount_in_for(3000.0, Direction::Reverse, raw_spot).unwrap();
        assert_eq!(rev, U256::from(3_000_000_000u64));
        assert!((dec.human_price(raw_spot) - 3000.0).abs() < 1e-6);
    }

    #[test]
    fn tvl_is_valued_in_currency1() {
        let dec = PairDecimals { decimals0: 18, decimals1: 6 };
        let raw_spot = 3000.0 * 1e6 / 1e18;
        let raw0 = BigInt::from(2u8) * BigInt::from(10u64.pow(18));
        let raw1 = BigInt::from(1_500u64) * BigInt::from(10u64.pow(6));
        let point = dec.tvl_point(9, &raw0, &raw1, raw_spot);
        assert_eq!(point.height, 9);
        assert!((point.amount0 - 2.0).abs() < 1e-12);
        assert!((point.amount1 - 1_500.0).abs() < 1e-9);
        assert!((point.value - 7_500.0).abs() < 1e-6);
    }
}
