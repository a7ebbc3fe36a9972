use ethers::types::U256;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::math::concentrated::ConcentratedState;
use crate::math::constant_product::ConstantProductState;
use crate::models::{Direction, TradeQuote};

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ModelKind {
    ConstantProduct,
    ConcentratedLiquidity,
}

/// Pricing state of one pool, tagged by AMM design.
#[derive(Clone, Debug)]
pub enum AmmModel {
    ConstantProduct(ConstantProductState),
    ConcentratedLiquidity(ConcentratedState),
}

/// Result of [`AmmModel::quote`]. Percentages are in percent (0.99 = 0.99%).
#[derive(Clone, Debug, PartialEq)]
pub struct ModelQuote {
    pub quote: TradeQuote,
    pub gross_pct: f64,
    pub net_pct: f64,
    pub price_impact_pct: f64,
}

impl AmmModel {
    pub fn kind(&self) -> ModelKind {
        match self {
            AmmModel::ConstantProduct(_) => ModelKind::ConstantProduct,
            AmmModel::ConcentratedLiquidity(_) => ModelKind::ConcentratedLiquidity,
        }
    }

    pub fn fee_rate_bps(&self) -> f64 {
        match self {
            AmmModel::ConstantProduct(s) => s.fee_bps as f64,
            AmmModel::ConcentratedLiquidity(s) => s.fee_pips as f64 / 100.0,
        }
    }

    /// Raw spot price, currency1 per currency0.
    pub fn spot_price(&self) -> f64 {
        match self {
            AmmModel::ConstantProduct(s) => s.spot_price(),
            AmmModel::ConcentratedLiquidity(s) => s.spot_price(),
        }
    }

    pub fn quote(&self, amount_in: U256, direction: Direction) -> Result<ModelQuote> {
        let (amount_out, gross_fraction, impact_fraction) = match self {
            AmmModel::ConstantProduct(state) => {
                let out = state.amount_out(amount_in, direction)?;
                let gross = state.gross_slippage(amount_in, direction)?;
                // marginal price moves by (R_in / (R_in + in))^2
                let impact = 1.0 - (1.0 - gross) * (1.0 - gross);
                (out, gross, impact)
            }
            AmmModel::ConcentratedLiquidity(state) => {
                let q = state.quote(amount_in, direction)?;
                (q.amount_out, q.gross_fraction, q.price_impact_fraction)
            }
        };
        assert!(
            gross_fraction >= 0.0,
            "negative gross slippage {} from {:?} model",
            gross_fraction,
            self.kind()
        );
        let gross_pct = gross_fraction * 100.0;
        Ok(ModelQuote {
            quote: TradeQuote { amount_in, amount_out, direction },
            gross_pct,
            net_pct: net_from_gross(gross_pct, self.fee_rate_bps()),
            price_impact_pct: impact_fraction * 100.0,
        })
    }
}

/// net = gross + fee, both in percent.
#[inline]
pub fn net_from_gross(gross_pct: f64, fee_rate_bps: f64) -> f64 {
    gross_pct + fee_rate_bps / 100.0
}

/// Inverse for ledger-quoted executions; floors at zero.
#[inline]
pub fn gross_from_net(net_pct: f64, fee_rate_bps: f64) -> f64 {
    (net_pct - fee_rate_bps / 100.0).max(0.0)
}
