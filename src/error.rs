use num_bigint::BigInt;
use thiserror::Error;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::models::Height;

/// Which side of the searched range the transition lies on when the range
/// does not bracket it.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchSide {
    BeforeRange,
    AfterRange,
}

/// The series that stays cheaper across every sampled trade size.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheaperSeries {
    First,
    Second,
    /// Both curves coincide at every sample.
    Neither,
}

#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    #[error("entity not initialized at height {height}")]
    NotInitialized { height: Height },

    #[error("predicate is not monotonic: true at {true_at}, false again at {false_at}")]
    AmbiguousBoundary { true_at: Height, false_at: Height },

    #[error("search range does not bracket the transition ({0:?})")]
    NotFound(SearchSide),

    #[error("scanned liquidity {scanned} at tick {tick} does not match active liquidity {expected}")]
    InconsistentLiquidity {
        tick: i32,
        scanned: BigInt,
        expected: BigInt,
    },

    #[error("insufficient liquidity: {remaining} of {requested} input left unfilled")]
    InsufficientLiquidity { requested: BigInt, remaining: BigInt },

    #[error("quoted {amount_out} out for {amount_in} in, better than the spot price")]
    QuoteAboveSpot { amount_in: BigInt, amount_out: BigInt },

    #[error("fixed-point overflow in {0}")]
    PrecisionOverflow(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("call reverted: {0}")]
    Revert(String),

    #[error("no breakeven in sampled range ({cheaper:?} series cheaper everywhere)")]
    NoBreakeven { cheaper: CheaperSeries },

    #[error("decomposition drift {drift:e} at index {index}")]
    DecompositionDrift { index: usize, drift: f64 },

    #[error("{gaps} of {samples} samples failed, above the {limit} gap limit")]
    TooManyGaps { gaps: usize, samples: usize, limit: f64 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AnalysisError {
    /// Retryable with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, AnalysisError::Rpc(_))
    }

    /// Aborts the whole job instead of becoming a gap.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AnalysisError::PrecisionOverflow(_))
    }

    /// Short stable label used in gap manifests.
    pub fn kind(&self) -> &'static str {
        match self {
            AnalysisError::NotInitialized { .. } => "not_initialized",
            AnalysisError::AmbiguousBoundary { .. } => "ambiguous_boundary",
            AnalysisError::NotFound(_) => "not_found",
            AnalysisError::InconsistentLiquidity { .. } => "inconsistent_liquidity",
            AnalysisError::InsufficientLiquidity { .. } => "insufficient_liquidity",
            AnalysisError::QuoteAboveSpot { .. } => "quote_above_spot",
            AnalysisError::PrecisionOverflow(_) => "precision_overflow",
            AnalysisError::Rpc(_) => "rpc",
            AnalysisError::Revert(_) => "revert",
            AnalysisError::NoBreakeven { .. } => "no_breakeven",
            AnalysisError::DecompositionDrift { .. } => "decomposition_drift",
            AnalysisError::TooManyGaps { .. } => "too_many_gaps",
            AnalysisError::InvalidInput(_) => "invalid_input",
            AnalysisError::Config(_) => "config",
        }
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rpc_errors_are_retried() {
        assert!(AnalysisError::Rpc("timeout".into()).is_transient());
        assert!(!AnalysisError::Revert("SPL".into()).is_transient());
        assert!(!AnalysisError::NotInitialized { height: 1 }.is_transient());
    }

    #[test]
    fn overflow_is_the_only_fatal_sample_error() {
        assert!(AnalysisError::PrecisionOverflow("sqrt price".into()).is_fatal());
        let insufficient = AnalysisError::InsufficientLiquidity {
            requested: BigInt::from(10),
            remaining: BigInt::from(3),
        };
        assert!(!insufficient.is_fatal());
        assert_eq!(insufficient.kind(), "insufficient_liquidity");
        let surplus = AnalysisError::QuoteAboveSpot {
            amount_in: BigInt::from(1_000),
            amount_out: BigInt::from(1_001),
        };
        assert!(!surplus.is_fatal() && !surplus.is_transient());
        assert_eq!(surplus.kind(), "quote_above_spot");
    }

    #[test]
    fn display_names_the_search_side() {
        let err = AnalysisError::NotFound(SearchSide::AfterRange);
        assert_eq!(
            err.to_string(),
            "search range does not bracket the transition (AfterRange)"
        );
    }
}
