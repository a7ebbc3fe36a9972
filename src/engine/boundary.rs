// Transition search over ledger heights
// -----------------------------------
// The predicate is false for every height before an event and true at and after
// it. Steps are sequential: each one depends on the previous answer, and each
// is one or more ledger reads.
//
// Monotonicity is not re-checked inside the loop. `check_monotonic` samples a
// few interior heights up front for callers that need that guarantee.

use std::future::Future;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::config::SearchConfig;
use crate::error::{AnalysisError, Result, SearchSide};
use crate::models::Height;

#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BoundaryHit {
    /// Smallest height where the predicate holds.
    pub height: Height,
    /// Interior steps spent, endpoint checks excluded.
    pub steps: u32,
}

/// Smallest `b` in `(lo, hi]` with `P(b)` true, for `P(lo)` false and `P(hi)` true.
pub async fn find_boundary<F, Fut>(lo: Height, hi: Height, predicate: F) -> Result<BoundaryHit>
where
    F: Fn(Height) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    if lo >= hi {
        return Err(AnalysisError::InvalidInput(format!("empty search range [{}, {}]", lo, hi)));
    }
    if predicate(lo).await? {
        return Err(AnalysisError::NotFound(SearchSide::BeforeRange));
    }
    if !predicate(hi).await? {
        return Err(AnalysisError::NotFound(SearchSide::AfterRange));
    }

    // P(lo) is known false, so the answer lies in (lo, hi]
    let (mut lo, mut hi) = (lo + 1, hi);
    let mut steps = 0u32;
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        steps += 1;
        if predicate(mid).await? {
            hi = mid;
        } else {
            lo = mid + 1;
        }
        log::debug!("step {} at {}: window now [{}, {}]", steps, mid, lo, hi);
    }
    Ok(BoundaryHit { height: lo, steps })
}

/// Evaluate `points` evenly spaced interior heights and fail with
/// `AmbiguousBoundary` if a true answer is followed by a false one.
pub async fn check_monotonic<F, Fut>(lo: Height, hi: Height, points: usize, predicate: F) -> Result<()>
where
    F: Fn(Height) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    if points == 0 || hi <= lo + 1 {
        return Ok(());
    }
    let span = (hi - lo) as u128;
    let mut first_true: Option<Height> = None;
    let mut last = None;
    for i in 1..=points as u128 {
        let h = lo + (span * i / (points as u128 + 1)) as Height;
        if last == Some(h) {
            continue;
        }
        last = Some(h);
        match (predicate(h).await?, first_true) {
            (true, None) => first_true = Some(h),
            (false, Some(true_at)) => {
                return Err(AnalysisError::AmbiguousBoundary { true_at, false_at: h });
            }
            _ => {}
        }
    }
    Ok(())
}

/// Monotonicity check followed by the search.
pub async fn locate_transition<F, Fut>(
    what: &str,
    lo: Height,
    hi: Height,
    config: &SearchConfig,
    predicate: F,
) -> Result<BoundaryHit>
where
    F: Fn(Height) -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    log::info!("searching {} in [{}, {}]", what, lo, hi);
    check_monotonic(lo, hi, config.monotonic_check_points, &predicate).await?;
    let hit = find_boundary(lo, hi, &predicate).await?;
    log::info!("{} at height {} after {} steps", what, hit.height, hit.steps);
    Ok(hit)
}
