//! Typed, height-explicit reads against the append-only ledger.

use async_trait::async_trait;
use ethers::types::{Address, U256};

use crate::error::{AnalysisError, Result};
use crate::models::{Direction, Height, PoolId, PoolSnapshot, TickBitmapWord, TickLiquidity};

/// Point-in-time reads and trade simulation. Every call names its height;
/// there is no implicit "latest".
///
/// Implementations must be safe to call concurrently. Retry and rate limiting
/// live in [`crate::chain::gate::GatedLedger`].
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Fails with `NotInitialized` if the pool did not exist yet.
    async fn get_snapshot(&self, pool: PoolId, height: Height) -> Result<PoolSnapshot>;

    async fn get_bitmap_word(&self, pool: PoolId, word_index: i32, height: Height) -> Result<TickBitmapWord>;

    async fn get_tick_liquidity(&self, pool: PoolId, tick: i32, height: Height) -> Result<TickLiquidity>;

    /// Simulated exact-input trade. Fails with `Revert` if it cannot execute.
    async fn quote(&self, pool: PoolId, amount_in: U256, direction: Direction, height: Height) -> Result<U256>;

    async fn get_reserves(&self, pair: Address, height: Height) -> Result<(U256, U256)>;

    async fn get_vault_underlying(&self, vault: Address, height: Height) -> Result<(U256, U256)>;

    async fn get_vault_ranges(&self, vault: Address, height: Height) -> Result<Vec<(i32, i32)>>;

    /// Unix seconds of the block at `height`.
    async fn get_timestamp(&self, height: Height) -> Result<i64>;

    /// Same results as issuing each call on its own, in order.
    async fn batch(&self, calls: Vec<LedgerCall>) -> Vec<Result<LedgerResponse>> {
        let mut out = Vec::with_capacity(calls.len());
        for call in calls {
            out.push(dispatch(self, call).await);
        }
        out
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LedgerCall {
    Snapshot { pool: PoolId, height: Height },
    BitmapWord { pool: PoolId, word_index: i32, height: Height },
    TickLiquidity { pool: PoolId, tick: i32, height: Height },
    Quote { pool: PoolId, amount_in: U256, direction: Direction, height: Height },
    Reserves { pair: Address, height: Height },
    VaultUnderlying { vault: Address, height: Height },
    VaultRanges { vault: Address, height: Height },
    Timestamp { height: Height },
}

impl LedgerCall {
    pub fn height(&self) -> Height {
        match self {
            LedgerCall::Snapshot { height, .. }
            | LedgerCall::BitmapWord { height, .. }
            | LedgerCall::TickLiquidity { height, .. }
            | LedgerCall::Quote { height, .. }
            | LedgerCall::Reserves { height, .. }
            | LedgerCall::VaultUnderlying { height, .. }
            | LedgerCall::VaultRanges { height, .. }
            | LedgerCall::Timestamp { height } => *height,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LedgerResponse {
    Snapshot(PoolSnapshot),
    BitmapWord(TickBitmapWord),
    TickLiquidity(TickLiquidity),
    Quote(U256),
    Reserves(U256, U256),
    VaultUnderlying(U256, U256),
    VaultRanges(Vec<(i32, i32)>),
    Timestamp(i64),
}

impl LedgerResponse {
    pub fn into_bitmap_word(self) -> Result<TickBitmapWord> {
        match self {
            LedgerResponse::BitmapWord(w) => Ok(w),
            other => Err(unexpected("bitmap word", &other)),
        }
    }

    pub fn into_tick_liquidity(self) -> Result<TickLiquidity> {
        match self {
            LedgerResponse::TickLiquidity(t) => Ok(t),
            other => Err(unexpected("tick liquidity", &other)),
        }
    }

    pub fn into_snapshot(self) -> Result<PoolSnapshot> {
        match self {
            LedgerResponse::Snapshot(s) => Ok(s),
            other => Err(unexpected("snapshot", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &LedgerResponse) -> AnalysisError {
    AnalysisError::InvalidInput(format!("expected {} response, got {:?}", wanted, got))
}

/// Issue one call through the typed interface.
pub async fn dispatch<C: LedgerClient + ?Sized>(client: &C, call: LedgerCall) -> Result<LedgerResponse> {
    Ok(match call {
        LedgerCall::Snapshot { pool, height } => LedgerResponse::Snapshot(client.get_snapshot(pool, height).await?),
        LedgerCall::BitmapWord { pool, word_index, height } => {
            LedgerResponse::BitmapWord(client.get_bitmap_word(pool, word_index, height).await?)
        }
        LedgerCall::TickLiquidity { pool, tick, height } => {
            LedgerResponse::TickLiquidity(client.get_tick_liquidity(pool, tick, height).await?)
        }
        LedgerCall::Quote { pool, amount_in, direction, height } => {
            LedgerResponse::Quote(client.quote(pool, amount_in, direction, height).await?)
        }
        LedgerCall::Reserves { pair, height } => {
            let (r0, r1) = client.get_reserves(pair, height).await?;
            LedgerResponse::Reserves(r0, r1)
        }
        LedgerCall::VaultUnderlying { vault, height } => {
            let (a0, a1) = client.get_vault_underlying(vault, height).await?;
            LedgerResponse::VaultUnderlying(a0, a1)
        }
        LedgerCall::VaultRanges { vault, height } => {
            LedgerResponse::VaultRanges(client.get_vault_ranges(vault, height).await?)
        }
        LedgerCall::Timestamp { height } => LedgerResponse::Timestamp(client.get_timestamp(height).await?),
    })
}
