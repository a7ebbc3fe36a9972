use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use ethers::abi::{self, ParamType, Token};
use ethers::contract::{abigen, ContractError, Multicall};
use ethers::prelude::*;
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::utils::{id, keccak256};
use num_bigint::BigInt;

use crate::chain::ledger::{dispatch, LedgerCall, LedgerClient, LedgerResponse};
use crate::error::{AnalysisError, Result};
use crate::math::u256_to_bigint;
use crate::models::{Direction, Height, PoolId, PoolSnapshot, TickBitmapWord, TickLiquidity};

abigen!(
    StateView,
    r#"[
      {
        "type": "function",
        "name": "getSlot0",
        "stateMutability": "view",
        "inputs": [{"name": "poolId", "type": "bytes32"}],
        "outputs": [
          {"name": "sqrtPriceX96", "type": "uint160"},
          {"name": "tick", "type": "int24"},
          {"name": "protocolFee", "type": "uint24"},
          {"name": "lpFee", "type": "uint24"}
        ]
      },
      {
        "type": "function",
        "name": "getLiquidity",
        "stateMutability": "view",
        "inputs": [{"name": "poolId", "type": "bytes32"}],
        "outputs": [{"name": "liquidity", "type": "uint128"}]
      },
      {
        "type": "function",
        "name": "getTickInfo",
        "stateMutability": "view",
        "inputs": [
          {"name": "poolId", "type": "bytes32"},
          {"name": "tick", "type": "int24"}
        ],
        "outputs": [
          {"name": "liquidityGross", "type": "uint128"},
          {"name": "liquidityNet", "type": "int128"},
          {"name": "feeGrowthOutside0X128", "type": "uint256"},
          {"name": "feeGrowthOutside1X128", "type": "uint256"}
        ]
      },
      {
        "type": "function",
        "name": "getTickBitmap",
        "stateMutability": "view",
        "inputs": [
          {"name": "poolId", "type": "bytes32"},
          {"name": "wordPos", "type": "int16"}
        ],
        "outputs": [{"name": "word", "type": "uint256"}]
      }
    ]"#
);

abigen!(
    UniswapV2Pair,
    r#"[
      {
        "type": "function",
        "name": "getReserves",
        "stateMutability": "view",
        "inputs": [],
        "outputs": [
          {"name": "reserve0", "type": "uint112"},
          {"name": "reserve1", "type": "uint112"},
          {"name": "blockTimestampLast", "type": "uint32"}
        ]
      }
    ]"#
);

abigen!(
    ManagedVault,
    r#"[
      {
        "type": "function",
        "name": "totalUnderlying",
        "stateMutability": "view",
        "inputs": [],
        "outputs": [
          {"name": "amount0", "type": "uint256"},
          {"name": "amount1", "type": "uint256"}
        ]
      }
    ]"#
);

abigen!(
    VaultModule,
    r#"[
      {
        "type": "function",
        "name": "getRanges",
        "stateMutability": "view",
        "inputs": [],
        "outputs": [
          {
            "name": "ranges",
            "type": "tuple[]",
            "components": [
              {"name": "tickLower", "type": "int24"},
              {"name": "tickUpper", "type": "int24"}
            ]
          }
        ]
      }
    ]"#
);

const QUOTE_EXACT_INPUT_SINGLE: &str =
    "quoteExactInputSingle(((address,address,uint24,int24,address),bool,uint128,bytes))";

/// v4 pool key; its keccak is the pool id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolKey {
    pub currency0: Address,
    pub currency1: Address,
    pub fee: u32,
    pub tick_spacing: i32,
    pub hooks: Address,
}

impl PoolKey {
    fn token(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.currency0),
            Token::Address(self.currency1),
            Token::Uint(U256::from(self.fee)),
            Token::Int(I256::from(self.tick_spacing).into_raw()),
            Token::Address(self.hooks),
        ])
    }

    pub fn id(&self) -> PoolId {
        keccak256(abi::encode(&[self.token()]))
    }
}

/// Calldata for the v4 quoter's exact-input single-pool quote.
pub fn quote_calldata(key: &PoolKey, direction: Direction, amount_in: U256) -> Result<Bytes> {
    if amount_in.bits() > 128 {
        return Err(AnalysisError::PrecisionOverflow(format!("quote amount {} exceeds uint128", amount_in)));
    }
    let params = Token::Tuple(vec![
        key.token(),
        Token::Bool(direction.zero_for_one()),
        Token::Uint(amount_in),
        Token::Bytes(Vec::new()),
    ]);
    let mut data = id(QUOTE_EXACT_INPUT_SINGLE).to_vec();
    data.extend(abi::encode(&[params]));
    Ok(Bytes::from(data))
}

/// Sign-extend a raw int word.
fn int_to_bigint(raw: U256) -> BigInt {
    let mut buf = [0u8; 32];
    raw.to_big_endian(&mut buf);
    BigInt::from_signed_bytes_be(&buf)
}

fn classify_message(msg: String) -> AnalysisError {
    let lower = msg.to_ascii_lowercase();
    if lower.contains("revert") || lower.contains("missing trie node") || lower.contains("header not found") {
        // reverted, or the node no longer serves that height
        AnalysisError::Revert(msg)
    } else {
        AnalysisError::Rpc(msg)
    }
}

fn contract_error<M: Middleware>(err: ContractError<M>, height: Height) -> AnalysisError {
    match err {
        ContractError::Revert(data) => AnalysisError::Revert(format!("0x{}", hex::encode(&data))),
        // empty return data: nothing deployed there yet
        ContractError::DecodingError(_) | ContractError::DetokenizationError(_) | ContractError::AbiError(_) => {
            AnalysisError::NotInitialized { height }
        }
        other => classify_message(other.to_string()),
    }
}

pub struct EthLedgerClient<M> {
    client: Arc<M>,
    state_view: StateView<M>,
    quoter: Option<Address>,
    multicall: Option<Address>,
    vault_modules: HashMap<Address, Address>,
    pools: HashMap<PoolId, PoolKey>,
    tickinfo_chunk: usize,
}

impl<M: Middleware + 'static> EthLedgerClient<M> {
    pub fn new(client: Arc<M>, state_view: Address) -> Self {
        Self {
            state_view: StateView::new(state_view, client.clone()),
            client,
            quoter: None,
            multicall: None,
            vault_modules: HashMap::new(),
            pools: HashMap::new(),
            tickinfo_chunk: 512,
        }
    }

    /// Register a pool under the id derived from its key.
    pub fn with_pool(self, key: PoolKey) -> Self {
        let id = key.id();
        self.with_pool_id(id, key)
    }

    pub fn with_pool_id(mut self, id: PoolId, key: PoolKey) -> Self {
        self.pools.insert(id, key);
        self
    }

    pub fn with_quoter(mut self, quoter: Address) -> Self {
        self.quoter = Some(quoter);
        self
    }

    pub fn with_multicall(mut self, multicall: Option<Address>) -> Self {
        self.multicall = multicall;
        self
    }

    /// Range reads for `vault` go to its liquidity module.
    pub fn with_vault_module(mut self, vault: Address, module: Address) -> Self {
        self.vault_modules.insert(vault, module);
        self
    }

    pub fn with_tickinfo_chunk(mut self, chunk: usize) -> Self {
        self.tickinfo_chunk = chunk.max(1);
        self
    }

    fn key(&self, pool: &PoolId) -> Result<&PoolKey> {
        self.pools
            .get(pool)
            .ok_or_else(|| AnalysisError::InvalidInput(format!("unregistered pool 0x{}", hex::encode(pool))))
    }

    fn word_position(word_index: i32) -> Result<i16> {
        i16::try_from(word_index)
            .map_err(|_| AnalysisError::InvalidInput(format!("word index {} outside int16", word_index)))
    }

    /// Bitmap words and tick infos for one pool and height, over Multicall.
    async fn multicall_reads(
        &self,
        pool: PoolId,
        height: Height,
        calls: &[(usize, LedgerCall)],
    ) -> Result<Vec<(usize, Result<LedgerResponse>)>> {
        let mut out = Vec::with_capacity(calls.len());
        for chunk in calls.chunks(self.tickinfo_chunk) {
            let mut mc = Multicall::new(self.client.clone(), self.multicall)
                .await
                .map_err(|e| classify_message(e.to_string()))?
                .block(height);
            for (_, call) in chunk {
                match call {
                    LedgerCall::BitmapWord { word_index, .. } => {
                        mc.add_call(self.state_view.get_tick_bitmap(pool, Self::word_position(*word_index)?), true);
                    }
                    LedgerCall::TickLiquidity { tick, .. } => {
                        mc.add_call(self.state_view.get_tick_info(pool, *tick), true);
                    }
                    other => {
                        return Err(AnalysisError::InvalidInput(format!("{:?} is not a multicall read", other)))
                    }
                }
            }
            let raw = mc.call_raw().await.map_err(|e| classify_message(e.to_string()))?;
            for ((idx, call), res) in chunk.iter().zip(raw) {
                let decoded = match res {
                    Err(revert) => Err(AnalysisError::Revert(format!("0x{}", hex::encode(&revert)))),
                    Ok(token) => decode_read(call, token),
                };
                out.push((*idx, decoded));
            }
        }
        Ok(out)
    }
}

fn decode_read(call: &LedgerCall, token: Token) -> Result<LedgerResponse> {
    let malformed = || AnalysisError::Rpc(format!("malformed multicall result for {:?}", call));
    match call {
        LedgerCall::BitmapWord { word_index, .. } => {
            let bits = token.into_uint().ok_or_else(malformed)?;
            Ok(LedgerResponse::BitmapWord(TickBitmapWord { word_index: *word_index, bits }))
        }
        LedgerCall::TickLiquidity { tick, .. } => {
            let fields = token.into_tuple().ok_or_else(malformed)?;
            let gross = fields.first().cloned().and_then(Token::into_uint).ok_or_else(malformed)?;
            let net = fields.get(1).cloned().and_then(Token::into_int).ok_or_else(malformed)?;
            Ok(LedgerResponse::TickLiquidity(TickLiquidity {
                tick: *tick,
                liquidity_gross: u256_to_bigint(gross),
                liquidity_net: int_to_bigint(net),
            }))
        }
        _ => Err(malformed()),
    }
}

#[async_trait]
impl<M: Middleware + 'static> LedgerClient for EthLedgerClient<M> {
    async fn get_snapshot(&self, pool: PoolId, height: Height) -> Result<PoolSnapshot> {
        let key = self.key(&pool)?;
        let slot0_call = self.state_view.get_slot_0(pool).block(height);
        let liquidity_call = self.state_view.get_liquidity(pool).block(height);
        let ((sqrt_price_x96, tick, _protocol_fee, lp_fee), liquidity) =
            tokio::try_join!(slot0_call.call(), liquidity_call.call()).map_err(|e| contract_error(e, height))?;

        if sqrt_price_x96.is_zero() {
            return Err(AnalysisError::NotInitialized { height });
        }
        log::debug!("slot0 at {}: tick {}, liquidity {}", height, tick, liquidity);
        Ok(PoolSnapshot {
            height,
            sqrt_price_x96: u256_to_bigint(sqrt_price_x96),
            active_tick: tick,
            active_liquidity: BigInt::from(liquidity),
            fee_pips: lp_fee,
            tick_spacing: key.tick_spacing,
        })
    }

    async fn get_bitmap_word(&self, pool: PoolId, word_index: i32, height: Height) -> Result<TickBitmapWord> {
        let bits = self
            .state_view
            .get_tick_bitmap(pool, Self::word_position(word_index)?)
            .block(height)
            .call()
            .await
            .map_err(|e| contract_error(e, height))?;
        Ok(TickBitmapWord { word_index, bits })
    }

    async fn get_tick_liquidity(&self, pool: PoolId, tick: i32, height: Height) -> Result<TickLiquidity> {
        let (gross, net, _, _) = self
            .state_view
            .get_tick_info(pool, tick)
            .block(height)
            .call()
            .await
            .map_err(|e| contract_error(e, height))?;
        Ok(TickLiquidity {
            tick,
            liquidity_gross: BigInt::from(gross),
            liquidity_net: BigInt::from(net),
        })
    }

    async fn quote(&self, pool: PoolId, amount_in: U256, direction: Direction, height: Height) -> Result<U256> {
        let quoter = self
            .quoter
            .ok_or_else(|| AnalysisError::InvalidInput("no quoter address configured".into()))?;
        let key = self.key(&pool)?;
        let tx: TypedTransaction = TransactionRequest::new()
            .to(quoter)
            .data(quote_calldata(key, direction, amount_in)?)
            .into();
        let raw = self
            .client
            .call(&tx, Some(BlockId::from(height)))
            .await
            .map_err(|e| classify_message(e.to_string()))?;
        let tokens = abi::decode(&[ParamType::Uint(256), ParamType::Uint(256)], &raw)
            .map_err(|e| AnalysisError::Revert(format!("undecodable quote: {}", e)))?;
        tokens
            .into_iter()
            .next()
            .and_then(Token::into_uint)
            .ok_or_else(|| AnalysisError::Revert("empty quote".into()))
    }

    async fn get_reserves(&self, pair: Address, height: Height) -> Result<(U256, U256)> {
        let (r0, r1, _) = UniswapV2Pair::new(pair, self.client.clone())
            .get_reserves()
            .block(height)
            .call()
            .await
            .map_err(|e| contract_error(e, height))?;
        Ok((U256::from(r0), U256::from(r1)))
    }

    async fn get_vault_underlying(&self, vault: Address, height: Height) -> Result<(U256, U256)> {
        ManagedVault::new(vault, self.client.clone())
            .total_underlying()
            .block(height)
            .call()
            .await
            .map_err(|e| contract_error(e, height))
    }

    async fn get_vault_ranges(&self, vault: Address, height: Height) -> Result<Vec<(i32, i32)>> {
        let module = self.vault_modules.get(&vault).copied().unwrap_or(vault);
        VaultModule::new(module, self.client.clone())
            .get_ranges()
            .block(height)
            .call()
            .await
            .map_err(|e| contract_error(e, height))
    }

    async fn get_timestamp(&self, height: Height) -> Result<i64> {
        let block = self
            .client
            .get_block(height)
            .await
            .map_err(|e| classify_message(e.to_string()))?
            .ok_or_else(|| AnalysisError::Rpc(format!("block {} not available", height)))?;
        Ok(block.timestamp.low_u64() as i64)
    }

    /// Bitmap and tick reads go through Multicall grouped by (pool, height);
    /// everything else is issued one by one.
    async fn batch(&self, calls: Vec<LedgerCall>) -> Vec<Result<LedgerResponse>> {
        let mut results: Vec<Option<Result<LedgerResponse>>> = vec![None; calls.len()];
        let mut groups: BTreeMap<(PoolId, Height), Vec<(usize, LedgerCall)>> = BTreeMap::new();

        for (idx, call) in calls.iter().enumerate() {
            match call {
                LedgerCall::BitmapWord { pool, height, .. } | LedgerCall::TickLiquidity { pool, height, .. } => {
                    groups.entry((*pool, *height)).or_default().push((idx, call.clone()));
                }
                _ => results[idx] = Some(dispatch(self, call.clone()).await),
            }
        }

        for ((pool, height), group) in groups {
            match self.multicall_reads(pool, height, &group).await {
                Ok(decoded) => {
                    for (idx, res) in decoded {
                        results[idx] = Some(res);
                    }
                }
                Err(e) => {
                    log::warn!("multicall at {} failed: {}", height, e);
                    for (idx, _) in group {
                        results[idx] = Some(Err(e.clone()));
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(AnalysisError::Rpc("call dropped from batch".into()))))
            .collect()
    }
}
