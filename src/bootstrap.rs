use std::str::FromStr;

use ethers::prelude::*;

use crate::chain::eth_client::{EthLedgerClient, PoolKey};
use crate::chain::gate::GatedLedger;
use crate::chain::providers;
use crate::config::Config;
use crate::engine::service::StudyConfig;
use crate::error::{AnalysisError, Result};
use crate::models::{PairDecimals, PoolId};

pub type ArchiveLedger = GatedLedger<EthLedgerClient<Provider<Http>>>;

pub struct AppState {
    pub ledger: ArchiveLedger,
    pub study: StudyConfig,
}

fn address(key: &str, value: &str) -> Result<Address> {
    Address::from_str(value).map_err(|e| AnalysisError::Config(format!("{} {}: {}", key, value, e)))
}

fn pool_id(value: &str) -> Result<PoolId> {
    let bytes = hex::decode(value.trim_start_matches("0x"))
        .map_err(|e| AnalysisError::Config(format!("POOL_ID {}: {}", value, e)))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| AnalysisError::Config(format!("POOL_ID is {} bytes, expected 32", b.len())))
}

impl AppState {
    pub fn new(config: &Config) -> Result<Self> {
        let provider = providers::create_archive_provider(&config.rpc_url)?;

        let key = PoolKey {
            currency0: address("POOL_CURRENCY0", &config.currency0)?,
            currency1: address("POOL_CURRENCY1", &config.currency1)?,
            fee: config.pool_fee_pips,
            tick_spacing: config.pool_tick_spacing,
            hooks: address("POOL_HOOKS", &config.hooks)?,
        };
        let id = match &config.pool_id {
            Some(raw) => pool_id(raw)?,
            None => key.id(),
        };
        log::info!("pool id 0x{}", hex::encode(id));

        let mut client = EthLedgerClient::new(provider, address("UNISWAP_V4_STATE_VIEW", &config.state_view)?)
            .with_pool_id(id, key)
            .with_multicall(
                config
                    .multicall
                    .as_deref()
                    .map(|m| address("MULTICALL_ADDRESS", m))
                    .transpose()?,
            )
            .with_tickinfo_chunk(config.scan.tickinfo_chunk);
        if let Some(quoter) = &config.quoter {
            client = client.with_quoter(address("UNISWAP_V4_QUOTER", quoter)?);
        }

        let vault = config.vault.as_deref().map(|v| address("VAULT_ADDRESS", v)).transpose()?;
        match (vault, &config.vault_module) {
            (Some(vault), Some(module)) => {
                client = client.with_vault_module(vault, address("VAULT_MODULE_ADDRESS", module)?);
            }
            (Some(_), None) => log::warn!("VAULT_MODULE_ADDRESS unset, vault ranges will be gaps"),
            _ => {}
        }

        let study = StudyConfig {
            pool_id: id,
            pair: address("V2_PAIR_ADDRESS", &config.v2_pair)?,
            pair_fee_bps: config.v2_fee_bps,
            vault,
            decimals: PairDecimals { decimals0: config.decimals0, decimals1: config.decimals1 },
            search_start: config.search_start,
            search_end: config.search_end,
            sample_start: config.sample_start,
            sample_end: config.sample_end,
            blocks_per_day: config.blocks_per_day,
            trade_sizes: config.trade_sizes.clone(),
            drop_threshold_pct: config.drop_threshold_pct,
            quote_mode: config.quote_mode,
            price_limit_ticks: config.price_limit_ticks,
            scan: config.scan.clone(),
            fetch: config.fetch.clone(),
            search: config.search.clone(),
        };

        Ok(AppState { ledger: GatedLedger::new(client, config.fetch.clone()), study })
    }
}
