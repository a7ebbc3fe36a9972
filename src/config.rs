use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AnalysisError, Result};
use crate::math::tick_math::{MAX_TICK, MIN_TICK};

/// Ledger access limits shared by every job.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Requests in flight at once, across the whole process.
    pub concurrency: usize,
    pub request_timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// A sampling job aborts once this share of its samples are gaps.
    pub max_gap_fraction: f64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 8,
            request_timeout: Duration::from_secs(20),
            max_attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(8),
            max_gap_fraction: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Bits per bitmap word (256 on chain).
    pub word_width: u32,
    /// Ticks scanned on each side of the active tick.
    pub radius_ticks: i32,
    /// Tick reads per batched round trip.
    pub tickinfo_chunk: usize,
    /// Batched round trips in flight per scan.
    pub parallel_chunks: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            word_width: 256,
            radius_ticks: 200_000,
            tickinfo_chunk: 512,
            parallel_chunks: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    /// Interior points sampled before a boundary search to reject
    /// non-monotonic predicates. Zero disables the check.
    pub monotonic_check_points: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self { monotonic_check_points: 4 }
    }
}

/// Where concentrated-liquidity execution amounts come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuoteMode {
    /// Local traversal over the scanned ticks.
    Simulated,
    /// The ledger's own quoter at that height.
    Ledger,
}

impl FromStr for QuoteMode {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "simulated" | "local" => Ok(QuoteMode::Simulated),
            "ledger" | "quoter" => Ok(QuoteMode::Ledger),
            other => Err(AnalysisError::Config(format!("unknown QUOTE_MODE {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_url: String,
    pub state_view: String,
    pub quoter: Option<String>,
    pub multicall: Option<String>,

    // v4 pool key
    pub currency0: String,
    pub currency1: String,
    pub pool_fee_pips: u32,
    pub pool_tick_spacing: i32,
    pub hooks: String,
    /// Overrides the id derived from the key.
    pub pool_id: Option<String>,

    // v2 pair
    pub v2_pair: String,
    pub v2_fee_bps: u32,

    // managed vault
    pub vault: Option<String>,
    pub vault_module: Option<String>,

    pub decimals0: u8,
    pub decimals1: u8,

    // heights
    pub search_start: u64,
    pub search_end: u64,
    pub sample_start: Option<u64>,
    pub sample_end: u64,
    pub blocks_per_day: u64,

    /// Notional sizes in currency1 units.
    pub trade_sizes: Vec<f64>,
    pub drop_threshold_pct: f64,
    pub quote_mode: QuoteMode,
    /// (lower, upper) ticks simulated pool trades may not cross.
    pub price_limit_ticks: Option<(i32, i32)>,

    pub scan: ScanConfig,
    pub fetch: FetchConfig,
    pub search: SearchConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        // secrets first, then public config
        dotenv::from_filename("secrets.env").ok();
        dotenv::from_filename("config/migration.env").ok();
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);

        let scan = ScanConfig {
            word_width: vars.parsed("SCAN_WORD_WIDTH", 256)?,
            radius_ticks: vars.parsed("SCAN_RADIUS_TICKS", 200_000)?,
            tickinfo_chunk: vars.parsed("SCAN_TICKINFO_CHUNK", 512)?,
            parallel_chunks: vars.parsed("SCAN_PARALLEL_CHUNKS", 4)?,
        };
        if !(1..=256).contains(&scan.word_width) {
            return Err(AnalysisError::Config(format!("SCAN_WORD_WIDTH {} not in 1..=256", scan.word_width)));
        }
        if scan.radius_ticks <= 0 || scan.tickinfo_chunk == 0 {
            return Err(AnalysisError::Config("scan radius and chunk size must be positive".into()));
        }

        let fetch = FetchConfig {
            concurrency: vars.parsed("FETCH_CONCURRENCY", 8)?,
            request_timeout: Duration::from_millis(vars.parsed("FETCH_TIMEOUT_MS", 20_000)?),
            max_attempts: vars.parsed("FETCH_MAX_ATTEMPTS", 5)?,
            initial_backoff: Duration::from_millis(vars.parsed("FETCH_INITIAL_BACKOFF_MS", 250)?),
            max_backoff: Duration::from_millis(vars.parsed("FETCH_MAX_BACKOFF_MS", 8_000)?),
            max_gap_fraction: vars.parsed("MAX_GAP_FRACTION", 0.2)?,
        };
        if fetch.concurrency == 0 || fetch.max_attempts == 0 {
            return Err(AnalysisError::Config("FETCH_CONCURRENCY and FETCH_MAX_ATTEMPTS must be >= 1".into()));
        }
        if !(0.0..=1.0).contains(&fetch.max_gap_fraction) {
            return Err(AnalysisError::Config(format!(
                "MAX_GAP_FRACTION {} not in [0, 1]",
                fetch.max_gap_fraction
            )));
        }

        let search = SearchConfig {
            monotonic_check_points: vars.parsed("SEARCH_CHECK_POINTS", 4)?,
        };

        let trade_sizes = parse_list(&vars.or("TRADE_SIZES", "1000,5000,10000,50000,100000"))?;
        if trade_sizes.is_empty() || trade_sizes.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
            return Err(AnalysisError::Config("TRADE_SIZES must be positive numbers".into()));
        }

        let price_limit_ticks = match (vars.optional("PRICE_LIMIT_LOWER_TICK"), vars.optional("PRICE_LIMIT_UPPER_TICK")) {
            (None, None) => None,
            (Some(lower), Some(upper)) => {
                let lower: i32 = parse_value("PRICE_LIMIT_LOWER_TICK", &lower)?;
                let upper: i32 = parse_value("PRICE_LIMIT_UPPER_TICK", &upper)?;
                if !(MIN_TICK <= lower && lower < upper && upper <= MAX_TICK) {
                    return Err(AnalysisError::Config(format!(
                        "price limit ticks ({}, {}) must be ordered inside [{}, {}]",
                        lower, upper, MIN_TICK, MAX_TICK
                    )));
                }
                Some((lower, upper))
            }
            _ => {
                return Err(AnalysisError::Config(
                    "PRICE_LIMIT_LOWER_TICK and PRICE_LIMIT_UPPER_TICK go together".into(),
                ))
            }
        };

        let search_start = vars.parsed_required("SEARCH_START_HEIGHT")?;
        let search_end = vars.parsed_required("SEARCH_END_HEIGHT")?;
        if search_start >= search_end {
            return Err(AnalysisError::Config("SEARCH_START_HEIGHT must be below SEARCH_END_HEIGHT".into()));
        }

        Ok(Config {
            rpc_url: vars.required("ETHEREUM_RPC_URL")?,
            state_view: vars.required("UNISWAP_V4_STATE_VIEW")?,
            quoter: vars.optional("UNISWAP_V4_QUOTER"),
            multicall: vars.optional("MULTICALL_ADDRESS"),

            currency0: vars.required("POOL_CURRENCY0")?,
            currency1: vars.required("POOL_CURRENCY1")?,
            pool_fee_pips: vars.parsed("POOL_FEE_PIPS", 3000)?,
            pool_tick_spacing: vars.parsed("POOL_TICK_SPACING", 60)?,
            hooks: vars.or("POOL_HOOKS", "0x0000000000000000000000000000000000000000"),
            pool_id: vars.optional("POOL_ID"),

            v2_pair: vars.required("V2_PAIR_ADDRESS")?,
            v2_fee_bps: vars.parsed("V2_FEE_BPS", 30)?,

            vault: vars.optional("VAULT_ADDRESS"),
            vault_module: vars.optional("VAULT_MODULE_ADDRESS"),

            decimals0: vars.parsed("TOKEN0_DECIMALS", 18)?,
            decimals1: vars.parsed("TOKEN1_DECIMALS", 6)?,

            search_start,
            search_end,
            sample_start: vars.optional("SAMPLE_START_HEIGHT").map(|v| parse_value("SAMPLE_START_HEIGHT", &v)).transpose()?,
            sample_end: vars.parsed_required("SAMPLE_END_HEIGHT")?,
            blocks_per_day: vars.parsed("BLOCKS_PER_DAY", 7200)?,

            trade_sizes,
            drop_threshold_pct: vars.parsed("V2_DROP_THRESHOLD_PCT", 50.0)?,
            quote_mode: vars.or("QUOTE_MODE", "simulated").parse()?,
            price_limit_ticks,

            scan,
            fetch,
            search,
        })
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn optional(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .ok_or_else(|| AnalysisError::Config(format!("{} must be set", key)))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.optional(key) {
            Some(v) => parse_value(key, &v),
            None => Ok(default),
        }
    }

    fn parsed_required<T: FromStr>(&self, key: &str) -> Result<T> {
        parse_value(key, &self.required(key)?)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| AnalysisError::Config(format!("{} has invalid value {:?}", key, value)))
}

fn parse_list(value: &str) -> Result<Vec<f64>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_value("TRADE_SIZES", s))
        .collect()
}
