use std::time::Duration;

use arrakis_migration::chain::memory::FakePool;
use arrakis_migration::chain::{GatedLedger, InMemoryLedger, LedgerClient};
use arrakis_migration::config::{FetchConfig, ScanConfig};
use arrakis_migration::engine::scanner::{accumulated_at, TickBitmapScanner};
use arrakis_migration::math::concentrated::ConcentratedState;
use arrakis_migration::math::constant_product::ConstantProductState;
use arrakis_migration::math::model::AmmModel;
use arrakis_migration::models::{Direction, PoolId};
use ethers::types::U256;
use num_bigint::BigInt;

const POOL: PoolId = [0x11; 32];

fn gated(ledger: InMemoryLedger) -> GatedLedger<InMemoryLedger> {
    GatedLedger::new(
        ledger,
        FetchConfig {
            concurrency: 3,
            request_timeout: Duration::from_secs(1),
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            max_gap_fraction: 0.0,
        },
    )
}

fn layered_pool() -> FakePool {
    FakePool::new(-90, 60, 500)
        .unwrap()
        .with_position(-12_000, 12_000, 10u128.pow(22))
        .with_position(-600, 300, 3 * 10u128.pow(22))
        .with_position(-120, 0, 5 * 10u128.pow(22))
        .with_position(-60, 60, 2 * 10u128.pow(22))
}

#[tokio::test]
async fn scanned_distribution_prices_like_the_ledger() {
    let ledger = gated(InMemoryLedger::new().with_pool(POOL, 0, layered_pool()));
    let snapshot = ledger.get_snapshot(POOL, 10).await.unwrap();
    let config = ScanConfig { word_width: 256, radius_ticks: 20_000, tickinfo_chunk: 2, parallel_chunks: 2 };
    let scan = TickBitmapScanner::new(&ledger, config).scan(POOL, &snapshot).await.unwrap();

    assert_eq!(scan.initialized_ticks, 8);
    assert_eq!(accumulated_at(&scan.ranges, snapshot.active_tick), snapshot.active_liquidity);
    // ranges tile the window without holes
    for pair in scan.ranges.windows(2) {
        assert_eq!(pair[0].tick_upper, pair[1].tick_lower);
    }

    let model = AmmModel::ConcentratedLiquidity(ConcentratedState::from_scan(&snapshot, &scan.ranges).unwrap());
    for direction in Direction::BOTH {
        for amount in [10u128.pow(18), 10u128.pow(20), 5 * 10u128.pow(20)] {
            let amount_in = U256::from(amount);
            let local = model.quote(amount_in, direction).unwrap();
            let remote = ledger.quote(POOL, amount_in, direction, 10).await.unwrap();
            assert_eq!(local.quote.amount_out, remote, "{:?} {}", direction, amount);
            assert!(local.gross_pct >= 0.0);
            assert!((local.net_pct - local.gross_pct - 0.05).abs() < 1e-12);
        }
    }
}

#[tokio::test]
async fn larger_trades_slip_more_in_both_models() {
    let pair = AmmModel::ConstantProduct(
        ConstantProductState::new(U256::exp10(24), U256::exp10(24), 30).unwrap(),
    );
    let ledger = InMemoryLedger::new().with_pool(
        POOL,
        0,
        FakePool::new(0, 60, 3000).unwrap().with_position(-6_000, 6_000, 10u128.pow(24)),
    );
    let snapshot = ledger.get_snapshot(POOL, 1).await.unwrap();
    let scan = TickBitmapScanner::new(&ledger, ScanConfig::default()).scan(POOL, &snapshot).await.unwrap();
    let pool = AmmModel::ConcentratedLiquidity(ConcentratedState::from_scan(&snapshot, &scan.ranges).unwrap());
    assert_eq!(snapshot.active_liquidity, BigInt::from(10u128.pow(24)));

    for model in [&pair, &pool] {
        let mut last = 0.0;
        for exp in [18u32, 20, 22] {
            let quote = model.quote(U256::exp10(exp as usize), Direction::Forward).unwrap();
            assert!(quote.gross_pct > last, "{:?} at 1e{}", model.kind(), exp);
            last = quote.gross_pct;
        }
    }

    // same liquidity inside the band: the pool never does worse than the pair
    let small = U256::exp10(21);
    let pair_gross = pair.quote(small, Direction::Forward).unwrap().gross_pct;
    let pool_gross = pool.quote(small, Direction::Forward).unwrap().gross_pct;
    assert!(pool_gross <= pair_gross * (1.0 + 1e-6), "{} vs {}", pool_gross, pair_gross);
}
