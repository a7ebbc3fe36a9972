use anyhow::Context;

use arrakis_migration::bootstrap::AppState;
use arrakis_migration::config::Config;
use arrakis_migration::engine::service::run_study;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    // Load configuration
    let config = Config::from_env().context("failed to load configuration")?;

    // Build application state
    let app_state = AppState::new(&config).context("failed to initialize application state")?;

    let report = run_study(&app_state.ledger, &app_state.study)
        .await
        .context("study aborted")?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
