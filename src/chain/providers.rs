use ethers::prelude::*;
use std::sync::Arc;

use crate::error::{AnalysisError, Result};

/// HTTP provider for an archive node. Retries live in the ledger gate.
pub fn create_archive_provider(rpc_url: &str) -> Result<Arc<Provider<Http>>> {
    let provider = Provider::<Http>::try_from(rpc_url)
        .map_err(|e| AnalysisError::Config(format!("invalid rpc url {}: {}", rpc_url, e)))?;
    Ok(Arc::new(provider))
}
