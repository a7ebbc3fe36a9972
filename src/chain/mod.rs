pub mod eth_client;
pub mod gate;
pub mod ledger;
pub mod memory;
pub mod providers;

pub use gate::GatedLedger;
pub use ledger::{LedgerCall, LedgerClient, LedgerResponse};
pub use memory::InMemoryLedger;
