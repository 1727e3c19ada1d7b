//! ledgerd library - exposes modules for embedding and testing.

pub mod config;
pub mod gateway;
pub mod ledger;
pub mod progression;
pub mod queue;
pub mod store;

pub use gateway::{GatewayError, PersistenceGateway};
pub use ledger::{CurrencyLedger, HonorLedger};
pub use progression::{PresenceRegistry, ProgressionService, ProgressionView};
pub use queue::{QueueSettings, Receipt, TransactionQueue};
