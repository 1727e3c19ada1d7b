//! Ledger Common - shared domain types for the transaction ledgers.
//!
//! Runtime-free: transactions and their outcomes, the level mapping table,
//! and level-up detection.

pub mod levels;
pub mod progression;
pub mod transaction;

pub use levels::{LevelMapping, LevelMappingTable, LevelTableError, ProgressionSnapshot};
pub use progression::{detect_level_up, LevelRecord, LevelUp};
pub use transaction::{
    Callback, CurrencyType, Honor, Outcome, SubjectId, Transaction, TransactionError,
    TransactionId, TransactionKind,
};
