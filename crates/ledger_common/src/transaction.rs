//! Transaction types shared by the currency and honor ledgers.
//!
//! A transaction is created on submission, sits in a queue's pending table,
//! and is consumed exactly once by `Transaction::complete`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of the account/player a transaction applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub Uuid);

impl SubjectId {
    pub fn new(id: Uuid) -> Self {
        Self(id)
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for SubjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Identifier generated at submission, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Typed balances tracked per subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrencyType {
    /// Primary balance
    Coins,
    Tokens,
    /// Secondary reward currency
    Credits,
}

impl CurrencyType {
    pub const ALL: [CurrencyType; 3] = [CurrencyType::Coins, CurrencyType::Tokens, CurrencyType::Credits];

    pub fn as_str(&self) -> &'static str {
        match self {
            CurrencyType::Coins => "coins",
            CurrencyType::Tokens => "tokens",
            CurrencyType::Credits => "credits",
        }
    }
}

impl fmt::Display for CurrencyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CurrencyType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "coins" | "coin" => Ok(CurrencyType::Coins),
            "tokens" | "token" => Ok(CurrencyType::Tokens),
            "credits" | "credit" => Ok(CurrencyType::Credits),
            other => Err(format!("unknown currency type '{}'", other)),
        }
    }
}

/// Marker kind for honor transactions, which carry no currency tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Honor;

/// What a queue's transactions are tagged with.
///
/// The currency ledger uses `CurrencyType`, the honor ledger uses `Honor`.
pub trait TransactionKind: fmt::Debug + Copy + Send + Sync + 'static {
    /// Short label used in logs and the persistence log table
    fn label(&self) -> &'static str;
}

impl TransactionKind for CurrencyType {
    fn label(&self) -> &'static str {
        self.as_str()
    }
}

impl TransactionKind for Honor {
    fn label(&self) -> &'static str {
        "honor"
    }
}

/// Why a transaction did not succeed.
///
/// The `Display` text is the message handed to callers through the callback.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    #[error("Cannot process transaction of amount 0.")]
    ZeroAmount,

    #[error("An error occurred while processing the transaction.")]
    Persistence,

    #[error("An error occurred while processing the transaction queue.")]
    QueueFault,

    #[error("The transaction was dropped before it completed.")]
    Dropped,
}

/// Result delivered to the completion callback
pub type Outcome = Result<(), TransactionError>;

/// Completion callback, invoked exactly once
pub type Callback = Box<dyn FnOnce(Outcome) + Send + 'static>;

/// A request to adjust a subject's balance by a signed amount
pub struct Transaction<K: TransactionKind> {
    pub id: TransactionId,
    pub subject: SubjectId,
    /// Zero is reserved as invalid and rejected at drain time
    pub amount: i64,
    pub kind: K,
    pub source: String,
    pub submitted_at: DateTime<Utc>,
    callback: Option<Callback>,
}

impl<K: TransactionKind> Transaction<K> {
    pub fn new(
        subject: SubjectId,
        amount: i64,
        source: impl Into<String>,
        kind: K,
        callback: Option<Callback>,
    ) -> Self {
        Self {
            id: TransactionId::generate(),
            subject,
            amount,
            kind,
            source: source.into(),
            submitted_at: Utc::now(),
            callback,
        }
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }

    /// Consume the transaction and fire its callback, if any
    pub fn complete(mut self, outcome: Outcome) {
        if let Some(callback) = self.callback.take() {
            callback(outcome);
        }
    }
}

impl<K: TransactionKind> fmt::Debug for Transaction<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("subject", &self.subject)
            .field("amount", &self.amount)
            .field("kind", &self.kind)
            .field("source", &self.source)
            .field("submitted_at", &self.submitted_at)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_transaction_ids_are_unique() {
        let a = TransactionId::generate();
        let b = TransactionId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_complete_fires_callback_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let tx = Transaction::new(
            SubjectId::random(),
            25,
            "quest reward",
            CurrencyType::Coins,
            Some(Box::new(move |outcome: Outcome| {
                assert!(outcome.is_ok());
                counter.fetch_add(1, Ordering::SeqCst);
            })),
        );

        assert!(tx.has_callback());
        tx.complete(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_complete_without_callback() {
        let tx = Transaction::new(SubjectId::random(), -5, "penalty", Honor, None);
        assert!(!tx.has_callback());
        tx.complete(Err(TransactionError::Persistence));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            TransactionError::ZeroAmount.to_string(),
            "Cannot process transaction of amount 0."
        );
        assert!(TransactionError::Persistence.to_string().contains("error occurred"));
    }

    #[test]
    fn test_currency_parse() {
        assert_eq!("Coins".parse::<CurrencyType>(), Ok(CurrencyType::Coins));
        assert_eq!(" token ".parse::<CurrencyType>(), Ok(CurrencyType::Tokens));
        assert_eq!("credits".parse::<CurrencyType>(), Ok(CurrencyType::Credits));
        assert!("gems".parse::<CurrencyType>().is_err());
    }

    #[test]
    fn test_currency_serde_lowercase() {
        let json = serde_json::to_string(&CurrencyType::Tokens).unwrap();
        assert_eq!(json, "\"tokens\"");
    }

    #[test]
    fn test_subject_id_roundtrip_text() {
        let subject = SubjectId::random();
        let parsed: SubjectId = subject.to_string().parse().unwrap();
        assert_eq!(parsed, subject);
    }
}
