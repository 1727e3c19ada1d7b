//! Persistence gateway contract.
//!
//! The ledgers never talk to storage directly. Each drain batch calls one of
//! these blocking methods per transaction from the blocking pool, so
//! implementations may perform network or disk I/O freely.
//!
//! `FakeGateway` records every call and can be told to fail or panic for
//! particular subjects, for deterministic queue tests.

use ledger_common::{CurrencyType, SubjectId};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Failure reported by a persistence backend
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("insufficient {currency} balance for {subject}: have {balance}, delta {delta}")]
    InsufficientBalance {
        subject: SubjectId,
        currency: CurrencyType,
        balance: i64,
        delta: i64,
    },

    #[error("backend rejected the delta: {0}")]
    Rejected(String),
}

/// Blocking call surface for durably applying deltas
pub trait PersistenceGateway: Send + Sync {
    fn apply_currency_delta(
        &self,
        subject: &SubjectId,
        amount: i64,
        source: &str,
        currency: CurrencyType,
    ) -> Result<(), GatewayError>;

    fn apply_honor_delta(&self, subject: &SubjectId, amount: i64, source: &str) -> Result<(), GatewayError>;
}

// ============================================================================
// Fake Gateway (Testing)
// ============================================================================

/// One recorded gateway call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayCall {
    pub subject: SubjectId,
    pub amount: i64,
    pub source: String,
    /// None for honor deltas
    pub currency: Option<CurrencyType>,
}

#[derive(Default)]
struct FakeState {
    calls: Vec<GatewayCall>,
    failing: HashSet<SubjectId>,
    panicking: HashSet<SubjectId>,
    delay: Option<Duration>,
}

/// In-memory gateway that records calls instead of persisting
#[derive(Clone, Default)]
pub struct FakeGateway {
    state: Arc<Mutex<FakeState>>,
}

impl FakeGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delta for this subject returns an error
    pub fn fail_for(&self, subject: SubjectId) {
        self.lock().failing.insert(subject);
    }

    /// Every delta for this subject panics inside the gateway
    pub fn panic_for(&self, subject: SubjectId) {
        self.lock().panicking.insert(subject);
    }

    /// Sleep this long inside every call
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().calls.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: GatewayCall) -> Result<(), GatewayError> {
        let subject = call.subject;
        let (delay, fail, panic) = {
            let mut state = self.lock();
            state.calls.push(call);
            (
                state.delay,
                state.failing.contains(&subject),
                state.panicking.contains(&subject),
            )
        };

        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if panic {
            panic!("fake gateway panic for {}", subject);
        }
        if fail {
            return Err(GatewayError::Rejected(format!("configured failure for {}", subject)));
        }
        Ok(())
    }
}

impl PersistenceGateway for FakeGateway {
    fn apply_currency_delta(
        &self,
        subject: &SubjectId,
        amount: i64,
        source: &str,
        currency: CurrencyType,
    ) -> Result<(), GatewayError> {
        self.record(GatewayCall {
            subject: *subject,
            amount,
            source: source.to_string(),
            currency: Some(currency),
        })
    }

    fn apply_honor_delta(&self, subject: &SubjectId, amount: i64, source: &str) -> Result<(), GatewayError> {
        self.record(GatewayCall {
            subject: *subject,
            amount,
            source: source.to_string(),
            currency: None,
        })
    }
}
