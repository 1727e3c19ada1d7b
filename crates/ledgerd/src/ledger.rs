//! Currency and honor ledgers.
//!
//! Both are a `TransactionQueue` bound to one gateway method. All queueing,
//! batching and failure handling lives in the queue.

use crate::gateway::PersistenceGateway;
use crate::queue::{ApplyFn, QueueSettings, QueueStatsSnapshot, Receipt, TransactionQueue};
use ledger_common::{Callback, CurrencyType, Honor, SubjectId, Transaction, TransactionId};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Typed currency deltas
pub struct CurrencyLedger {
    queue: Arc<TransactionQueue<CurrencyType>>,
}

impl CurrencyLedger {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, settings: QueueSettings, runtime: Handle) -> Self {
        let apply: ApplyFn<CurrencyType> = Arc::new(move |tx: &Transaction<CurrencyType>| {
            gateway.apply_currency_delta(&tx.subject, tx.amount, &tx.source, tx.kind)
        });
        Self {
            queue: TransactionQueue::new("currency", settings, apply, runtime),
        }
    }

    pub fn submit(
        &self,
        subject: SubjectId,
        amount: i64,
        source: impl Into<String>,
        currency: CurrencyType,
        callback: Option<Callback>,
    ) -> TransactionId {
        self.queue.submit(subject, amount, source, currency, callback)
    }

    pub fn submit_with_receipt(
        &self,
        subject: SubjectId,
        amount: i64,
        source: impl Into<String>,
        currency: CurrencyType,
    ) -> Receipt {
        self.queue.submit_with_receipt(subject, amount, source, currency)
    }

    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.queue.start()
    }

    pub fn stop(&self) {
        self.queue.stop()
    }

    pub async fn flush(&self) {
        self.queue.flush().await
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    pub fn queue(&self) -> &Arc<TransactionQueue<CurrencyType>> {
        &self.queue
    }
}

/// Honor deltas; no currency tag
pub struct HonorLedger {
    queue: Arc<TransactionQueue<Honor>>,
}

impl HonorLedger {
    pub fn new(gateway: Arc<dyn PersistenceGateway>, settings: QueueSettings, runtime: Handle) -> Self {
        let apply: ApplyFn<Honor> = Arc::new(move |tx: &Transaction<Honor>| {
            gateway.apply_honor_delta(&tx.subject, tx.amount, &tx.source)
        });
        Self {
            queue: TransactionQueue::new("honor", settings, apply, runtime),
        }
    }

    pub fn submit(
        &self,
        subject: SubjectId,
        amount: i64,
        source: impl Into<String>,
        callback: Option<Callback>,
    ) -> TransactionId {
        self.queue.submit(subject, amount, source, Honor, callback)
    }

    pub fn submit_with_receipt(&self, subject: SubjectId, amount: i64, source: impl Into<String>) -> Receipt {
        self.queue.submit_with_receipt(subject, amount, source, Honor)
    }

    pub fn start(&self) -> Option<JoinHandle<()>> {
        self.queue.start()
    }

    pub fn stop(&self) {
        self.queue.stop()
    }

    pub async fn flush(&self) {
        self.queue.flush().await
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        self.queue.stats()
    }

    pub fn queue(&self) -> &Arc<TransactionQueue<Honor>> {
        &self.queue
    }
}
