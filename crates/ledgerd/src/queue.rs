//! Rate-limited transaction queue.
//!
//! Callers submit transactions at any rate from any thread. A fixed-interval
//! drain cycle pulls at most `batch_limit` of them out of the pending table
//! and hands the batch to the blocking pool, where each transaction is
//! applied through the queue's apply function and its callback fired.
//!
//! Guarantees:
//! - every accepted transaction gets exactly one outcome
//! - a transaction removed for dispatch is never re-inserted, so the backend
//!   sees it at most once
//! - one failing or panicking transaction never affects its siblings
//! - no retries anywhere
//!
//! A poisoned pending table during extraction, or a batch task the runtime
//! refuses or cancels, is treated as a systemic fault: every pending
//! transaction is failed and the table is cleared. A dispatched batch that
//! never ran fails its own transactions when it is dropped.

use crate::config::QueueConfig;
use crate::gateway::GatewayError;
use ledger_common::{
    Callback, Outcome, SubjectId, Transaction, TransactionError, TransactionId, TransactionKind,
};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{oneshot, Notify};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Applies one transaction to the backing store
pub type ApplyFn<K> = Arc<dyn Fn(&Transaction<K>) -> Result<(), GatewayError> + Send + Sync>;

/// Drain cycle tuning
#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub drain_interval: Duration,
    pub batch_limit: usize,
    /// Zero disables the slow-batch warning
    pub slow_batch_warning: Duration,
}

impl From<&QueueConfig> for QueueSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            drain_interval: config.drain_interval(),
            batch_limit: config.batch_limit,
            slow_batch_warning: config.slow_batch_warning(),
        }
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

#[derive(Debug, thiserror::Error)]
enum QueueFault {
    #[error("pending table lock poisoned")]
    PoisonedTable,

    #[error("batch task did not run: {0}")]
    BatchAborted(#[from] JoinError),
}

#[derive(Default)]
struct QueueStats {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

/// Batches handed to the blocking pool and not yet finished
#[derive(Default)]
struct InFlight {
    batches: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.batches.fetch_add(1, Ordering::SeqCst);
        InFlightGuard(Arc::clone(self))
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.batches.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.batches.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Transactions owned by one dispatched batch.
///
/// Anything still inside when the batch is dropped was never applied and is
/// failed with `QueueFault`. The in-flight guard is released only after that.
struct Batch<K: TransactionKind> {
    name: &'static str,
    stats: Arc<QueueStats>,
    items: VecDeque<Transaction<K>>,
    _in_flight: InFlightGuard,
}

impl<K: TransactionKind> Drop for Batch<K> {
    fn drop(&mut self) {
        if self.items.is_empty() {
            return;
        }
        error!(
            "[{}] Batch abandoned before it ran, failing its {} transactions",
            self.name,
            self.items.len()
        );
        self.stats
            .failed
            .fetch_add(self.items.len() as u64, Ordering::Relaxed);
        for tx in self.items.drain(..) {
            deliver(self.name, tx, Err(TransactionError::QueueFault));
        }
    }
}

/// Point-in-time queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub batches: u64,
    pub pending: usize,
}

/// Future-style handle on a submitted transaction
#[derive(Debug)]
pub struct Receipt {
    pub id: TransactionId,
    rx: oneshot::Receiver<Outcome>,
}

impl Receipt {
    /// Wait for the transaction's outcome
    pub async fn outcome(self) -> Outcome {
        self.rx.await.unwrap_or(Err(TransactionError::Dropped))
    }
}

/// Generic buffering, batching and dispatch engine
pub struct TransactionQueue<K: TransactionKind> {
    name: &'static str,
    settings: QueueSettings,
    pending: Mutex<HashMap<TransactionId, Transaction<K>>>,
    apply: ApplyFn<K>,
    runtime: Handle,
    stats: Arc<QueueStats>,
    in_flight: Arc<InFlight>,
    /// Present while a ticker runs; sending on it stops that ticker
    stop_signal: Mutex<Option<oneshot::Sender<()>>>,
}

impl<K: TransactionKind> TransactionQueue<K> {
    pub fn new(
        name: &'static str,
        settings: QueueSettings,
        apply: ApplyFn<K>,
        runtime: Handle,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            settings,
            pending: Mutex::new(HashMap::new()),
            apply,
            runtime,
            stats: Arc::new(QueueStats::default()),
            in_flight: Arc::new(InFlight::default()),
            stop_signal: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Queue a transaction. Never blocks on I/O and never fails; the amount
    /// is validated at drain time.
    pub fn submit(
        &self,
        subject: SubjectId,
        amount: i64,
        source: impl Into<String>,
        kind: K,
        callback: Option<Callback>,
    ) -> TransactionId {
        let tx = Transaction::new(subject, amount, source, kind, callback);
        let id = tx.id;
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, tx);
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        id
    }

    /// Queue a transaction and get a receipt to await its outcome
    pub fn submit_with_receipt(
        &self,
        subject: SubjectId,
        amount: i64,
        source: impl Into<String>,
        kind: K,
    ) -> Receipt {
        let (sender, rx) = oneshot::channel();
        let id = self.submit(
            subject,
            amount,
            source,
            kind,
            Some(Box::new(move |outcome: Outcome| {
                // Receiver may have been dropped; nobody is waiting then
                let _ = sender.send(outcome);
            })),
        );
        Receipt { id, rx }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            pending: self.pending_len(),
        }
    }

    /// Run one drain cycle.
    ///
    /// Returns the handle of the dispatched batch, or None if nothing was
    /// dispatched (empty table or systemic fault during extraction).
    pub fn drain_once(&self) -> Option<JoinHandle<()>> {
        let batch = match self.extract_batch() {
            Ok(batch) => batch,
            Err(fault) => {
                self.fail_all_pending(&fault);
                return None;
            }
        };

        if batch.is_empty() {
            return None;
        }

        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        debug!("[{}] Dispatching batch of {} transactions", self.name, batch.len());
        Some(self.dispatch(batch))
    }

    /// Remove up to `batch_limit` entries. Selection order is whatever the
    /// map yields; callers must not rely on FIFO.
    fn extract_batch(&self) -> Result<Vec<Transaction<K>>, QueueFault> {
        let mut pending = self.pending.lock().map_err(|_| QueueFault::PoisonedTable)?;
        let ids: Vec<TransactionId> = pending
            .keys()
            .take(self.settings.batch_limit)
            .copied()
            .collect();
        Ok(ids.iter().filter_map(|id| pending.remove(id)).collect())
    }

    fn fail_all_pending(&self, fault: &QueueFault) {
        let drained: Vec<Transaction<K>> = {
            let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
            pending.drain().map(|(_, tx)| tx).collect()
        };
        self.pending.clear_poison();

        error!(
            "[{}] Queue fault ({}), failing all {} pending transactions",
            self.name,
            fault,
            drained.len()
        );
        self.stats
            .failed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        for tx in drained {
            deliver(self.name, tx, Err(TransactionError::QueueFault));
        }
    }

    fn dispatch(&self, batch: Vec<Transaction<K>>) -> JoinHandle<()> {
        let name = self.name;
        let size = batch.len();
        let warn_after = self.settings.slow_batch_warning;
        let apply = Arc::clone(&self.apply);
        let batch = Batch {
            name,
            stats: Arc::clone(&self.stats),
            items: VecDeque::from(batch),
            _in_flight: self.in_flight.enter(),
        };

        // A refused or cancelled task drops the closure, and with it the batch
        let mut work = self.runtime.spawn_blocking(move || process_batch(&apply, batch));

        self.runtime.spawn(async move {
            let joined = if warn_after.is_zero() {
                work.await
            } else {
                match tokio::time::timeout(warn_after, &mut work).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        warn!(
                            "[{}] Batch of {} still running after {:.1}s; backend may be stalled",
                            name,
                            size,
                            warn_after.as_secs_f32()
                        );
                        work.await
                    }
                }
            };

            if let Err(e) = joined {
                error!("[{}] Batch task did not complete: {}", name, e);
            }
        })
    }

    /// Start the periodic drain. Returns None if already running.
    pub fn start(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut stop_rx = {
            let mut signal = self.stop_signal.lock().unwrap_or_else(PoisonError::into_inner);
            if signal.is_some() {
                return None;
            }
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            *signal = Some(stop_tx);
            stop_rx
        };

        let queue = Arc::clone(self);
        info!(
            "[{}] Drain started: every {}ms, up to {} per batch",
            self.name,
            self.settings.drain_interval.as_millis(),
            self.settings.batch_limit
        );

        Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(queue.settings.drain_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        queue.drain_once();
                    }
                    _ = &mut stop_rx => break,
                }
            }
            info!("[{}] Drain stopped", queue.name);
        }))
    }

    /// Stop the periodic drain. Pending transactions stay queued.
    pub fn stop(&self) {
        let signal = self
            .stop_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop_tx) = signal {
            // The ticker may already be gone with its runtime
            let _ = stop_tx.send(());
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_signal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Drain batch by batch until the pending table is empty, then wait for
    /// every batch still in flight, including ones the ticker dispatched.
    pub async fn flush(&self) {
        while let Some(batch) = self.drain_once() {
            if let Err(e) = batch.await {
                self.fail_all_pending(&QueueFault::BatchAborted(e));
            }
        }
        self.in_flight.wait_idle().await;
    }
}

fn process_batch<K: TransactionKind>(apply: &ApplyFn<K>, mut batch: Batch<K>) {
    let name = batch.name;
    while let Some(tx) = batch.items.pop_front() {
        let stats = &batch.stats;
        if tx.amount == 0 {
            debug!("[{}] Rejecting zero-amount transaction {}", name, tx.id);
            stats.failed.fetch_add(1, Ordering::Relaxed);
            deliver(name, tx, Err(TransactionError::ZeroAmount));
            continue;
        }

        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| apply(&tx))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                error!(
                    "[{}] Failed to persist transaction {} ({} {} for {}, source '{}'): {}",
                    name,
                    tx.id,
                    tx.amount,
                    tx.kind.label(),
                    tx.subject,
                    tx.source,
                    e
                );
                Err(TransactionError::Persistence)
            }
            Err(_) => {
                error!("[{}] Backend panicked while persisting transaction {}", name, tx.id);
                Err(TransactionError::Persistence)
            }
        };

        match outcome {
            Ok(()) => stats.succeeded.fetch_add(1, Ordering::Relaxed),
            Err(_) => stats.failed.fetch_add(1, Ordering::Relaxed),
        };
        deliver(name, tx, outcome);
    }
}

/// Fire the callback, containing any panic inside it
fn deliver<K: TransactionKind>(name: &'static str, tx: Transaction<K>, outcome: Outcome) {
    let id = tx.id;
    if panic::catch_unwind(AssertUnwindSafe(move || tx.complete(outcome))).is_err() {
        warn!("[{}] Callback for transaction {} panicked", name, id);
    }
}
