//! Background settlement.
//!
//! Successful calls hand their reservation to a [`SettlementQueue`] and return
//! immediately. A worker drains the queue and settles against the ledger with
//! bounded parallelism. Failures are logged to the audit target and never
//! reach the client, whose response is already complete.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use crate::error::RelayError;

use super::billing::PriceSnapshot;
use super::ledger::{QuotaLedger, QuotaReservation};
use super::request::Usage;
use super::stats::RelayStats;

/// Settlement work for one successful call.
#[derive(Debug)]
pub struct SettlementJob {
    /// Reservation being closed.
    pub reservation: QuotaReservation,
    /// Quota actually owed.
    pub quota: i64,
    /// Usage the quota was computed from.
    pub usage: Usage,
    /// Model billed.
    pub model: String,
    /// Channel that served the call.
    pub channel_id: u64,
    /// Ratios the quota was computed with.
    pub prices: PriceSnapshot,
}

/// Bounded queue feeding a pool of settlement tasks.
///
/// The capacity bounds jobs waiting for a worker and `workers` bounds ledger
/// calls in flight. Submission never blocks, so a job arriving at a full
/// queue parks on its own task until room frees up; those are counted in
/// [`RelayStats::settlements_deferred`].
pub struct SettlementQueue {
    sender: Mutex<Option<mpsc::Sender<SettlementJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    ledger: Arc<dyn QuotaLedger>,
    stats: Arc<RelayStats>,
}

impl SettlementQueue {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn spawn(
        ledger: Arc<dyn QuotaLedger>,
        stats: Arc<RelayStats>,
        workers: usize,
        capacity: usize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(run_worker(receiver, ledger.clone(), workers.max(1)));

        Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
            ledger,
            stats,
        }
    }

    /// Queue a job without waiting.
    ///
    /// A full queue hands the job to a task that waits for room; a closed
    /// queue settles it on a detached task. Either way it is settled once.
    pub fn submit(&self, job: SettlementJob) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let Some(sender) = sender else {
            self.settle_detached(job);
            return;
        };

        match sender.try_send(job) {
            Ok(()) => {},
            Err(TrySendError::Full(job)) => {
                self.stats.record_settlement_deferred();
                tracing::warn!(
                    deferred = self.stats.settlements_deferred(),
                    "Settlement queue full, deferring job"
                );
                let ledger = self.ledger.clone();
                tokio::spawn(async move {
                    if let Err(mpsc::error::SendError(job)) = sender.send(job).await {
                        settle_job(ledger.as_ref(), job).await;
                    }
                });
            },
            Err(TrySendError::Closed(job)) => self.settle_detached(job),
        }
    }

    fn settle_detached(&self, job: SettlementJob) {
        let ledger = self.ledger.clone();
        tokio::spawn(async move { settle_job(ledger.as_ref(), job).await });
    }

    /// Stop accepting jobs and wait for queued ones to settle.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().unwrap_or_else(PoisonError::into_inner).take());

        let worker = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                tracing::error!("Settlement worker failed: {}", e);
            }
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<SettlementJob>,
    ledger: Arc<dyn QuotaLedger>,
    workers: usize,
) {
    let permits = Arc::new(Semaphore::new(workers));

    while let Some(job) = receiver.recv().await {
        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let ledger = ledger.clone();
        tokio::spawn(async move {
            settle_job(ledger.as_ref(), job).await;
            drop(permit);
        });
    }

    // In-flight settlements hold permits until done
    let total = u32::try_from(workers).unwrap_or(u32::MAX);
    if permits.acquire_many(total).await.is_err() {
        tracing::warn!("Settlement permits closed before drain");
    }
}

async fn settle_job(ledger: &dyn QuotaLedger, job: SettlementJob) {
    let SettlementJob {
        reservation,
        quota,
        usage,
        model,
        channel_id,
        prices,
    } = job;
    let account = reservation.account().to_string();
    let reservation_id = reservation.id();

    match ledger.settle(reservation, quota).await {
        Ok(settlement) => {
            tracing::info!(
                target: "relay::audit",
                account = %account,
                model = %model,
                channel = channel_id,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                quota,
                delta = settlement.delta,
                balance = settlement.balance,
                "Consumed quota (model ratio {:.2}, group ratio {:.2}, completion ratio {:.2})",
                prices.model_ratio,
                prices.group_ratio,
                prices.completion_ratio
            );
        },
        Err(e) => {
            let error = RelayError::Settlement(e.to_string());
            tracing::error!(
                target: "relay::audit",
                account = %account,
                reservation = %reservation_id,
                quota,
                "{}",
                error
            );
        },
    }
}
