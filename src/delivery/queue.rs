//! Bounded-concurrency update queue
//!
//! `push` never blocks: tasks go onto an unbounded channel that a fixed pool
//! of workers drains. The pool size is the in-flight bound. `when_done`
//! waits until every pushed task has settled and hands back the outcomes.
//! `cancel` settles whatever is still queued or in flight as
//! `DeliveryError::Cancelled`.

use crate::config::DEFAULT_API_CONCURRENCY;
use crate::errors::{panic_message, DeliveryError};
use crate::model::{DeliveryOptions, LocationRecord};
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;

/// Something that can write one record to the availability store.
#[async_trait]
pub trait Deliverer: Send + Sync {
    async fn send_update(
        &self,
        record: &LocationRecord,
        options: DeliveryOptions,
    ) -> Result<UpdateResponse, DeliveryError>;
}

/// Successful answer from the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpdateResponse {
    pub status: u16,
    #[serde(default)]
    pub body: serde_json::Value,
    /// Gateway retries spent before this answer
    #[serde(default)]
    pub retries: u32,
}

/// Settled result of one queued task.
#[derive(Debug)]
pub struct UpdateOutcome {
    pub sent: LocationRecord,
    pub options: DeliveryOptions,
    pub result: Result<UpdateResponse, DeliveryError>,
}

impl UpdateOutcome {
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error(&self) -> Option<&DeliveryError> {
        self.result.as_ref().err()
    }
}

struct QueueTask {
    record: LocationRecord,
    options: DeliveryOptions,
}

/// State shared between the queue handle and its workers.
struct Shared {
    /// Pushed but not yet settled
    pending: AtomicUsize,
    settled: Mutex<Vec<UpdateOutcome>>,
    idle: Notify,
    cancelled: watch::Sender<bool>,
}

impl Shared {
    fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            pending: AtomicUsize::new(0),
            settled: Mutex::new(Vec::new()),
            idle: Notify::new(),
            cancelled,
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    fn settle_cancelled(&self, task: QueueTask) {
        self.settle(UpdateOutcome {
            sent: task.record,
            options: task.options,
            result: Err(DeliveryError::Cancelled),
        });
    }

    fn settle(&self, outcome: UpdateOutcome) {
        match self.settled.lock() {
            Ok(mut settled) => settled.push(outcome),
            Err(poisoned) => poisoned.into_inner().push(outcome),
        }
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn take_settled(&self) -> Vec<UpdateOutcome> {
        match self.settled.lock() {
            Ok(mut settled) => std::mem::take(&mut *settled),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

pub struct UpdateQueue {
    sender: mpsc::UnboundedSender<QueueTask>,
    shared: Arc<Shared>,
    concurrency: usize,
    workers: Vec<JoinHandle<()>>,
}

impl UpdateQueue {
    /// Start `concurrency` workers (0 means the default of 10).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(deliverer: Arc<dyn Deliverer>, concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            DEFAULT_API_CONCURRENCY
        } else {
            concurrency
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let receiver = Arc::new(AsyncMutex::new(receiver));
        let shared = Arc::new(Shared::new());

        let workers = (0..concurrency)
            .map(|worker_id| {
                tokio::spawn(run_worker(
                    worker_id,
                    receiver.clone(),
                    deliverer.clone(),
                    shared.clone(),
                ))
            })
            .collect();

        log::debug!("📮 Update queue started with {} workers", concurrency);

        Self {
            sender,
            shared,
            concurrency,
            workers,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Tasks pushed and not yet settled.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }

    /// Enqueue a record for delivery. Returns immediately.
    ///
    /// After `cancel`, the task settles at once as cancelled.
    pub fn push(&self, record: LocationRecord, options: DeliveryOptions) {
        self.shared.pending.fetch_add(1, Ordering::SeqCst);

        if self.shared.is_cancelled() {
            self.shared.settle_cancelled(QueueTask { record, options });
            return;
        }

        if let Err(mpsc::error::SendError(task)) = self.sender.send(QueueTask { record, options }) {
            self.shared.settle(UpdateOutcome {
                sent: task.record,
                options: task.options,
                result: Err(DeliveryError::QueueClosed),
            });
        }
    }

    /// Wait until every pushed task has settled, then return the outcomes
    /// settled since the previous call, in completion order.
    ///
    /// Tasks pushed while waiting are waited for too. Task failures are
    /// reported in their outcome and never fail this call.
    pub async fn when_done(&self) -> Vec<UpdateOutcome> {
        loop {
            // Register before checking so a final notify cannot slip between.
            let idle = self.shared.idle.notified();
            if self.shared.pending.load(Ordering::SeqCst) == 0 {
                break;
            }
            idle.await;
        }

        self.shared.take_settled()
    }

    /// Stop sending. Queued tasks and sends still in flight settle as
    /// `DeliveryError::Cancelled`, so a pending `when_done` returns promptly.
    pub fn cancel(&self) {
        if !self.shared.cancelled.send_replace(true) {
            log::warn!("🛑 Update queue cancelled with {} update(s) pending", self.pending());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.shared.is_cancelled()
    }
}

impl Drop for UpdateQueue {
    fn drop(&mut self) {
        for worker in &self.workers {
            worker.abort();
        }
    }
}

async fn run_worker(
    worker_id: usize,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<QueueTask>>>,
    deliverer: Arc<dyn Deliverer>,
    shared: Arc<Shared>,
) {
    let mut cancel_rx = shared.cancelled.subscribe();
    loop {
        // Only one idle worker waits on the channel at a time.
        let task = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(task) = task else {
            break;
        };

        if shared.is_cancelled() {
            shared.settle_cancelled(task);
            continue;
        }

        let result = tokio::select! {
            sent = AssertUnwindSafe(deliverer.send_update(&task.record, task.options)).catch_unwind() => {
                match sent {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(&*payload);
                        log::error!("❌ Worker {} recovered from panic: {}", worker_id, message);
                        Err(DeliveryError::Panicked(message))
                    }
                }
            }
            _ = wait_cancelled(&mut cancel_rx) => Err(DeliveryError::Cancelled),
        };

        shared.settle(UpdateOutcome {
            sent: task.record,
            options: task.options,
            result,
        });
    }

    log::trace!("Update worker {} stopped", worker_id);
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        futures::future::pending::<()>().await;
    }
}
