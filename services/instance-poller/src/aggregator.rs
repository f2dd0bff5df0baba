//! Instance info aggregator - coalesces concurrent lookups into batched
//! provider calls.
//!
//! Every machine poller needs the status and addresses of its instance, but
//! the provider's describe-instances call is rate limited. The aggregator
//! owns a single coordinator task that:
//! - Opens a batch when a lookup arrives while idle
//! - Collects further lookups for `gather_window` (the window is not extended)
//! - Seals the batch and issues exactly one `InstanceGetter::instances` call
//!   with the deduplicated IDs
//! - Fans the per-instance results back out to every waiting caller
//!
//! ## Shutdown
//!
//! `stop()` while a batch is collecting seals and dispatches that batch, so
//! its waiters get real answers. Lookups still queued in the mailbox, and
//! every lookup made after `stop()`, fail with [`LookupError::Stopped`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::instance::{InstanceId, InstanceInfo};
use crate::provider::{Instance, InstanceGetter, InstancesError, PartialInstances};

// =============================================================================
// Errors
// =============================================================================

/// Errors returned to a single lookup.
///
/// Causes are shared, so every waiter on a failed batch or instance gets the
/// same error value.
#[derive(Debug, Clone, Error)]
pub enum LookupError {
    /// The provider call for the whole batch failed.
    #[error("{0}")]
    Provider(Arc<anyhow::Error>),

    /// The provider has no such instance.
    #[error("instance {0} not found")]
    NotFound(InstanceId),

    /// The instance exists but its addresses could not be fetched.
    #[error("{cause}")]
    Addresses {
        id: InstanceId,
        cause: Arc<anyhow::Error>,
    },

    /// The aggregator is shutting down.
    #[error("instance aggregator stopped")]
    Stopped,
}

impl LookupError {
    /// Returns true if the instance no longer exists.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true if a later lookup may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Provider(_) | Self::Addresses { .. })
    }
}

/// Errors from the aggregator's lifecycle.
#[derive(Debug, Error)]
pub enum AggregatorError {
    /// The coordinator task panicked or was aborted.
    #[error("aggregator task failed: {0}")]
    TaskFailed(#[from] tokio::task::JoinError),
}

/// Reply to a single lookup.
pub type LookupReply = Result<InstanceInfo, LookupError>;

// =============================================================================
// Configuration
// =============================================================================

/// Aggregator configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// How long a batch collects lookups before it is dispatched.
    pub gather_window: Duration,

    /// Capacity of the request mailbox.
    pub mailbox_size: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            gather_window: Duration::from_secs(3),
            mailbox_size: 1024,
        }
    }
}

// =============================================================================
// Aggregator Handle
// =============================================================================

/// A lookup waiting to be batched.
#[derive(Debug)]
struct InstanceInfoRequest {
    id: InstanceId,
    reply_to: oneshot::Sender<LookupReply>,
}

/// Handle to a running aggregator.
///
/// Cheap to share behind an `Arc`; `lookup` may be called concurrently from
/// any number of tasks.
pub struct Aggregator {
    /// Sender for the coordinator's mailbox.
    tx: mpsc::Sender<InstanceInfoRequest>,

    /// Stop signal.
    shutdown_tx: watch::Sender<bool>,

    /// Coordinator task, taken by the first `await_stopped`.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Aggregator {
    /// Start an aggregator with the given gather window.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(getter: Arc<dyn InstanceGetter>, gather_window: Duration) -> Self {
        Self::with_config(
            getter,
            AggregatorConfig {
                gather_window,
                ..Default::default()
            },
        )
    }

    /// Start an aggregator with full configuration.
    pub fn with_config(getter: Arc<dyn InstanceGetter>, config: AggregatorConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.mailbox_size.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(
            gather_window_ms = config.gather_window.as_millis(),
            mailbox_size = config.mailbox_size,
            "Starting instance aggregator"
        );

        let coordinator = Coordinator {
            getter,
            gather_window: config.gather_window,
            batches_dispatched: 0,
            requests_served: 0,
        };
        let task = tokio::spawn(coordinator.run(rx, shutdown_rx));

        Self {
            tx,
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }

    /// Look up the current status and addresses of an instance.
    ///
    /// Waits until the batch containing this lookup has been resolved.
    pub async fn lookup(&self, id: impl Into<InstanceId>) -> LookupReply {
        if self.is_stopping() {
            return Err(LookupError::Stopped);
        }

        let (reply_to, reply) = oneshot::channel();
        let request = InstanceInfoRequest {
            id: id.into(),
            reply_to,
        };

        self.tx
            .send(request)
            .await
            .map_err(|_| LookupError::Stopped)?;

        // A dropped sender means the coordinator exited without answering.
        reply.await.unwrap_or(Err(LookupError::Stopped))
    }

    /// Signal the coordinator to stop. Idempotent.
    pub fn stop(&self) {
        if !self.shutdown_tx.send_replace(true) {
            debug!("Instance aggregator stop requested");
        }
    }

    /// Returns true once `stop()` has been called.
    pub fn is_stopping(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Wait for the coordinator task to exit.
    ///
    /// Only the first caller observes a task failure; later calls return
    /// `Ok(())`.
    pub async fn await_stopped(&self) -> Result<(), AggregatorError> {
        let mut task = self.task.lock().await;
        match task.take() {
            Some(handle) => handle.await.map_err(AggregatorError::from),
            None => Ok(()),
        }
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Lookups collected during one gather window.
struct Batch {
    /// Distinct IDs in arrival order.
    ids: Vec<InstanceId>,

    /// Waiters per ID.
    waiters: HashMap<InstanceId, Vec<oneshot::Sender<LookupReply>>>,

    /// When the batch seals.
    deadline: Instant,
}

impl Batch {
    fn open(deadline: Instant) -> Self {
        Self {
            ids: Vec::new(),
            waiters: HashMap::new(),
            deadline,
        }
    }

    fn add(&mut self, request: InstanceInfoRequest) {
        let waiters = self.waiters.entry(request.id.clone()).or_default();
        if waiters.is_empty() {
            self.ids.push(request.id);
        }
        waiters.push(request.reply_to);
    }

    fn waiter_count(&self) -> usize {
        self.waiters.values().map(Vec::len).sum()
    }
}

/// State owned by the coordinator task. Nothing here is shared.
struct Coordinator {
    getter: Arc<dyn InstanceGetter>,
    gather_window: Duration,
    batches_dispatched: u64,
    requests_served: u64,
}

impl Coordinator {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<InstanceInfoRequest>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut batch: Option<Batch> = None;

        loop {
            let deadline = batch.as_ref().map(|b| b.deadline);

            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // A dropped sender means the handle is gone.
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Instance aggregator received stop signal");
                        break;
                    }
                }

                _ = window_elapsed(deadline) => {
                    if let Some(sealed) = batch.take() {
                        self.dispatch(sealed).await;
                    }
                }

                request = rx.recv() => {
                    match request {
                        Some(request) => {
                            let open = batch.get_or_insert_with(|| {
                                Batch::open(Instant::now() + self.gather_window)
                            });
                            open.add(request);
                        }
                        None => {
                            debug!("Instance aggregator mailbox closed");
                            break;
                        }
                    }
                }
            }
        }

        if let Some(sealed) = batch.take() {
            self.dispatch(sealed).await;
        }

        rx.close();
        let mut rejected = 0usize;
        while let Ok(request) = rx.try_recv() {
            let _ = request.reply_to.send(Err(LookupError::Stopped));
            rejected += 1;
        }

        info!(
            batches_dispatched = self.batches_dispatched,
            requests_served = self.requests_served,
            rejected,
            "Instance aggregator stopped"
        );
    }

    /// Seal a batch: one provider call, then one reply per waiter.
    async fn dispatch(&mut self, batch: Batch) {
        let waiter_count = batch.waiter_count();
        let Batch { ids, mut waiters, .. } = batch;
        let started = Instant::now();

        debug!(
            batch_size = ids.len(),
            waiters = waiter_count,
            "Dispatching instance batch"
        );

        let replies = resolve_batch(self.getter.as_ref(), &ids).await;

        for (id, reply) in ids.iter().zip(replies) {
            for waiter in waiters.remove(id).unwrap_or_default() {
                // The caller may have given up waiting.
                let _ = waiter.send(reply.clone());
            }
        }

        self.batches_dispatched += 1;
        self.requests_served += waiter_count as u64;

        debug!(
            batch_size = ids.len(),
            waiters = waiter_count,
            duration_ms = started.elapsed().as_millis(),
            "Instance batch resolved"
        );
    }
}

/// Resolves once the batch deadline passes; never while idle.
async fn window_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// =============================================================================
// Result Resolution
// =============================================================================

/// Call the provider once and classify the outcome per ID.
///
/// Returns one reply per ID, aligned with `ids`.
async fn resolve_batch(getter: &dyn InstanceGetter, ids: &[InstanceId]) -> Vec<LookupReply> {
    let results: PartialInstances = match getter.instances(ids).await {
        Ok(instances) => instances.into_iter().map(Some).collect(),
        Err(InstancesError::Partial(results)) => {
            debug!(
                batch_size = ids.len(),
                found = results.iter().flatten().count(),
                "Provider returned partial instances"
            );
            results
        }
        Err(InstancesError::Other(err)) => {
            warn!(batch_size = ids.len(), error = %err, "Instance batch lookup failed");
            let err = Arc::new(err);
            return ids
                .iter()
                .map(|_| Err(LookupError::Provider(Arc::clone(&err))))
                .collect();
        }
    };

    let mut replies = Vec::with_capacity(ids.len());
    for (index, id) in ids.iter().enumerate() {
        let reply = match results.get(index).and_then(Option::as_ref) {
            Some(instance) => instance_info(id, instance.as_ref()).await,
            None => Err(LookupError::NotFound(id.clone())),
        };
        replies.push(reply);
    }
    replies
}

async fn instance_info(id: &InstanceId, instance: &dyn Instance) -> LookupReply {
    let status = instance.status();
    match instance.addresses().await {
        Ok(addresses) => Ok(InstanceInfo { status, addresses }),
        Err(err) => {
            warn!(instance_id = %id, error = %err, "Failed to get instance addresses");
            Err(LookupError::Addresses {
                id: id.clone(),
                cause: Arc::new(err),
            })
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
