//! Fleet of machine pollers sharing one aggregator.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::aggregator::{Aggregator, AggregatorError};
use crate::poller::{Machine, MachinePoller, PollIntervals, PollOutcome, PollerError};

struct PollerTask {
    machine_id: String,
    handle: JoinHandle<Result<PollOutcome, PollerError>>,
}

/// Runs one [`MachinePoller`] per machine and tears them down together.
pub struct PollerFleet {
    aggregator: Arc<Aggregator>,
    intervals: PollIntervals,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<PollerTask>,
}

impl PollerFleet {
    /// Create an empty fleet.
    pub fn new(aggregator: Arc<Aggregator>, intervals: PollIntervals) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            aggregator,
            intervals,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Start polling a machine.
    pub fn watch(&mut self, machine: Arc<dyn Machine>) {
        let machine_id = machine.id().to_string();
        let poller = MachinePoller::new(
            machine,
            Arc::clone(&self.aggregator),
            self.intervals.clone(),
        );
        let shutdown = self.shutdown_tx.subscribe();

        let id = machine_id.clone();
        let handle = tokio::spawn(async move {
            let result = poller.run(shutdown).await;
            match &result {
                Ok(PollOutcome::InstanceGone) => {
                    info!(machine_id = %id, "Machine poller finished, instance gone");
                }
                Ok(PollOutcome::Stopped) => {}
                Err(e) => error!(machine_id = %id, error = %e, "Machine poller failed"),
            }
            result
        });

        info!(machine_id = %machine_id, "Watching machine");
        self.tasks.push(PollerTask { machine_id, handle });
    }

    /// Number of pollers still running.
    pub fn running_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.handle.is_finished()).count()
    }

    /// Shared aggregator.
    pub fn aggregator(&self) -> &Arc<Aggregator> {
        &self.aggregator
    }

    /// Stop every poller, then the aggregator.
    ///
    /// Returns the outcome of each poller keyed by machine ID.
    pub async fn shutdown(
        self,
    ) -> Result<Vec<(String, Result<PollOutcome, PollerError>)>, AggregatorError> {
        info!(count = self.tasks.len(), "Stopping machine pollers");
        self.shutdown_tx.send_replace(true);

        let mut outcomes = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match task.handle.await {
                Ok(result) => outcomes.push((task.machine_id, result)),
                Err(e) => {
                    warn!(
                        machine_id = %task.machine_id,
                        error = %e,
                        "Machine poller task panicked"
                    );
                }
            }
        }

        self.aggregator.stop();
        self.aggregator.await_stopped().await?;

        Ok(outcomes)
    }
}
