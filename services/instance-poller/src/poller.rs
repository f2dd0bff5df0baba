//! Per-machine polling loop.
//!
//! Each provisioned machine gets one poller task. The poller:
//! - Looks up its instance through the shared [`Aggregator`]
//! - Records status and address changes on the machine
//! - Polls quickly (with exponential backoff) until the instance reports a
//!   status and an address, then slowly
//! - Exits when the instance is gone or the poller is shut down

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleet_networking::{addresses_equal, Address};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::aggregator::{Aggregator, LookupError};
use crate::instance::{InstanceId, InstanceInfo};

/// Machine state the poller reads and updates.
#[async_trait]
pub trait Machine: Send + Sync {
    /// Machine ID for logging.
    fn id(&self) -> &str;

    /// Instance backing this machine, or `None` if not yet provisioned.
    async fn instance_id(&self) -> anyhow::Result<Option<InstanceId>>;

    /// Last recorded instance status.
    async fn instance_status(&self) -> anyhow::Result<String>;

    /// Record a new instance status.
    async fn set_instance_status(&self, status: &str) -> anyhow::Result<()>;

    /// Last recorded addresses.
    async fn addresses(&self) -> anyhow::Result<Vec<Address>>;

    /// Record new addresses.
    async fn set_addresses(&self, addresses: &[Address]) -> anyhow::Result<()>;
}

/// Errors that end a poller.
#[derive(Debug, Error)]
pub enum PollerError {
    /// Reading or updating machine state failed.
    #[error("machine {machine}: {source}")]
    Machine {
        machine: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Why a poller finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Shutdown was requested or the aggregator stopped.
    Stopped,

    /// The provider no longer knows the instance.
    InstanceGone,
}

/// Polling schedule.
#[derive(Debug, Clone)]
pub struct PollIntervals {
    /// Interval while the instance is not yet settled.
    pub short: Duration,

    /// Growth factor applied to the short interval after each unsettled poll.
    pub backoff: f64,

    /// Interval once the instance reports a status and an address.
    pub long: Duration,
}

impl Default for PollIntervals {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(1),
            backoff: 2.0,
            long: Duration::from_secs(15 * 60),
        }
    }
}

impl PollIntervals {
    /// Interval to wait after a poll that observed `info`.
    pub fn next(&self, current: Duration, info: Option<&InstanceInfo>) -> Duration {
        if info.is_some_and(InstanceInfo::is_settled) {
            return self.long;
        }
        let grown = current.as_secs_f64() * self.backoff.max(1.0);
        Duration::try_from_secs_f64(grown).map_or(self.long, |next| next.min(self.long))
    }
}

/// Result of one poll.
enum Poll {
    /// Instance info was fetched and recorded.
    Observed(InstanceInfo),

    /// Nothing to record this time; keep backing off.
    Unsettled,

    /// The poller should exit.
    Done(PollOutcome),
}

/// Polls one machine's instance until shutdown.
pub struct MachinePoller {
    machine: Arc<dyn Machine>,
    aggregator: Arc<Aggregator>,
    intervals: PollIntervals,
}

impl MachinePoller {
    /// Create a poller for a machine.
    pub fn new(
        machine: Arc<dyn Machine>,
        aggregator: Arc<Aggregator>,
        intervals: PollIntervals,
    ) -> Self {
        Self {
            machine,
            aggregator,
            intervals,
        }
    }

    /// Run until shutdown, instance removal, or a machine error.
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<PollOutcome, PollerError> {
        let machine_id = self.machine.id().to_string();
        let mut interval = self.intervals.short;

        debug!(machine_id = %machine_id, "Starting machine poller");

        loop {
            if *shutdown.borrow() {
                return Ok(PollOutcome::Stopped);
            }

            match self.poll_once().await? {
                Poll::Observed(info) => {
                    interval = self.intervals.next(interval, Some(&info));
                }
                Poll::Unsettled => {
                    interval = self.intervals.next(interval, None);
                }
                Poll::Done(outcome) => return Ok(outcome),
            }

            debug!(
                machine_id = %machine_id,
                next_poll_ms = interval.as_millis(),
                "Scheduled next instance poll"
            );

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(PollOutcome::Stopped);
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<Poll, PollerError> {
        let instance_id = self
            .machine
            .instance_id()
            .await
            .map_err(|e| self.machine_err(e))?;
        let Some(instance_id) = instance_id else {
            debug!(machine_id = %self.machine.id(), "Machine not provisioned yet");
            return Ok(Poll::Unsettled);
        };

        match self.aggregator.lookup(instance_id.clone()).await {
            Ok(info) => {
                self.record(&info).await?;
                Ok(Poll::Observed(info))
            }
            Err(LookupError::Stopped) => Ok(Poll::Done(PollOutcome::Stopped)),
            Err(e) if e.is_not_found() => {
                info!(
                    machine_id = %self.machine.id(),
                    instance_id = %instance_id,
                    "Instance no longer exists"
                );
                Ok(Poll::Done(PollOutcome::InstanceGone))
            }
            Err(e) => {
                warn!(
                    machine_id = %self.machine.id(),
                    instance_id = %instance_id,
                    error = %e,
                    "Instance poll failed, will retry"
                );
                Ok(Poll::Unsettled)
            }
        }
    }

    /// Write status and addresses back only when they changed.
    async fn record(&self, info: &InstanceInfo) -> Result<(), PollerError> {
        let current_status = self
            .machine
            .instance_status()
            .await
            .map_err(|e| self.machine_err(e))?;
        if current_status != info.status {
            debug!(
                machine_id = %self.machine.id(),
                old = %current_status,
                new = %info.status,
                "Instance status changed"
            );
            self.machine
                .set_instance_status(&info.status)
                .await
                .map_err(|e| self.machine_err(e))?;
        }

        let current_addresses = self
            .machine
            .addresses()
            .await
            .map_err(|e| self.machine_err(e))?;
        if !addresses_equal(&current_addresses, &info.addresses) {
            debug!(
                machine_id = %self.machine.id(),
                count = info.addresses.len(),
                "Instance addresses changed"
            );
            self.machine
                .set_addresses(&info.addresses)
                .await
                .map_err(|e| self.machine_err(e))?;
        }

        Ok(())
    }

    fn machine_err(&self, source: anyhow::Error) -> PollerError {
        PollerError::Machine {
            machine: self.machine.id().to_string(),
            source,
        }
    }
}
