//! fleet-vt Instance Poller
//!
//! Polls the cloud provider for the status and addresses of every machine's
//! instance and records changes on the machine.
//!
//! ## Architecture
//!
//! - **Aggregator**: Coalesces lookups into one provider call per gather window
//! - **Machine Pollers**: One task per machine, backing off until the instance settles
//! - **Provider**: In-memory fake until a real provider client is wired in

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use fleet_instance_poller::config::Config;
use fleet_instance_poller::testing::{FakeInstance, FakeInstanceGetter, MemoryMachine};
use fleet_instance_poller::{Aggregator, PollOutcome, PollerFleet};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.as_str().into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        gather_window_ms = config.aggregator.gather_window.as_millis(),
        machines = config.machines.len(),
        "Starting fleet-vt instance poller"
    );

    // Create the provider (fake for now)
    let getter = Arc::new(FakeInstanceGetter::new());
    for entry in &config.machines {
        getter.insert(FakeInstance::new(
            entry.instance_id.clone(),
            "running",
            ["127.0.0.1"],
        ));
    }

    let aggregator = Arc::new(Aggregator::with_config(getter, config.aggregator.clone()));

    let mut fleet = PollerFleet::new(aggregator, config.intervals.clone());
    for entry in &config.machines {
        let machine =
            MemoryMachine::new(entry.machine_id.clone(), Some(entry.instance_id.clone()));
        fleet.watch(Arc::new(machine));
    }

    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal");

    let outcomes = fleet.shutdown().await?;
    for (machine_id, outcome) in outcomes {
        match outcome {
            Ok(PollOutcome::Stopped) => {}
            Ok(PollOutcome::InstanceGone) => info!(machine_id = %machine_id, "Instance was gone"),
            Err(e) => warn!(machine_id = %machine_id, error = %e, "Poller ended with error"),
        }
    }

    info!("Instance poller shutdown complete");
    Ok(())
}
