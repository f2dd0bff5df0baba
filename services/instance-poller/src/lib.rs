//! fleet-vt Instance Poller Library
//!
//! Keeps each machine's recorded instance status and addresses in sync with
//! the cloud provider without calling the provider once per machine.
//!
//! ## Architecture
//!
//! ```text
//! PollerFleet
//! ├── MachinePoller(machine)   (one task per machine)
//! │        │ lookup(instance_id)
//! │        ▼
//! └── Aggregator               (single coordinator task)
//!          │ one call per gather window
//!          ▼
//!     InstanceGetter           (provider client)
//! ```
//!
//! ## Modules
//!
//! - `aggregator`: Batches concurrent lookups into one provider call
//! - `provider`: Provider capabilities the poller consumes
//! - `poller`: Per-machine polling loop
//! - `fleet`: Spawns and stops pollers together
//! - `testing`: In-memory provider and machine doubles

pub mod aggregator;
pub mod config;
pub mod fleet;
pub mod instance;
pub mod poller;
pub mod provider;
pub mod testing;

// Re-export commonly used types
pub use aggregator::{Aggregator, AggregatorConfig, AggregatorError, LookupError, LookupReply};
pub use fleet::PollerFleet;
pub use instance::{InstanceId, InstanceInfo};
pub use poller::{Machine, MachinePoller, PollIntervals, PollOutcome, PollerError};
pub use provider::{Instance, InstanceGetter, InstancesError};
