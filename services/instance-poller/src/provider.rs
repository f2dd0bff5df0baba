//! Cloud provider capabilities consumed by the poller.
//!
//! The provider client itself lives outside this crate. The poller only
//! needs two things from it:
//! - `InstanceGetter`: a bulk describe-instances call
//! - `Instance`: a handle exposing status and addresses of one instance

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use fleet_networking::Address;
use thiserror::Error;

use crate::instance::InstanceId;

/// Handle to a single provider instance.
#[async_trait]
pub trait Instance: Debug + Send + Sync {
    /// Current provider status. Never fails.
    fn status(&self) -> String;

    /// Fetch current addresses. May fail independently for each instance.
    async fn addresses(&self) -> anyhow::Result<Vec<Address>>;
}

/// Positional results of a bulk lookup; `None` marks an instance the
/// provider does not know about.
pub type PartialInstances = Vec<Option<Arc<dyn Instance>>>;

/// Failure of a bulk instance lookup.
#[derive(Debug, Error)]
pub enum InstancesError {
    /// The call succeeded but some instances were not found.
    ///
    /// Carries the results aligned to the requested IDs.
    #[error("some instances were not found")]
    Partial(PartialInstances),

    /// The call failed as a whole.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Bulk instance lookup.
#[async_trait]
pub trait InstanceGetter: Send + Sync {
    /// Look up instances by ID.
    ///
    /// On success the result has one entry per requested ID, in request
    /// order. Any retry policy belongs to the implementation.
    async fn instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<Arc<dyn Instance>>, InstancesError>;
}
