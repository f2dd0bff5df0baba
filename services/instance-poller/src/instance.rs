//! Instance identifiers and the information the poller reports about them.

use std::fmt;

use fleet_networking::Address;
use serde::{Deserialize, Serialize};

/// Provider-assigned identifier of a cloud instance.
///
/// Opaque to the poller: it is only compared, hashed and handed back to the
/// provider.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Create an instance ID from a provider string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Current status and addresses of an instance, as seen by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Provider-specific status string (e.g. "running").
    pub status: String,

    /// Addresses in provider order.
    pub addresses: Vec<Address>,
}

impl InstanceInfo {
    /// True when the instance reports both a status and at least one address.
    pub fn is_settled(&self) -> bool {
        !self.status.is_empty() && !self.addresses.is_empty()
    }
}
