//! In-memory provider and machine doubles.
//!
//! Used by the tests and by the binary when no real provider is wired in.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use fleet_networking::{new_addresses, Address};
use tracing::debug;

use crate::instance::InstanceId;
use crate::poller::Machine;
use crate::provider::{Instance, InstanceGetter, InstancesError, PartialInstances};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Fake Instance
// =============================================================================

#[derive(Debug, Default)]
struct InstanceState {
    status: String,
    addresses: Vec<Address>,
    address_error: Option<String>,
}

/// Instance whose status and addresses can be changed by tests.
#[derive(Debug)]
pub struct FakeInstance {
    id: InstanceId,
    state: Mutex<InstanceState>,
}

impl FakeInstance {
    /// Create an instance with a status and addresses.
    pub fn new<I, S>(id: impl Into<InstanceId>, status: &str, addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            state: Mutex::new(InstanceState {
                status: status.to_string(),
                addresses: new_addresses(addresses),
                address_error: None,
            }),
        }
    }

    /// Change the reported status.
    pub fn set_status(&self, status: &str) {
        lock(&self.state).status = status.to_string();
    }

    /// Change the reported addresses.
    pub fn set_addresses(&self, addresses: Vec<Address>) {
        lock(&self.state).addresses = addresses;
    }

    /// Make `addresses()` fail with the given message.
    pub fn fail_addresses(&self, message: &str) {
        lock(&self.state).address_error = Some(message.to_string());
    }
}

#[async_trait]
impl Instance for FakeInstance {
    fn status(&self) -> String {
        lock(&self.state).status.clone()
    }

    async fn addresses(&self) -> anyhow::Result<Vec<Address>> {
        let state = lock(&self.state);
        match &state.address_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(state.addresses.clone()),
        }
    }
}

// =============================================================================
// Fake Instance Getter
// =============================================================================

/// Provider double backed by a map of instances.
///
/// Unknown IDs produce a partial result. Every call is recorded.
#[derive(Debug, Default)]
pub struct FakeInstanceGetter {
    instances: Mutex<HashMap<InstanceId, Arc<FakeInstance>>>,
    failure: Mutex<Option<String>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<Vec<InstanceId>>>,
    call_count: AtomicUsize,
}

impl FakeInstanceGetter {
    /// Create an empty getter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance, returning a handle for later changes.
    pub fn insert(&self, instance: FakeInstance) -> Arc<FakeInstance> {
        let instance = Arc::new(instance);
        lock(&self.instances).insert(instance.id.clone(), Arc::clone(&instance));
        instance
    }

    /// Forget an instance; later lookups report it missing.
    pub fn remove(&self, id: &InstanceId) {
        lock(&self.instances).remove(id);
    }

    /// Fail every call with the given message.
    pub fn fail_with(&self, message: &str) {
        *lock(&self.failure) = Some(message.to_string());
    }

    /// Stop failing calls.
    pub fn clear_failure(&self) {
        *lock(&self.failure) = None;
    }

    /// Delay every call.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    /// IDs passed to each call, in call order.
    pub fn calls(&self) -> Vec<Vec<InstanceId>> {
        lock(&self.calls).clone()
    }

    /// Number of calls made.
    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl InstanceGetter for FakeInstanceGetter {
    async fn instances(
        &self,
        ids: &[InstanceId],
    ) -> Result<Vec<Arc<dyn Instance>>, InstancesError> {
        self.call_count.fetch_add(1, Ordering::SeqCst);
        lock(&self.calls).push(ids.to_vec());
        debug!(count = ids.len(), "[FAKE] Describing instances");

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = lock(&self.failure).clone();
        if let Some(message) = failure {
            return Err(InstancesError::Other(anyhow!(message)));
        }

        let results: PartialInstances = {
            let known = lock(&self.instances);
            ids.iter()
                .map(|id| {
                    known
                        .get(id)
                        .map(|instance| Arc::clone(instance) as Arc<dyn Instance>)
                })
                .collect()
        };

        if results.iter().all(Option::is_some) {
            Ok(results.into_iter().flatten().collect())
        } else {
            Err(InstancesError::Partial(results))
        }
    }
}

// =============================================================================
// Memory Machine
// =============================================================================

#[derive(Debug, Default)]
struct MachineState {
    instance_id: Option<InstanceId>,
    instance_status: String,
    addresses: Vec<Address>,
    status_updates: usize,
    address_updates: usize,
}

/// Machine record kept in memory.
#[derive(Debug)]
pub struct MemoryMachine {
    id: String,
    state: Mutex<MachineState>,
}

impl MemoryMachine {
    /// Create a machine, optionally already provisioned.
    pub fn new(id: impl Into<String>, instance_id: Option<InstanceId>) -> Self {
        Self {
            id: id.into(),
            state: Mutex::new(MachineState {
                instance_id,
                ..Default::default()
            }),
        }
    }

    /// Attach an instance to the machine.
    pub fn provision(&self, instance_id: InstanceId) {
        lock(&self.state).instance_id = Some(instance_id);
    }

    /// Recorded instance status.
    pub fn recorded_status(&self) -> String {
        lock(&self.state).instance_status.clone()
    }

    /// Recorded addresses.
    pub fn recorded_addresses(&self) -> Vec<Address> {
        lock(&self.state).addresses.clone()
    }

    /// How many times the status was written.
    pub fn status_updates(&self) -> usize {
        lock(&self.state).status_updates
    }

    /// How many times the addresses were written.
    pub fn address_updates(&self) -> usize {
        lock(&self.state).address_updates
    }
}

#[async_trait]
impl Machine for MemoryMachine {
    fn id(&self) -> &str {
        &self.id
    }

    async fn instance_id(&self) -> anyhow::Result<Option<InstanceId>> {
        Ok(lock(&self.state).instance_id.clone())
    }

    async fn instance_status(&self) -> anyhow::Result<String> {
        Ok(self.recorded_status())
    }

    async fn set_instance_status(&self, status: &str) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.instance_status = status.to_string();
        state.status_updates += 1;
        Ok(())
    }

    async fn addresses(&self) -> anyhow::Result<Vec<Address>> {
        Ok(self.recorded_addresses())
    }

    async fn set_addresses(&self, addresses: &[Address]) -> anyhow::Result<()> {
        let mut state = lock(&self.state);
        state.addresses = addresses.to_vec();
        state.address_updates += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_getter_partial() {
        let getter = FakeInstanceGetter::new();
        getter.insert(FakeInstance::new("a", "running", ["10.0.0.1"]));

        let ids = vec![InstanceId::from("a"), InstanceId::from("b")];
        match getter.instances(&ids).await {
            Err(InstancesError::Partial(results)) => {
                assert!(results[0].is_some());
                assert!(results[1].is_none());
            }
            other => panic!("expected partial result, got {:?}", other),
        }
        assert_eq!(getter.calls(), vec![ids]);
    }

    #[tokio::test]
    async fn test_fake_getter_failure() {
        let getter = FakeInstanceGetter::new();
        getter.fail_with("api down");

        let err = getter.instances(&[InstanceId::from("a")]).await.unwrap_err();
        assert!(matches!(err, InstancesError::Other(_)));
        assert_eq!(err.to_string(), "api down");
        assert_eq!(getter.call_count(), 1);
    }

    #[tokio::test]
    async fn test_memory_machine_updates() {
        let machine = MemoryMachine::new("0", None);
        assert_eq!(machine.instance_id().await.unwrap(), None);

        machine.provision("i-1".into());
        machine.set_instance_status("running").await.unwrap();
        assert_eq!(machine.instance_id().await.unwrap(), Some(InstanceId::from("i-1")));
        assert_eq!(machine.recorded_status(), "running");
        assert_eq!(machine.status_updates(), 1);
        assert_eq!(machine.address_updates(), 0);
    }
}
