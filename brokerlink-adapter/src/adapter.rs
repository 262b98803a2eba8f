//! Registry of the inflow activations deployed against one set of container
//! collaborators.

use std::collections::HashMap;
use std::sync::Arc;

// ---

use parking_lot::Mutex;

// ---

use brokerlink_domain::{
    // ---
    ActivationConfig,
    BrokerError,
    DirectoryPtr,
    EndpointFactoryPtr,
    Result,
    TransactionCoordinatorPtr,
    WorkSchedulerPtr,
};

// ---

use super::{ActivationDeps, ActivationId, InflowActivation};

pub struct ResourceAdapter {
    // ---
    directory: DirectoryPtr,
    scheduler: WorkSchedulerPtr,
    coordinator: Option<TransactionCoordinatorPtr>,
    activations: Mutex<HashMap<ActivationId, Arc<InflowActivation>>>,
}

// ---

impl ResourceAdapter {
    // ---
    pub fn new(
        directory: DirectoryPtr,
        scheduler: WorkSchedulerPtr,
        coordinator: Option<TransactionCoordinatorPtr>,
    ) -> Self {
        // ---
        Self {
            directory,
            scheduler,
            coordinator,
            activations: Mutex::new(HashMap::new()),
        }
    }

    /// Validate `config`, then create, register and start an activation
    /// delivering to `endpoint_factory`.
    pub fn endpoint_activation(
        &self,
        config: ActivationConfig,
        endpoint_factory: EndpointFactoryPtr,
    ) -> Result<ActivationId> {
        // ---
        let deps = ActivationDeps {
            directory: self.directory.clone(),
            endpoint_factory,
            scheduler: self.scheduler.clone(),
            coordinator: self.coordinator.clone(),
        };
        let activation = InflowActivation::new(config, deps)?;
        let id = activation.id();
        activation.start()?;

        self.activations.lock().insert(id, activation);
        tracing::info!(activation = %id, "endpoint activated");
        Ok(id)
    }

    /// Stop and forget one activation.
    pub fn endpoint_deactivation(&self, id: ActivationId) -> Result<()> {
        // ---
        let activation = self
            .activations
            .lock()
            .remove(&id)
            .ok_or_else(|| BrokerError::IllegalState(format!("no activation {id}")))?;
        activation.stop();
        tracing::info!(activation = %id, "endpoint deactivated");
        Ok(())
    }

    pub fn activation(&self, id: ActivationId) -> Option<Arc<InflowActivation>> {
        self.activations.lock().get(&id).cloned()
    }

    pub fn activation_count(&self) -> usize {
        self.activations.lock().len()
    }

    /// Stop every activation. Each stop logs its own teardown errors.
    pub fn stop(&self) {
        // ---
        let drained: Vec<_> = self.activations.lock().drain().collect();
        for (id, activation) in drained {
            tracing::debug!(activation = %id, "stopping activation");
            activation.stop();
        }
        tracing::info!("resource adapter stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
