//! Handles to the storage collaborators shared by every core service.

use std::sync::Arc;

use drover_execution_runtime::{InMemoryLeaseQueue, LeaseQueue};
use drover_kernel::{
    ClusterStore, EntityStore, InMemoryClusterStore, InMemoryEntityStore,
    InMemoryProvisionerRegistry, InMemoryTenantDirectory, ProvisionerRegistry, TenantDirectory,
    TenantQuota,
};

#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn ClusterStore>,
    pub entities: Arc<dyn EntityStore>,
    pub tenants: Arc<dyn TenantDirectory>,
    pub provisioners: Arc<dyn ProvisionerRegistry>,
    pub queue: Arc<dyn LeaseQueue>,
}

impl Collaborators {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        entities: Arc<dyn EntityStore>,
        tenants: Arc<dyn TenantDirectory>,
        provisioners: Arc<dyn ProvisionerRegistry>,
        queue: Arc<dyn LeaseQueue>,
    ) -> Self {
        Self {
            store,
            entities,
            tenants,
            provisioners,
            queue,
        }
    }

    /// In-memory collaborators. The concrete entity store and registry are
    /// returned too so callers can seed them.
    pub fn in_memory() -> (Self, Arc<InMemoryEntityStore>, Arc<InMemoryProvisionerRegistry>) {
        let entities = Arc::new(InMemoryEntityStore::new());
        let provisioners = Arc::new(InMemoryProvisionerRegistry::new());
        let collaborators = Self::new(
            Arc::new(InMemoryClusterStore::new()),
            entities.clone(),
            Arc::new(InMemoryTenantDirectory::new(TenantQuota::unbounded())),
            provisioners.clone(),
            Arc::new(InMemoryLeaseQueue::new()),
        );
        (collaborators, entities, provisioners)
    }

    /// Replaces the lease queue, e.g. with a persistent backend.
    pub fn with_queue(mut self, queue: Arc<dyn LeaseQueue>) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_tenants(mut self, tenants: Arc<dyn TenantDirectory>) -> Self {
        self.tenants = tenants;
        self
    }
}
