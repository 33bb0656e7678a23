//! Provisioner registrations and tenant quotas.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::identity::TenantId;

pub trait ProvisionerRegistry: Send + Sync {
    fn is_registered(&self, provisioner_id: &str) -> Result<bool, KernelError>;
}

#[derive(Default)]
pub struct InMemoryProvisionerRegistry {
    registered: RwLock<HashSet<String>>,
}

impl InMemoryProvisionerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, provisioner_id: impl Into<String>) -> Result<(), KernelError> {
        self.registered
            .write()
            .map_err(|e| KernelError::Store(e.to_string()))?
            .insert(provisioner_id.into());
        Ok(())
    }

    pub fn unregister(&self, provisioner_id: &str) -> Result<bool, KernelError> {
        Ok(self
            .registered
            .write()
            .map_err(|e| KernelError::Store(e.to_string()))?
            .remove(provisioner_id))
    }
}

impl ProvisionerRegistry for InMemoryProvisionerRegistry {
    fn is_registered(&self, provisioner_id: &str) -> Result<bool, KernelError> {
        Ok(self
            .registered
            .read()
            .map_err(|e| KernelError::Store(e.to_string()))?
            .contains(provisioner_id))
    }
}

/// Per-tenant limits on live clusters and nodes; `0` means unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TenantQuota {
    pub max_clusters: u32,
    pub max_nodes: u32,
}

impl TenantQuota {
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Whether `clusters` live clusters holding `nodes` nodes fit the quota.
    pub fn admits(&self, clusters: usize, nodes: usize) -> bool {
        (self.max_clusters == 0 || clusters <= self.max_clusters as usize)
            && (self.max_nodes == 0 || nodes <= self.max_nodes as usize)
    }
}

pub trait TenantDirectory: Send + Sync {
    fn quota(&self, tenant_id: &str) -> Result<TenantQuota, KernelError>;
}

/// Tenant directory with a default quota and per-tenant overrides.
#[derive(Default)]
pub struct InMemoryTenantDirectory {
    default_quota: TenantQuota,
    quotas: RwLock<HashMap<TenantId, TenantQuota>>,
}

impl InMemoryTenantDirectory {
    pub fn new(default_quota: TenantQuota) -> Self {
        Self {
            default_quota,
            quotas: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_quota(&self, tenant_id: impl Into<TenantId>, quota: TenantQuota) -> Result<(), KernelError> {
        self.quotas
            .write()
            .map_err(|e| KernelError::Store(e.to_string()))?
            .insert(tenant_id.into(), quota);
        Ok(())
    }
}

impl TenantDirectory for InMemoryTenantDirectory {
    fn quota(&self, tenant_id: &str) -> Result<TenantQuota, KernelError> {
        Ok(self
            .quotas
            .read()
            .map_err(|e| KernelError::Store(e.to_string()))?
            .get(tenant_id)
            .copied()
            .unwrap_or(self.default_quota))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_tracks_registrations() {
        let registry = InMemoryProvisionerRegistry::new();
        assert!(!registry.is_registered("p1").unwrap());
        registry.register("p1").unwrap();
        assert!(registry.is_registered("p1").unwrap());
        assert!(registry.unregister("p1").unwrap());
        assert!(!registry.is_registered("p1").unwrap());
    }

    #[test]
    fn quota_overrides_default() {
        let directory = InMemoryTenantDirectory::new(TenantQuota {
            max_clusters: 2,
            max_nodes: 0,
        });
        directory
            .set_quota("big", TenantQuota::unbounded())
            .unwrap();
        assert!(!directory.quota("small").unwrap().admits(3, 1));
        assert!(directory.quota("small").unwrap().admits(2, 500));
        assert!(directory.quota("big").unwrap().admits(100, 100));
    }
}
