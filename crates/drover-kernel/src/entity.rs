//! Template, service and provider specifications, and the store resolving them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::RwLock;

use chrono::Duration;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::ProvisionerAction;
use crate::error::KernelError;

/// Cluster lease limits in seconds; `0` means unbounded.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LeasePolicy {
    #[serde(default)]
    pub initial_secs: u64,
    #[serde(default)]
    pub max_secs: u64,
    #[serde(default)]
    pub step_secs: u64,
}

impl LeasePolicy {
    pub fn initial(&self) -> Option<Duration> {
        non_zero_secs(self.initial_secs)
    }

    pub fn max(&self) -> Option<Duration> {
        non_zero_secs(self.max_secs)
    }

    pub fn step(&self) -> Option<Duration> {
        non_zero_secs(self.step_secs)
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        return None;
    }
    Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1_000))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterTemplate {
    pub name: String,
    /// Services placed when a create request names none.
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub min_nodes: u32,
    /// `0` means unbounded.
    #[serde(default)]
    pub max_nodes: u32,
    #[serde(default)]
    pub lease: LeasePolicy,
    #[serde(default)]
    pub config: Value,
}

/// Service dependencies of one provisioning stage.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StageDependencies {
    /// Must be present in the cluster, by name or `provides` alias.
    #[serde(default)]
    pub requires: BTreeSet<String>,
    /// Ordered after when present; ignored otherwise.
    #[serde(default)]
    pub uses: BTreeSet<String>,
}

/// What a provisioner runs for one service action.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceActionSpec {
    /// Automator kind, e.g. `shell` or `chef-solo`.
    pub kind: String,
    #[serde(default)]
    pub fields: Map<String, Value>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ServiceSpec {
    pub name: String,
    #[serde(default)]
    pub provides: BTreeSet<String>,
    #[serde(default)]
    pub install: StageDependencies,
    #[serde(default)]
    pub runtime: StageDependencies,
    #[serde(default)]
    pub actions: BTreeMap<ProvisionerAction, ServiceActionSpec>,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn implements(&self, action: ProvisionerAction) -> bool {
        self.actions.contains_key(&action)
    }

    pub fn with_action(mut self, action: ProvisionerAction, kind: impl Into<String>) -> Self {
        self.actions.insert(
            action,
            ServiceActionSpec {
                kind: kind.into(),
                fields: Map::new(),
            },
        );
        self
    }

    pub fn providing(mut self, alias: impl Into<String>) -> Self {
        self.provides.insert(alias.into());
        self
    }

    pub fn install_requires(mut self, dependency: impl Into<String>) -> Self {
        self.install.requires.insert(dependency.into());
        self
    }

    pub fn runtime_requires(mut self, dependency: impl Into<String>) -> Self {
        self.runtime.requires.insert(dependency.into());
        self
    }

    pub fn runtime_uses(mut self, dependency: impl Into<String>) -> Self {
        self.runtime.uses.insert(dependency.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProviderSpec {
    pub name: String,
    /// Provisioner plugin handling machine tasks for this provider.
    pub provisioner_type: String,
    /// Credentials and defaults handed to machine tasks.
    #[serde(default)]
    pub fields: Map<String, Value>,
}

/// Read access to template, service and provider specifications.
pub trait EntityStore: Send + Sync {
    fn template(&self, name: &str) -> Result<Option<ClusterTemplate>, KernelError>;

    fn service(&self, name: &str) -> Result<Option<ServiceSpec>, KernelError>;

    fn provider(&self, name: &str) -> Result<Option<ProviderSpec>, KernelError>;

    /// Resolves every name in `names`; an unknown service is a not-found error.
    fn services(&self, names: &BTreeSet<String>) -> Result<Vec<ServiceSpec>, KernelError> {
        names
            .iter()
            .map(|name| {
                self.service(name)?
                    .ok_or_else(|| KernelError::not_found("service", name))
            })
            .collect()
    }
}

#[derive(Default)]
struct Entities {
    templates: HashMap<String, ClusterTemplate>,
    services: HashMap<String, ServiceSpec>,
    providers: HashMap<String, ProviderSpec>,
}

/// In-memory entity store.
#[derive(Default)]
pub struct InMemoryEntityStore {
    inner: RwLock<Entities>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_template(&self, template: ClusterTemplate) -> Result<(), KernelError> {
        let mut inner = self.write()?;
        inner.templates.insert(template.name.clone(), template);
        Ok(())
    }

    pub fn put_service(&self, service: ServiceSpec) -> Result<(), KernelError> {
        let mut inner = self.write()?;
        inner.services.insert(service.name.clone(), service);
        Ok(())
    }

    pub fn put_provider(&self, provider: ProviderSpec) -> Result<(), KernelError> {
        let mut inner = self.write()?;
        inner.providers.insert(provider.name.clone(), provider);
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Entities>, KernelError> {
        self.inner
            .read()
            .map_err(|e| KernelError::Store(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Entities>, KernelError> {
        self.inner
            .write()
            .map_err(|e| KernelError::Store(e.to_string()))
    }
}

impl EntityStore for InMemoryEntityStore {
    fn template(&self, name: &str) -> Result<Option<ClusterTemplate>, KernelError> {
        Ok(self.read()?.templates.get(name).cloned())
    }

    fn service(&self, name: &str) -> Result<Option<ServiceSpec>, KernelError> {
        Ok(self.read()?.services.get(name).cloned())
    }

    fn provider(&self, name: &str) -> Result<Option<ProviderSpec>, KernelError> {
        Ok(self.read()?.providers.get(name).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lease_policy_zero_means_unbounded() {
        let policy = LeasePolicy {
            initial_secs: 3600,
            max_secs: 0,
            step_secs: 0,
        };
        assert_eq!(policy.initial(), Some(Duration::hours(1)));
        assert_eq!(policy.max(), None);
        assert_eq!(policy.step(), None);
    }

    #[test]
    fn services_lookup_reports_the_missing_name() {
        let store = InMemoryEntityStore::new();
        store
            .put_service(ServiceSpec::new("base").with_action(ProvisionerAction::Install, "shell"))
            .unwrap();
        let names = BTreeSet::from(["base".to_string(), "ghost".to_string()]);
        let err = store.services(&names).unwrap_err();
        assert_eq!(err.to_string(), "not found: service 'ghost'");
    }

    #[test]
    fn service_spec_deserializes_with_defaults() {
        let spec: ServiceSpec = serde_json::from_value(serde_json::json!({
            "name": "hdfs",
            "runtime": {"requires": ["zookeeper"]},
            "actions": {"START": {"kind": "shell"}}
        }))
        .unwrap();
        assert!(spec.implements(ProvisionerAction::Start));
        assert!(!spec.implements(ProvisionerAction::Install));
        assert!(spec.runtime.requires.contains("zookeeper"));
        assert!(spec.provides.is_empty());
    }
}
