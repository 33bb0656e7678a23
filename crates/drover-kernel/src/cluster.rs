//! Clusters, the nodes they are made of, and the accounts that own them.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::ProvisionerAction;
use crate::identity::{ClusterId, JobId, NodeId, TaskId, TenantId, UserId};
use crate::job::TaskStatus;

/// User id with administrative rights over every cluster of its tenant.
pub const ADMIN_USER: &str = "admin";

/// Owner of a cluster.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct Account {
    pub user_id: UserId,
    pub tenant_id: TenantId,
}

impl Account {
    pub fn new(user_id: impl Into<UserId>, tenant_id: impl Into<TenantId>) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
        }
    }

    /// Tenant administrator, also used by system sweeps acting on a tenant's behalf.
    pub fn admin(tenant_id: impl Into<TenantId>) -> Self {
        Self::new(ADMIN_USER, tenant_id)
    }

    pub fn is_admin(&self) -> bool {
        self.user_id == ADMIN_USER
    }

    /// Whether this account may act on something owned by `owner`.
    pub fn can_manage(&self, owner: &Account) -> bool {
        self.tenant_id == owner.tenant_id && (self.is_admin() || self.user_id == owner.user_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Active,
    Incomplete,
    Terminated,
    Inconsistent,
}

impl ClusterStatus {
    /// Statuses the expiry sweep considers.
    pub fn is_expirable(&self) -> bool {
        matches!(self, Self::Pending | Self::Active | Self::Incomplete)
    }
}

/// A tenant's group of provisioned machines governed by a template.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub account: Account,
    pub status: ClusterStatus,
    pub template: String,
    pub provider: String,
    /// User-supplied provider fields, layered over the provider's own fields.
    #[serde(default)]
    pub provider_fields: Map<String, Value>,
    pub services: BTreeSet<String>,
    pub nodes: BTreeSet<NodeId>,
    #[serde(default)]
    pub config: Value,
    pub create_time: DateTime<Utc>,
    /// `None` means the cluster never expires.
    pub expire_time: Option<DateTime<Utc>>,
    pub latest_job_id: Option<JobId>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: u64,
}

impl Cluster {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|t| t <= now)
    }

    /// Id for the next job planned on this cluster.
    pub fn next_job_id(&self) -> JobId {
        match &self.latest_job_id {
            Some(latest) => latest.next(),
            None => JobId::new(self.id.clone(), 1),
        }
    }
}

/// Properties a node accumulates as its tasks finish.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeProperties {
    pub hostname: Option<String>,
    /// Interface name (`access`, `bind`, ...) to address.
    #[serde(default)]
    pub ip_addresses: BTreeMap<String, String>,
    /// Provider-specific attributes (provider node id, flavor, image, ...).
    #[serde(default)]
    pub extra: Map<String, Value>,
}

impl NodeProperties {
    /// Merges a finished task's result into the properties.
    ///
    /// `hostname` and `ipaddresses` keys of `result` update the typed fields; every
    /// other key lands in `extra`. Explicit `ip_addresses` win over the result's.
    pub fn merge_result(&mut self, result: &Map<String, Value>, ip_addresses: &BTreeMap<String, String>) {
        for (key, value) in result {
            match key.as_str() {
                "hostname" => {
                    if let Some(hostname) = value.as_str() {
                        self.hostname = Some(hostname.to_string());
                    }
                }
                "ipaddresses" => {
                    if let Some(map) = value.as_object() {
                        for (iface, addr) in map {
                            if let Some(addr) = addr.as_str() {
                                self.ip_addresses.insert(iface.clone(), addr.to_string());
                            }
                        }
                    }
                }
                _ => {
                    self.extra.insert(key.clone(), value.clone());
                }
            }
        }
        for (iface, addr) in ip_addresses {
            self.ip_addresses.insert(iface.clone(), addr.clone());
        }
    }
}

/// One entry of a node's action history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct NodeAction {
    pub task_id: TaskId,
    pub action: ProvisionerAction,
    pub service: Option<String>,
    pub status: TaskStatus,
    pub submit_time: DateTime<Utc>,
    pub status_time: DateTime<Utc>,
    #[serde(default)]
    pub message: String,
}

/// One machine in a cluster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub cluster_id: ClusterId,
    pub services: BTreeSet<String>,
    #[serde(default)]
    pub properties: NodeProperties,
    #[serde(default)]
    pub actions: Vec<NodeAction>,
    #[serde(default)]
    pub version: u64,
}

impl Node {
    pub fn new(id: impl Into<NodeId>, cluster_id: impl Into<ClusterId>, services: BTreeSet<String>) -> Self {
        Self {
            id: id.into(),
            cluster_id: cluster_id.into(),
            services,
            properties: NodeProperties::default(),
            actions: Vec::new(),
            version: 0,
        }
    }

    /// Appends a history entry for a newly dispatched task.
    ///
    /// Dispatching the same task twice keeps the first entry.
    pub fn record_dispatch(
        &mut self,
        task_id: &TaskId,
        action: ProvisionerAction,
        service: Option<String>,
        now: DateTime<Utc>,
    ) {
        if self.actions.iter().any(|a| &a.task_id == task_id) {
            return;
        }
        self.actions.push(NodeAction {
            task_id: task_id.clone(),
            action,
            service,
            status: TaskStatus::InProgress,
            submit_time: now,
            status_time: now,
            message: String::new(),
        });
    }

    /// Updates the history entry of `task_id`; returns false when there is none.
    pub fn update_action(
        &mut self,
        task_id: &TaskId,
        status: TaskStatus,
        now: DateTime<Utc>,
        message: impl Into<String>,
    ) -> bool {
        match self.actions.iter_mut().rev().find(|a| &a.task_id == task_id) {
            Some(entry) => {
                entry.status = status;
                entry.status_time = now;
                entry.message = message.into();
                true
            }
            None => false,
        }
    }

    pub fn current_action(&self) -> Option<&NodeAction> {
        self.actions.last()
    }
}
