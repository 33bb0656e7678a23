//! Drover kernel: the cluster provisioning domain model and the storage contracts
//! the schedulers run against.
//!
//! - [cluster]: clusters, nodes, accounts.
//! - [job]: jobs, staged tasks, cluster status derivation.
//! - [entity]: templates, services, providers ([EntityStore]).
//! - [store]: the [ClusterStore] repository with atomic per-record updates.
//! - [directory]: provisioner registrations and tenant quotas.

pub mod action;
pub mod cluster;
pub mod directory;
pub mod entity;
pub mod error;
pub mod identity;
pub mod job;
pub mod store;

pub use action::{ClusterAction, ProvisionerAction};
pub use cluster::{Account, Cluster, ClusterStatus, Node, NodeAction, NodeProperties, ADMIN_USER};
pub use directory::{
    InMemoryProvisionerRegistry, InMemoryTenantDirectory, ProvisionerRegistry, TenantDirectory,
    TenantQuota,
};
pub use entity::{
    ClusterTemplate, EntityStore, InMemoryEntityStore, LeasePolicy, ProviderSpec,
    ServiceActionSpec, ServiceSpec, StageDependencies,
};
pub use error::{ErrorKind, KernelError};
pub use identity::{ClusterId, JobId, NodeId, ProvisionerId, TaskId, TenantId, UserId, WorkerId};
pub use job::{derive_cluster_status, ClusterJob, ClusterTask, JobStatus, TaskStatus};
pub use store::{ClusterStore, InMemoryClusterStore, Mutation};
