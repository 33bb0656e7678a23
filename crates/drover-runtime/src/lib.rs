//! Drover runtime: the cluster provisioning pipeline on top of the kernel model
//! and the lease queue.
//!
//! - [resolver]: minimal service dependency graphs, per stage and per action.
//! - [planner]: expands a cluster action into staged per-node items.
//! - [cluster_scheduler]: validates requests and persists staged jobs.
//! - [job_scheduler]: drives jobs stage by stage with retry and rollback.
//! - [delivery]: the take/finish protocol for remote workers.
//! - [cleanup]: lease recovery, orphan eviction and cluster expiry.
//!
//! Every component is a repeatable pass over persisted state taking an explicit
//! `now`; none owns a thread. With the `execution-server` feature, [server]
//! exposes delivery and job operations over HTTP.

pub mod catalog;
pub mod cleanup;
pub mod cluster_scheduler;
pub mod config;
pub mod context;
pub mod delivery;
pub mod dependency_graph;
pub mod job_scheduler;
pub mod payload;
pub mod planner;
pub mod resolver;
pub mod runtime;
#[cfg(feature = "execution-server")]
pub mod server;

pub use catalog::{ActionCatalog, CrossServiceRule, DependencyStage};
pub use cleanup::{CleanupReport, CleanupSweeper};
pub use cluster_scheduler::{
    ClusterCreateRequest, ClusterScheduler, LayoutSolver, UniformLayoutSolver,
};
pub use config::SchedulerConfig;
pub use context::Collaborators;
pub use delivery::{FinishReport, TaskDelivery, TaskResult};
pub use dependency_graph::DependencyGraph;
pub use job_scheduler::{JobScheduler, JobTickReport, JobView, StageView, TaskView};
pub use payload::TaskPayload;
pub use planner::{JobPlan, JobPlanner, PlanItem, PlanRequest};
pub use resolver::{does_depend_on, ResolvedDependencies, ServiceAction, ServiceDependencyResolver};
pub use runtime::ProvisioningRuntime;
