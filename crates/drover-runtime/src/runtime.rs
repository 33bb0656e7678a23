//! The schedulers wired against one set of collaborators.

use std::sync::Arc;

use crate::catalog::ActionCatalog;
use crate::cleanup::CleanupSweeper;
use crate::cluster_scheduler::{ClusterScheduler, LayoutSolver};
use crate::config::SchedulerConfig;
use crate::context::Collaborators;
use crate::delivery::TaskDelivery;
use crate::job_scheduler::JobScheduler;

#[derive(Clone)]
pub struct ProvisioningRuntime {
    pub ctx: Collaborators,
    pub config: SchedulerConfig,
    pub clusters: Arc<ClusterScheduler>,
    pub jobs: Arc<JobScheduler>,
    pub delivery: Arc<TaskDelivery>,
    pub cleanup: Arc<CleanupSweeper>,
}

impl ProvisioningRuntime {
    pub fn new(ctx: Collaborators, catalog: Arc<ActionCatalog>, config: SchedulerConfig) -> Self {
        let clusters = ClusterScheduler::new(ctx.clone(), catalog, config.clone());
        Self::assemble(ctx, config, clusters)
    }

    pub fn with_solver(
        ctx: Collaborators,
        catalog: Arc<ActionCatalog>,
        config: SchedulerConfig,
        solver: Arc<dyn LayoutSolver>,
    ) -> Self {
        let clusters = ClusterScheduler::new(ctx.clone(), catalog, config.clone()).with_solver(solver);
        Self::assemble(ctx, config, clusters)
    }

    fn assemble(ctx: Collaborators, config: SchedulerConfig, clusters: ClusterScheduler) -> Self {
        let clusters = Arc::new(clusters);
        Self {
            jobs: Arc::new(JobScheduler::new(ctx.clone(), config.clone())),
            delivery: Arc::new(TaskDelivery::new(ctx.clone())),
            cleanup: Arc::new(CleanupSweeper::new(ctx.clone(), clusters.clone(), config.clone())),
            clusters,
            ctx,
            config,
        }
    }

    #[cfg(feature = "execution-server")]
    pub fn api_state(&self) -> crate::server::TaskApiState {
        crate::server::TaskApiState::new(self.delivery.clone(), self.jobs.clone())
    }
}
