//! Periodic reconciliation of the lease queue against persisted task state.
//!
//! Each [CleanupSweeper::run] recovers leases that outlived the lease timeout,
//! evicts queue elements whose task is gone, and schedules a CLUSTER_DELETE for
//! clusters past their expire time. Every step is idempotent over persisted
//! state, so concurrent sweeps on several replicas are harmless.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use drover_execution_runtime::{stale_leases, ElementOutcome, LeasedElement};
use drover_kernel::{Account, ClusterAction, ErrorKind, KernelError, TaskId, TaskStatus, TenantId};

use crate::cluster_scheduler::ClusterScheduler;
use crate::config::SchedulerConfig;
use crate::context::Collaborators;

const LEASE_TIMED_OUT: &str = "lease timed out";

/// What one sweep did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Leased tasks failed because their lease outlived the timeout.
    pub timed_out: usize,
    /// Queue elements removed because their task no longer exists.
    pub orphaned: usize,
    /// Clusters a CLUSTER_DELETE was scheduled for.
    pub expired: usize,
}

pub struct CleanupSweeper {
    ctx: Collaborators,
    clusters: Arc<ClusterScheduler>,
    config: SchedulerConfig,
}

impl CleanupSweeper {
    pub fn new(ctx: Collaborators, clusters: Arc<ClusterScheduler>, config: SchedulerConfig) -> Self {
        Self {
            ctx,
            clusters,
            config,
        }
    }

    pub fn run(&self, now: DateTime<Utc>) -> Result<CleanupReport, KernelError> {
        let mut report = CleanupReport::default();
        for tenant_id in self.ctx.queue.tenants()? {
            report.timed_out += self.recover_stale_leases(&tenant_id, now, &mut report.orphaned)?;
            report.orphaned += self.evict_orphans(&tenant_id)?;
        }
        report.expired = self.expire_clusters(now)?;
        if report != CleanupReport::default() {
            log::info!(
                "cleanup_sweep timed_out={} orphaned={} expired={}",
                report.timed_out,
                report.orphaned,
                report.expired
            );
        }
        Ok(report)
    }

    fn recover_stale_leases(
        &self,
        tenant_id: &TenantId,
        now: DateTime<Utc>,
        orphaned: &mut usize,
    ) -> Result<usize, KernelError> {
        let queue = &self.ctx.queue;
        let mut timed_out = 0;
        for leased in stale_leases(queue.as_ref(), tenant_id, &self.config.lease_config(), now)? {
            let element_id = &leased.element.id;
            let task = match element_id.parse::<TaskId>() {
                Ok(task_id) => self.ctx.store.get_task(&task_id)?,
                Err(_) => None,
            };
            let Some(task) = task else {
                if queue.remove(tenant_id, element_id)? {
                    *orphaned += 1;
                }
                continue;
            };
            if task.status.is_terminal() {
                // finished by its holder between the listing and now
                self.drop_lease(&leased, "task already finished")?;
                continue;
            }
            if self.fail_timed_out(&leased, &task.id, now)? {
                timed_out += 1;
            }
            self.drop_lease(&leased, LEASE_TIMED_OUT)?;
        }
        Ok(timed_out)
    }

    /// Fails the task held under `leased` if its holder still matches.
    fn fail_timed_out(
        &self,
        leased: &LeasedElement,
        task_id: &TaskId,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let holder = leased.lease.consumer_id.as_str();
        let failed = self.ctx.store.update_task(task_id, &mut |task| {
            if task.status.is_terminal() {
                return Err(KernelError::Conflict(format!(
                    "task '{}' is already {:?}",
                    task.id, task.status
                )));
            }
            if task.status == TaskStatus::InProgress && task.worker_id.as_deref() != Some(holder) {
                return Err(KernelError::Conflict(format!(
                    "task '{}' is held by another worker",
                    task.id
                )));
            }
            task.status = TaskStatus::Failed;
            task.status_time = now;
            task.worker_id = None;
            task.message = LEASE_TIMED_OUT.to_string();
            Ok(())
        });
        let task = match failed {
            Ok(task) => task,
            Err(err) if err.kind() == ErrorKind::Conflict => {
                log::debug!("lease_recovery_skipped task_id={} reason={}", task_id, err);
                return Ok(false);
            }
            Err(err) => return Err(err),
        };

        let node = self.ctx.store.update_node(&task.node_id, &mut |node| {
            node.update_action(&task.id, TaskStatus::Failed, now, LEASE_TIMED_OUT);
            Ok(())
        });
        if let Err(err) = node {
            log::warn!(
                "node_update_skipped node_id={} task_id={} error={}",
                task.node_id,
                task.id,
                err
            );
        }
        log::warn!(
            "lease_timed_out task_id={} tenant_id={} worker_id={} lease_start={}",
            task.id,
            leased.lease.tenant_id,
            holder,
            leased.lease.lease_start
        );
        Ok(true)
    }

    fn drop_lease(&self, leased: &LeasedElement, reason: &str) -> Result<(), KernelError> {
        self.ctx.queue.record_progress(
            &leased.lease.consumer_id,
            &leased.lease.tenant_id,
            &leased.element.id,
            ElementOutcome::Dropped,
            reason,
        )?;
        Ok(())
    }

    /// Removes queued and leased elements whose task no longer exists.
    fn evict_orphans(&self, tenant_id: &TenantId) -> Result<usize, KernelError> {
        let queue = &self.ctx.queue;
        let mut ids: Vec<String> = queue.get_queued(tenant_id)?.into_iter().map(|e| e.id).collect();
        ids.extend(
            queue
                .get_being_consumed(tenant_id)?
                .into_iter()
                .map(|leased| leased.element.id),
        );
        let mut removed = 0;
        for id in ids {
            let exists = match id.parse::<TaskId>() {
                Ok(task_id) => self.ctx.store.get_task(&task_id)?.is_some(),
                Err(_) => false,
            };
            if !exists && queue.remove(tenant_id, &id)? {
                log::debug!("queue_orphan_removed element_id={} tenant_id={}", id, tenant_id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Schedules one CLUSTER_DELETE per expired cluster, at most a batch per sweep.
    fn expire_clusters(&self, now: DateTime<Utc>) -> Result<usize, KernelError> {
        let expired = self
            .ctx
            .store
            .list_expired_clusters(now, self.config.cleanup_batch_size)?;
        let mut scheduled = 0;
        for cluster in expired {
            let Some(latest_id) = cluster.latest_job_id.as_ref() else {
                continue;
            };
            let Some(latest) = self.ctx.store.get_job(latest_id)? else {
                continue;
            };
            if latest.action == ClusterAction::ClusterDelete && latest.is_active() {
                continue;
            }
            let result = self.clusters.schedule_action(
                &cluster.id,
                &Account::admin(cluster.account.tenant_id.clone()),
                ClusterAction::ClusterDelete,
                &BTreeSet::new(),
                now,
            );
            match result {
                Ok(job) => {
                    log::info!(
                        "cluster_expired cluster_id={} tenant_id={} expire_time={:?} job_id={}",
                        cluster.id,
                        cluster.account.tenant_id,
                        cluster.expire_time,
                        job.id
                    );
                    scheduled += 1;
                }
                Err(err) => {
                    log::warn!("cluster_expiry_failed cluster_id={} error={}", cluster.id, err);
                }
            }
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use drover_execution_runtime::QueueElement;
    use drover_kernel::{ClusterJob, ClusterTask, JobId, JobStatus, Node, ProvisionerAction};
    use serde_json::json;

    use super::*;
    use crate::catalog::ActionCatalog;

    fn sweeper(ctx: &Collaborators) -> CleanupSweeper {
        let config = SchedulerConfig::default();
        let clusters = Arc::new(ClusterScheduler::new(
            ctx.clone(),
            Arc::new(ActionCatalog::standard()),
            config.clone(),
        ));
        CleanupSweeper::new(ctx.clone(), clusters, config)
    }

    fn leased_task(ctx: &Collaborators, start: DateTime<Utc>) -> TaskId {
        let mut job = ClusterJob::new(JobId::new("c1", 1), "t1", ClusterAction::StartServices, 3, start);
        job.status = JobStatus::Running;
        let task_id = job.allocate_task_id();
        job.stages = vec![vec![task_id.clone()]];
        let mut node = Node::new("c1-n1", "c1", BTreeSet::new());
        node.record_dispatch(&task_id, ProvisionerAction::Start, None, start);
        ctx.store.insert_node(node).unwrap();
        let mut task = ClusterTask::new(task_id.clone(), "c1-n1", None, ProvisionerAction::Start, 1, start);
        task.status = TaskStatus::InProgress;
        task.worker_id = Some("consumer1".into());
        ctx.store.insert_task(task).unwrap();
        ctx.store.insert_job(job).unwrap();
        ctx.queue
            .add("t1", QueueElement::new(task_id.to_string(), json!({})), start)
            .unwrap();
        ctx.queue.take("t1", "consumer1", start).unwrap().unwrap();
        task_id
    }

    #[test]
    fn fresh_leases_are_left_alone() {
        let (ctx, _, _) = Collaborators::in_memory();
        let now = Utc::now();
        let task_id = leased_task(&ctx, now);
        let report = sweeper(&ctx).run(now + Duration::minutes(1)).unwrap();
        assert_eq!(report, CleanupReport::default());
        assert_eq!(ctx.store.require_task(&task_id).unwrap().status, TaskStatus::InProgress);
    }

    #[test]
    fn stale_lease_fails_the_task_and_its_node_action() {
        let (ctx, _, _) = Collaborators::in_memory();
        let start = Utc::now();
        let task_id = leased_task(&ctx, start);
        let report = sweeper(&ctx).run(start + Duration::minutes(11)).unwrap();
        assert_eq!(report.timed_out, 1);
        let task = ctx.store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.worker_id, None);
        let node = ctx.store.get_node("c1-n1").unwrap().unwrap();
        assert_eq!(node.current_action().map(|a| a.status), Some(TaskStatus::Failed));
        assert!(ctx.queue.get_being_consumed("t1").unwrap().is_empty());
    }

    #[test]
    fn elements_without_a_task_are_orphans() {
        let (ctx, _, _) = Collaborators::in_memory();
        let now = Utc::now();
        ctx.queue
            .add("t1", QueueElement::new("gone-001-001", json!({})), now)
            .unwrap();
        ctx.queue
            .add("t1", QueueElement::new("not a task id", json!({})), now)
            .unwrap();
        let report = sweeper(&ctx).run(now).unwrap();
        assert_eq!(report.orphaned, 2);
        assert_eq!(ctx.queue.size("t1").unwrap(), 0);
    }
}
