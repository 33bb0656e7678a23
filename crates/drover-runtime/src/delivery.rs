//! Take/finish protocol used by remote workers.
//!
//! The lease holder is recorded on the task at take time; `finish` is accepted
//! only from that holder, which is what lets a worker tell a dead lease from an
//! ordinary failure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use drover_execution_runtime::{ElementOutcome, LeasedElement, QueueMetrics};
use drover_kernel::{ClusterTask, ErrorKind, JobStatus, KernelError, TaskId, TaskStatus};

use crate::context::Collaborators;
use crate::payload::TaskPayload;

/// Outcome reported by a worker.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TaskResult {
    /// `0` means success.
    pub status: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub ip_addresses: BTreeMap<String, String>,
}

impl TaskResult {
    pub fn succeeded() -> Self {
        Self::default()
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == 0
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, JsonSchema)]
pub struct FinishReport {
    pub task_id: String,
    pub status: TaskStatus,
    /// False when the job stopped running before the task finished; the outcome
    /// is recorded but no longer drives the job.
    pub job_active: bool,
}

pub struct TaskDelivery {
    ctx: Collaborators,
}

impl TaskDelivery {
    pub fn new(ctx: Collaborators) -> Self {
        Self { ctx }
    }

    fn require_provisioner(&self, provisioner_id: &str) -> Result<(), KernelError> {
        if self.ctx.provisioners.is_registered(provisioner_id)? {
            Ok(())
        } else {
            Err(KernelError::Forbidden(format!(
                "provisioner '{}' is not registered",
                provisioner_id
            )))
        }
    }

    /// Leases the next runnable task of `tenant_id` to `worker_id`.
    ///
    /// Elements that no longer describe runnable work (unknown task, job not
    /// running, task already taken) are dropped while searching.
    pub fn take_next(
        &self,
        worker_id: &str,
        provisioner_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskPayload>, KernelError> {
        self.require_provisioner(provisioner_id)?;
        while let Some(leased) = self.ctx.queue.take(tenant_id, worker_id, now)? {
            match self.claim(&leased, worker_id, tenant_id, now)? {
                Ok(payload) => {
                    log::info!(
                        "task_taken task_id={} tenant_id={} worker_id={} provisioner_id={}",
                        payload.task_id,
                        tenant_id,
                        worker_id,
                        provisioner_id
                    );
                    return Ok(Some(payload));
                }
                Err(reason) => {
                    log::debug!(
                        "queue_element_dropped element_id={} tenant_id={} reason={}",
                        leased.element.id,
                        tenant_id,
                        reason
                    );
                    self.ctx.queue.record_progress(
                        worker_id,
                        tenant_id,
                        &leased.element.id,
                        ElementOutcome::Dropped,
                        &reason,
                    )?;
                }
            }
        }
        Ok(None)
    }

    /// Marks the leased task IN_PROGRESS under `worker_id`. The inner error is
    /// the reason the element should be dropped instead.
    fn claim(
        &self,
        leased: &LeasedElement,
        worker_id: &str,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Result<TaskPayload, String>, KernelError> {
        let store = &self.ctx.store;
        let Ok(task_id) = leased.element.id.parse::<TaskId>() else {
            return Ok(Err("malformed task id".into()));
        };
        let Some(task) = store.get_task(&task_id)? else {
            return Ok(Err("task no longer exists".into()));
        };
        let Some(job) = store.get_job(task.job_id())? else {
            return Ok(Err("job no longer exists".into()));
        };
        if job.tenant_id != tenant_id {
            return Ok(Err(format!("task belongs to tenant '{}'", job.tenant_id)));
        }
        if job.status != JobStatus::Running {
            return Ok(Err(format!("job is {:?}", job.status)));
        }
        if task.status != TaskStatus::NotSubmitted {
            return Ok(Err(format!("task is {:?}", task.status)));
        }

        let payload = match serde_json::from_value::<TaskPayload>(leased.element.payload.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = format!("unreadable task payload: {}", e);
                log::warn!("task_payload_invalid task_id={} error={}", task_id, e);
                match mark_failed(&self.ctx, &task_id, &reason, now) {
                    Ok(_) => {}
                    Err(err) if is_stale(&err) => {}
                    Err(err) => return Err(err),
                }
                return Ok(Err(reason));
            }
        };

        let claimed = store.update_task(&task_id, &mut |task| {
            if task.status != TaskStatus::NotSubmitted {
                return Err(KernelError::Conflict(format!(
                    "task '{}' is already {:?}",
                    task.id, task.status
                )));
            }
            task.status = TaskStatus::InProgress;
            task.worker_id = Some(worker_id.to_string());
            task.submit_time = Some(now);
            task.status_time = now;
            Ok(())
        });
        let task = match claimed {
            Ok(task) => task,
            Err(err) if is_stale(&err) => return Ok(Err(err.to_string())),
            Err(err) => return Err(err),
        };

        let recorded = store.update_node(&task.node_id, &mut |node| {
            node.record_dispatch(&task.id, task.action, task.service.clone(), now);
            Ok(())
        });
        if let Err(err) = recorded {
            log::warn!(
                "node_history_skipped node_id={} task_id={} error={}",
                task.node_id,
                task.id,
                err
            );
        }
        Ok(Ok(payload))
    }

    /// Records the outcome of `task_id` reported by its lease holder.
    pub fn finish(
        &self,
        worker_id: &str,
        provisioner_id: &str,
        tenant_id: &str,
        task_id: &str,
        outcome: TaskResult,
        now: DateTime<Utc>,
    ) -> Result<FinishReport, KernelError> {
        self.require_provisioner(provisioner_id)?;
        let task_id: TaskId = task_id.parse()?;
        let task = self.ctx.store.require_task(&task_id)?;
        let job = self.ctx.store.require_job(task.job_id())?;
        if job.tenant_id != tenant_id {
            return Err(KernelError::not_found("task", &task_id));
        }

        let status = if outcome.is_success() {
            TaskStatus::Complete
        } else {
            TaskStatus::Failed
        };
        let message = if outcome.is_success() {
            String::new()
        } else {
            format!("task exited with status {}", outcome.status)
        };
        let task = self.ctx.store.update_task(&task_id, &mut |task| {
            if task.status != TaskStatus::InProgress
                || task.worker_id.as_deref() != Some(worker_id)
            {
                return Err(KernelError::LeaseMismatch(format!(
                    "task '{}' is not leased to worker '{}'",
                    task.id, worker_id
                )));
            }
            task.status = status;
            task.status_time = now;
            task.stdout = outcome.stdout.clone();
            task.stderr = outcome.stderr.clone();
            task.result = outcome.result.clone();
            task.message = message.clone();
            Ok(())
        })?;

        self.update_node(&task, &outcome, &message, now);

        let element_outcome = if outcome.is_success() {
            ElementOutcome::Acked
        } else {
            ElementOutcome::Dropped
        };
        let resolved = self.ctx.queue.record_progress(
            worker_id,
            tenant_id,
            &task_id.to_string(),
            element_outcome,
            &message,
        )?;
        if !resolved {
            log::warn!(
                "lease_already_resolved task_id={} tenant_id={} worker_id={}",
                task_id,
                tenant_id,
                worker_id
            );
        }

        log::info!(
            "task_finished task_id={} tenant_id={} worker_id={} status={:?}",
            task.id,
            tenant_id,
            worker_id,
            status
        );
        Ok(FinishReport {
            task_id: task.id.to_string(),
            status,
            job_active: job.status == JobStatus::Running || job.status == JobStatus::Paused,
        })
    }

    fn update_node(&self, task: &ClusterTask, outcome: &TaskResult, message: &str, now: DateTime<Utc>) {
        let updated = self.ctx.store.update_node(&task.node_id, &mut |node| {
            if outcome.is_success() {
                node.properties
                    .merge_result(&outcome.result, &outcome.ip_addresses);
            }
            node.update_action(&task.id, task.status, now, message);
            Ok(())
        });
        if let Err(err) = updated {
            log::warn!(
                "node_update_skipped node_id={} task_id={} error={}",
                task.node_id,
                task.id,
                err
            );
        }
    }

    pub fn queue_metrics(&self, tenant_id: &str) -> Result<QueueMetrics, KernelError> {
        self.ctx.queue.metrics(tenant_id)
    }

    /// Metrics of every tenant that currently holds queue elements.
    pub fn all_queue_metrics(&self) -> Result<Vec<QueueMetrics>, KernelError> {
        self.ctx
            .queue
            .tenants()?
            .iter()
            .map(|tenant| self.ctx.queue.metrics(tenant))
            .collect()
    }
}

fn is_stale(err: &KernelError) -> bool {
    matches!(err.kind(), ErrorKind::Conflict | ErrorKind::NotFound)
}

/// NOT_SUBMITTED -> FAILED for a task that can never be delivered.
fn mark_failed(
    ctx: &Collaborators,
    task_id: &TaskId,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<ClusterTask, KernelError> {
    ctx.store.update_task(task_id, &mut |task| {
        if task.status != TaskStatus::NotSubmitted {
            return Err(KernelError::Conflict(format!(
                "task '{}' is already {:?}",
                task.id, task.status
            )));
        }
        task.status = TaskStatus::Failed;
        task.status_time = now;
        task.message = reason.to_string();
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use drover_execution_runtime::QueueElement;
    use drover_kernel::{ClusterAction, ClusterJob, JobId, Node, ProvisionerAction};
    use serde_json::json;

    use super::*;

    fn seeded() -> (TaskDelivery, Collaborators, TaskId) {
        let (ctx, _, provisioners) = Collaborators::in_memory();
        provisioners.register("p1").unwrap();
        let now = Utc::now();
        let mut job = ClusterJob::new(JobId::new("c1", 1), "t1", ClusterAction::StartServices, 3, now);
        job.status = JobStatus::Running;
        let task_id = job.allocate_task_id();
        job.stages = vec![vec![task_id.clone()]];
        ctx.store
            .insert_node(Node::new("c1-n1", "c1", BTreeSet::new()))
            .unwrap();
        ctx.store
            .insert_task(ClusterTask::new(
                task_id.clone(),
                "c1-n1",
                Some("web".into()),
                ProvisionerAction::Start,
                1,
                now,
            ))
            .unwrap();
        ctx.store.insert_job(job).unwrap();
        let payload = json!({
            "taskId": task_id.to_string(),
            "jobId": "c1-001",
            "clusterId": "c1",
            "taskName": "START web",
            "nodeId": "c1-n1",
            "config": {},
        });
        ctx.queue
            .add("t1", QueueElement::new(task_id.to_string(), payload), now)
            .unwrap();
        (TaskDelivery::new(ctx.clone()), ctx, task_id)
    }

    #[test]
    fn unregistered_provisioner_is_forbidden() {
        let (delivery, _, _) = seeded();
        let err = delivery.take_next("w1", "p9", "t1", Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn take_records_the_lease_holder_and_node_history() {
        let (delivery, ctx, task_id) = seeded();
        let payload = delivery.take_next("w1", "p1", "t1", Utc::now()).unwrap().unwrap();
        assert_eq!(payload.task_id, task_id.to_string());
        let task = ctx.store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.worker_id.as_deref(), Some("w1"));
        let node = ctx.store.get_node("c1-n1").unwrap().unwrap();
        assert_eq!(node.actions.len(), 1);
        assert!(delivery.take_next("w2", "p1", "t1", Utc::now()).unwrap().is_none());
    }

    #[test]
    fn finish_by_another_worker_is_a_lease_mismatch() {
        let (delivery, ctx, task_id) = seeded();
        delivery.take_next("w1", "p1", "t1", Utc::now()).unwrap();
        let err = delivery
            .finish("w2", "p1", "t1", &task_id.to_string(), TaskResult::succeeded(), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LeaseMismatch);
        assert_eq!(ctx.queue.size("t1").unwrap(), 1);
    }

    #[test]
    fn successful_finish_merges_node_properties_and_acks() {
        let (delivery, ctx, task_id) = seeded();
        delivery.take_next("w1", "p1", "t1", Utc::now()).unwrap();
        let mut outcome = TaskResult::succeeded();
        outcome.result.insert("hostname".into(), json!("web-1.local"));
        outcome.ip_addresses.insert("access".into(), "10.0.0.5".into());
        let report = delivery
            .finish("w1", "p1", "t1", &task_id.to_string(), outcome, Utc::now())
            .unwrap();
        assert_eq!(report.status, TaskStatus::Complete);
        assert!(report.job_active);
        let node = ctx.store.get_node("c1-n1").unwrap().unwrap();
        assert_eq!(node.properties.hostname.as_deref(), Some("web-1.local"));
        assert_eq!(node.current_action().map(|a| a.status), Some(TaskStatus::Complete));
        assert_eq!(ctx.queue.size("t1").unwrap(), 0);
    }

    #[test]
    fn failed_finish_keeps_diagnostics() {
        let (delivery, ctx, task_id) = seeded();
        delivery.take_next("w1", "p1", "t1", Utc::now()).unwrap();
        delivery
            .finish("w1", "p1", "t1", &task_id.to_string(), TaskResult::failed(2, "boom"), Utc::now())
            .unwrap();
        let task = ctx.store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.stderr, "boom");
        assert_eq!(ctx.queue.size("t1").unwrap(), 0);
    }

    #[test]
    fn elements_of_paused_jobs_are_dropped_on_take() {
        let (delivery, ctx, task_id) = seeded();
        ctx.store
            .update_job(task_id.job_id(), &mut |job| {
                job.status = JobStatus::Paused;
                Ok(())
            })
            .unwrap();
        assert!(delivery.take_next("w1", "p1", "t1", Utc::now()).unwrap().is_none());
        assert_eq!(ctx.queue.size("t1").unwrap(), 0);
        let task = ctx.store.require_task(&task_id).unwrap();
        assert_eq!(task.status, TaskStatus::NotSubmitted);
    }
}
