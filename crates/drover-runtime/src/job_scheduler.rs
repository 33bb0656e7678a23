//! Stage-by-stage job execution.
//!
//! [JobScheduler::tick] is a repeatable pass over every active job: load the
//! persisted job and its tasks, compute the next state, write it back only if
//! the job is still at the loaded version, then dispatch the current stage.
//! Concurrent ticks on other replicas lose the version race and skip the job.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::Serialize;

use drover_execution_runtime::QueueElement;
use drover_kernel::{
    derive_cluster_status, ClusterAction, ClusterJob, ClusterStatus, ClusterStore, ClusterTask,
    ErrorKind, JobId, JobStatus, KernelError, ProvisionerAction, TaskId, TaskStatus,
};

use crate::config::SchedulerConfig;
use crate::context::Collaborators;
use crate::payload::TaskPayload;

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JobTickReport {
    pub jobs: usize,
    /// Elements newly added to tenant queues.
    pub dispatched: usize,
    /// Retry and rollback tasks scheduled.
    pub retried: usize,
    pub completed: Vec<JobId>,
    pub failed: Vec<JobId>,
    /// Jobs left for the next tick (lost a version race or hit a storage error).
    pub skipped: usize,
    /// Clusters whose ended job had not been written onto them yet.
    pub settled: usize,
}

#[derive(Clone, Debug, Serialize, JsonSchema)]
pub struct TaskView {
    pub task_id: String,
    pub node_id: String,
    pub service: Option<String>,
    pub action: ProvisionerAction,
    pub status: TaskStatus,
    pub attempt: u32,
    pub rollback: bool,
    pub worker_id: Option<String>,
    pub message: String,
}

#[derive(Clone, Debug, Serialize, JsonSchema)]
pub struct StageView {
    pub index: usize,
    pub tasks: Vec<TaskView>,
}

/// A job with the status of every task, stage by stage.
#[derive(Clone, Debug, Serialize, JsonSchema)]
pub struct JobView {
    pub job_id: String,
    pub cluster_id: String,
    pub action: ClusterAction,
    pub status: JobStatus,
    pub current_stage: usize,
    pub message: String,
    /// Pending failure while a rollback stage still runs.
    pub failure: Option<String>,
    pub stages: Vec<StageView>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobView {
    fn new(job: &ClusterJob, tasks: &BTreeMap<TaskId, ClusterTask>) -> Self {
        let stages = job
            .stages
            .iter()
            .enumerate()
            .map(|(index, ids)| StageView {
                index,
                tasks: ids
                    .iter()
                    .filter_map(|id| tasks.get(id))
                    .map(|task| TaskView {
                        task_id: task.id.to_string(),
                        node_id: task.node_id.clone(),
                        service: task.service.clone(),
                        action: task.action,
                        status: task.status,
                        attempt: task.attempt,
                        rollback: task.rollback,
                        worker_id: task.worker_id.clone(),
                        message: task.message.clone(),
                    })
                    .collect(),
            })
            .collect();
        Self {
            job_id: job.id.to_string(),
            cluster_id: job.cluster_id.clone(),
            action: job.action,
            status: job.status,
            current_stage: job.current_stage,
            message: job.message.clone(),
            failure: job.failure.clone(),
            stages,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

struct Advance {
    status: JobStatus,
    dispatched: usize,
    retried: usize,
}

enum RetryDecision {
    /// Stages to insert after the failed one.
    Retry(Vec<Vec<ClusterTask>>),
    Fail(String),
}

pub struct JobScheduler {
    ctx: Collaborators,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(ctx: Collaborators, config: SchedulerConfig) -> Self {
        Self { ctx, config }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Runs the completion pass then the dispatch pass over every active job.
    pub fn tick(&self, now: DateTime<Utc>) -> Result<JobTickReport, KernelError> {
        let jobs = self.ctx.store.list_active_jobs()?;
        let mut report = JobTickReport::default();
        for job in jobs {
            report.jobs += 1;
            match self.advance(&job, now) {
                Ok(advance) => {
                    report.dispatched += advance.dispatched;
                    report.retried += advance.retried;
                    match advance.status {
                        JobStatus::Complete => report.completed.push(job.id.clone()),
                        JobStatus::Failed => report.failed.push(job.id.clone()),
                        _ => {}
                    }
                }
                Err(err) if err.kind() == ErrorKind::Conflict => {
                    log::debug!("job_tick_skipped job_id={} reason={}", job.id, err);
                    report.skipped += 1;
                }
                Err(err) => {
                    log::warn!("job_tick_failed job_id={} error={}", job.id, err);
                    report.skipped += 1;
                }
            }
        }
        report.settled = self.settle_stranded()?;
        Ok(report)
    }

    /// Settles PENDING clusters whose latest job already ended, e.g. after an
    /// abort whose cluster write failed.
    fn settle_stranded(&self) -> Result<usize, KernelError> {
        let mut settled = 0;
        for cluster in self.ctx.store.list_clusters(None)? {
            if cluster.status != ClusterStatus::Pending {
                continue;
            }
            let Some(job_id) = cluster.latest_job_id.as_ref() else {
                continue;
            };
            let Some(job) = self.ctx.store.get_job(job_id)? else {
                continue;
            };
            if !job.status.is_terminal() {
                continue;
            }
            match settle_cluster(&self.ctx, &job) {
                Ok(()) => settled += 1,
                Err(err) => log::warn!(
                    "cluster_settle_failed cluster_id={} job_id={} error={}",
                    cluster.id,
                    job.id,
                    err
                ),
            }
        }
        Ok(settled)
    }

    fn advance(&self, snapshot: &ClusterJob, now: DateTime<Utc>) -> Result<Advance, KernelError> {
        let store = &self.ctx.store;
        let cluster = store.require_cluster(&snapshot.cluster_id)?;
        if let Some(latest) = cluster.latest_job_id.as_ref().filter(|id| **id != snapshot.id) {
            supersede_job(&self.ctx, &snapshot.id, latest, now)?;
            return Ok(Advance {
                status: JobStatus::Failed,
                dispatched: 0,
                retried: 0,
            });
        }

        let mut tasks: BTreeMap<TaskId, ClusterTask> = store
            .list_tasks(&snapshot.id)?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();

        let mut job = snapshot.clone();
        if job.status == JobStatus::NotSubmitted {
            job.status = JobStatus::Running;
        }
        let new_tasks = complete_stages(&mut job, &tasks, now);
        let retried = new_tasks.len();

        if job != *snapshot {
            job.updated_at = now;
            for task in &new_tasks {
                insert_scheduled_task(&**store, task)?;
            }
            // cluster first: a failed cluster write leaves the job active for the next tick
            if job.status.is_terminal() {
                settle_cluster(&self.ctx, &job)?;
            }
            let expected = snapshot.version;
            let next = job.clone();
            job = store.update_job(&snapshot.id, &mut |current| {
                if current.version != expected {
                    return Err(KernelError::Conflict(format!(
                        "job '{}' changed since it was loaded",
                        current.id
                    )));
                }
                let version = current.version;
                *current = next.clone();
                current.version = version;
                Ok(())
            })?;
            if job.status != snapshot.status {
                log::info!(
                    "job_status job_id={} from={:?} to={:?} stage={}",
                    job.id,
                    snapshot.status,
                    job.status,
                    job.current_stage
                );
            }
        }
        tasks.extend(new_tasks.into_iter().map(|task| (task.id.clone(), task)));

        let dispatched = if job.status == JobStatus::Running {
            self.dispatch(&job, &tasks, now)?
        } else {
            0
        };
        Ok(Advance {
            status: job.status,
            dispatched,
            retried,
        })
    }

    /// Adds every unsubmitted task of the current stage to the tenant queue.
    fn dispatch(
        &self,
        job: &ClusterJob,
        tasks: &BTreeMap<TaskId, ClusterTask>,
        now: DateTime<Utc>,
    ) -> Result<usize, KernelError> {
        let pending: Vec<&ClusterTask> = job
            .current_stage_tasks()
            .iter()
            .filter_map(|id| tasks.get(id))
            .filter(|task| task.status == TaskStatus::NotSubmitted)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let cluster = self.ctx.store.require_cluster(&job.cluster_id)?;
        let nodes = self.ctx.store.list_nodes(&job.cluster_id)?;
        let provider = self.ctx.entities.provider(&cluster.provider)?;
        let mut added = 0;
        for task in &pending {
            let service = match &task.service {
                Some(name) => Some(
                    self.ctx
                        .entities
                        .service(name)?
                        .ok_or_else(|| KernelError::not_found("service", name))?,
                ),
                None => None,
            };
            let payload =
                TaskPayload::build(task, &cluster, &nodes, service.as_ref(), provider.as_ref());
            let payload = serde_json::to_value(&payload)
                .map_err(|e| KernelError::Queue(format!("serialize task payload: {}", e)))?;
            let element = QueueElement::new(task.id.to_string(), payload);
            if self.ctx.queue.add(&job.tenant_id, element, now)? {
                added += 1;
            }
        }
        if added > 0 {
            log::info!(
                "job_dispatch job_id={} stage={} tasks={} added={}",
                job.id,
                job.current_stage,
                pending.len(),
                added
            );
        }
        Ok(added)
    }

    /// RUNNING -> PAUSED. The dispatch pass skips paused jobs.
    pub fn pause(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<ClusterJob, KernelError> {
        let job = self.ctx.store.update_job(job_id, &mut |job| {
            if job.status != JobStatus::Running {
                return Err(KernelError::Conflict(format!(
                    "job '{}' is {:?}, only running jobs can be paused",
                    job.id, job.status
                )));
            }
            job.status = JobStatus::Paused;
            job.updated_at = now;
            Ok(())
        })?;
        log::info!("job_paused job_id={} stage={}", job.id, job.current_stage);
        Ok(job)
    }

    /// PAUSED -> RUNNING, dispatching again from the same stage.
    pub fn resume(&self, job_id: &JobId, now: DateTime<Utc>) -> Result<ClusterJob, KernelError> {
        let job = self.ctx.store.update_job(job_id, &mut |job| {
            if job.status != JobStatus::Paused {
                return Err(KernelError::Conflict(format!(
                    "job '{}' is {:?}, only paused jobs can be resumed",
                    job.id, job.status
                )));
            }
            job.status = JobStatus::Running;
            job.updated_at = now;
            Ok(())
        })?;
        log::info!("job_resumed job_id={} stage={}", job.id, job.current_stage);
        Ok(job)
    }

    /// Fails a dispatched job. Queued elements are recalled; leased tasks run
    /// to completion but no longer drive the job.
    pub fn abort(
        &self,
        job_id: &JobId,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<ClusterJob, KernelError> {
        let job = self.ctx.store.require_job(job_id)?;
        if job.status == JobStatus::NotSubmitted {
            return Err(KernelError::Conflict(format!(
                "job '{}' has not been dispatched yet",
                job.id
            )));
        }
        if job.status.is_terminal() {
            return Err(KernelError::Conflict(format!(
                "job '{}' is already {:?}",
                job.id, job.status
            )));
        }
        fail_job(&self.ctx, job_id, reason, true, now)
    }

    pub fn job_status(&self, job_id: &JobId) -> Result<JobView, KernelError> {
        let job = self.ctx.store.require_job(job_id)?;
        let tasks: BTreeMap<TaskId, ClusterTask> = self
            .ctx
            .store
            .list_tasks(job_id)?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();
        Ok(JobView::new(&job, &tasks))
    }
}

/// Completion pass: advances past resolved stages and applies the retry policy.
/// Returns the retry and rollback tasks it scheduled.
fn complete_stages(
    job: &mut ClusterJob,
    tasks: &BTreeMap<TaskId, ClusterTask>,
    now: DateTime<Utc>,
) -> Vec<ClusterTask> {
    let mut scheduled = Vec::new();
    loop {
        if !job.has_remaining_stages() {
            match job.failure.clone() {
                Some(failure) => {
                    job.status = JobStatus::Failed;
                    job.message = failure;
                }
                None => job.status = JobStatus::Complete,
            }
            break;
        }

        let mut stage = Vec::with_capacity(job.current_stage_tasks().len());
        let mut missing = None;
        for id in job.current_stage_tasks() {
            match tasks.get(id) {
                Some(task) => stage.push(task),
                None => {
                    missing = Some(id.clone());
                    break;
                }
            }
        }
        if let Some(id) = missing {
            job.status = JobStatus::Failed;
            job.message = format!("task '{}' of stage {} is missing", id, job.current_stage);
            break;
        }
        if stage.iter().any(|task| !task.status.is_terminal()) {
            break;
        }

        let failed: Vec<ClusterTask> = stage
            .iter()
            .filter(|task| task.status == TaskStatus::Failed)
            .map(|task| (*task).clone())
            .collect();
        if failed.is_empty() {
            job.current_stage += 1;
            continue;
        }

        match plan_retries(job, &failed, tasks, now) {
            RetryDecision::Retry(stages) => {
                let ids = stages
                    .iter()
                    .map(|stage| stage.iter().map(|task| task.id.clone()).collect())
                    .collect();
                job.insert_after_current(ids);
                job.current_stage += 1;
                scheduled.extend(stages.into_iter().flatten());
                // the inserted stage has not been dispatched yet
                break;
            }
            RetryDecision::Fail(message) => {
                job.status = JobStatus::Failed;
                job.message = message;
                break;
            }
        }
    }
    scheduled
}

/// Retry policy for one resolved stage with failures.
///
/// A failed CREATE or CONFIRM of a cluster create is rolled back with a DELETE
/// and re-run from CREATE while the node's chain has attempts left; once
/// exhausted only the DELETE runs and the job fails after it. Any other failed
/// action re-runs as a new task. A failed rollback fails the job outright.
fn plan_retries(
    job: &mut ClusterJob,
    failed: &[ClusterTask],
    tasks: &BTreeMap<TaskId, ClusterTask>,
    now: DateTime<Utc>,
) -> RetryDecision {
    if let Some(task) = failed.iter().find(|task| task.rollback) {
        return RetryDecision::Fail(format!(
            "rollback task '{}' ({}) on node {} failed",
            task.id,
            task.name(),
            task.node_id
        ));
    }

    let (chain, others): (Vec<&ClusterTask>, Vec<&ClusterTask>) = failed.iter().partition(|task| {
        job.action == ClusterAction::ClusterCreate && task.action.is_rollback_chain()
    });
    if let Some(task) = others.iter().find(|task| task.attempt >= job.max_retries) {
        return RetryDecision::Fail(format!(
            "task '{}' ({}) on node {} failed after {} attempts",
            task.id,
            task.name(),
            task.node_id,
            task.attempt
        ));
    }

    let chain: Vec<(&ClusterTask, u32)> = chain
        .into_iter()
        .map(|task| (task, chain_attempt(tasks, task)))
        .collect();
    let exhausted = chain
        .iter()
        .find(|(_, attempt)| *attempt >= job.max_retries)
        .map(|(task, attempt)| (*task, *attempt));
    let mut stages: Vec<Vec<ClusterTask>> = Vec::new();
    for (task, attempt) in &chain {
        let delete = ClusterTask::new(
            job.allocate_task_id(),
            &task.node_id,
            None,
            ProvisionerAction::Delete,
            *attempt,
            now,
        )
        .as_rollback();
        push_at(&mut stages, 0, delete);
        if exhausted.is_some() {
            continue;
        }
        let upto = ProvisionerAction::MACHINE_CHAIN
            .iter()
            .position(|action| *action == task.action)
            .unwrap_or(0);
        for (offset, action) in ProvisionerAction::MACHINE_CHAIN[..=upto].iter().enumerate() {
            let retry = ClusterTask::new(
                job.allocate_task_id(),
                &task.node_id,
                None,
                *action,
                attempt + 1,
                now,
            );
            push_at(&mut stages, offset + 1, retry);
        }
    }

    if let Some((task, attempt)) = exhausted {
        job.truncate_after_current();
        job.failure = Some(format!(
            "{} on node {} failed after {} attempts",
            task.action, task.node_id, attempt
        ));
        log::warn!(
            "job_retries_exhausted job_id={} node_id={} action={} attempts={}",
            job.id,
            task.node_id,
            task.action,
            attempt
        );
        return RetryDecision::Retry(stages);
    }

    for task in others {
        let retry = ClusterTask::new(
            job.allocate_task_id(),
            &task.node_id,
            task.service.clone(),
            task.action,
            task.attempt + 1,
            now,
        );
        push_at(&mut stages, 0, retry);
    }
    log::info!(
        "job_retry job_id={} stage={} failed={} retry_tasks={}",
        job.id,
        job.current_stage,
        failed.len(),
        stages.iter().map(Vec::len).sum::<usize>()
    );
    RetryDecision::Retry(stages)
}

/// Inserts a retry or rollback task. A NOT_SUBMITTED task already under the
/// same id is left over from a tick whose job write failed; nothing references
/// it, so it is replaced.
fn insert_scheduled_task(store: &dyn ClusterStore, task: &ClusterTask) -> Result<(), KernelError> {
    match store.insert_task(task.clone()) {
        Err(err) if err.kind() == ErrorKind::Conflict => {
            store.update_task(&task.id, &mut |current| {
                if current.status != TaskStatus::NotSubmitted {
                    return Err(KernelError::Conflict(format!(
                        "task '{}' is already {:?}",
                        current.id, current.status
                    )));
                }
                let version = current.version;
                *current = task.clone();
                current.version = version;
                Ok(())
            })?;
            log::debug!("task_reinserted task_id={}", task.id);
            Ok(())
        }
        other => other,
    }
}

/// Highest attempt among the forward CREATE/CONFIRM tasks of `failed`'s node.
/// A retried CREATE reuses the original CONFIRM, so the failed task's own
/// attempt can lag behind the chain.
fn chain_attempt(tasks: &BTreeMap<TaskId, ClusterTask>, failed: &ClusterTask) -> u32 {
    tasks
        .values()
        .filter(|task| {
            task.node_id == failed.node_id && !task.rollback && task.action.is_rollback_chain()
        })
        .map(|task| task.attempt)
        .fold(failed.attempt, u32::max)
}

fn push_at(stages: &mut Vec<Vec<ClusterTask>>, index: usize, task: ClusterTask) {
    while stages.len() <= index {
        stages.push(Vec::new());
    }
    stages[index].push(task);
}

/// Writes the status implied by a terminal `job` onto its cluster, unless a
/// newer job has taken the cluster over. A completed ADD_SERVICES also records
/// the new services on the cluster and its nodes.
pub(crate) fn settle_cluster(ctx: &Collaborators, job: &ClusterJob) -> Result<(), KernelError> {
    let tasks = ctx.store.list_tasks(&job.id)?;
    let status = derive_cluster_status(job, &tasks);
    let added_services =
        job.status == JobStatus::Complete && job.action == ClusterAction::AddServices;

    let cluster = ctx.store.require_cluster(&job.cluster_id)?;
    if cluster.latest_job_id.as_ref() != Some(&job.id) {
        return Ok(());
    }
    if added_services {
        for node_id in &cluster.nodes {
            ctx.store.update_node(node_id, &mut |node| {
                node.services.extend(job.services.iter().cloned());
                Ok(())
            })?;
        }
    }
    let result = ctx.store.update_cluster(&job.cluster_id, &mut |cluster| {
        if cluster.latest_job_id.as_ref() != Some(&job.id) {
            return Err(KernelError::Conflict(format!(
                "cluster '{}' moved on to another job",
                cluster.id
            )));
        }
        cluster.status = status;
        cluster.message = job.message.clone();
        if added_services {
            cluster.services.extend(job.services.iter().cloned());
        }
        Ok(())
    });
    match result {
        Ok(cluster) => {
            log::info!(
                "cluster_status cluster_id={} job_id={} status={:?}",
                cluster.id,
                job.id,
                cluster.status
            );
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::Conflict => Ok(()),
        Err(err) => Err(err),
    }
}

/// Fails `job_id` because `latest` replaced it as the cluster's job. The
/// cluster status is left to `latest`.
pub(crate) fn supersede_job(
    ctx: &Collaborators,
    job_id: &JobId,
    latest: &JobId,
    now: DateTime<Utc>,
) -> Result<(), KernelError> {
    let reason = format!("superseded by job {}", latest);
    match fail_job(ctx, job_id, &reason, false, now) {
        Ok(_) => Ok(()),
        // finished in the meantime
        Err(err) if err.kind() == ErrorKind::Conflict => Ok(()),
        Err(err) => Err(err),
    }
}

/// Fails an active job, recalling its queued elements and marking their tasks
/// FAILED with `reason`. `settle` also updates the cluster status.
pub(crate) fn fail_job(
    ctx: &Collaborators,
    job_id: &JobId,
    reason: &str,
    settle: bool,
    now: DateTime<Utc>,
) -> Result<ClusterJob, KernelError> {
    let job = ctx.store.update_job(job_id, &mut |job| {
        if !job.is_active() {
            return Err(KernelError::Conflict(format!(
                "job '{}' is already {:?}",
                job.id, job.status
            )));
        }
        job.status = JobStatus::Failed;
        job.message = reason.to_string();
        job.updated_at = now;
        Ok(())
    })?;

    let mut recalled = 0;
    for element in ctx.queue.get_queued(&job.tenant_id)? {
        let Ok(task_id) = element.id.parse::<TaskId>() else {
            continue;
        };
        if task_id.job_id() != &job.id || !ctx.queue.remove(&job.tenant_id, &element.id)? {
            continue;
        }
        let marked = ctx.store.update_task(&task_id, &mut |task| {
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
        });
        match marked {
            Ok(_) => recalled += 1,
            Err(err) if matches!(err.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {}
            Err(err) => return Err(err),
        }
    }

    log::info!(
        "job_failed job_id={} recalled={} reason={}",
        job.id,
        recalled,
        reason
    );
    if settle {
        settle_cluster(ctx, &job)?;
    }
    Ok(job)
}
