//! Jobs (one cluster action's execution record) and the per-node tasks they are
//! staged into.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::action::{ClusterAction, ProvisionerAction};
use crate::cluster::ClusterStatus;
use crate::identity::{ClusterId, JobId, NodeId, TaskId, TenantId, WorkerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    NotSubmitted,
    Running,
    Paused,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    NotSubmitted,
    InProgress,
    Complete,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// Execution record of one cluster action.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterJob {
    pub id: JobId,
    pub cluster_id: ClusterId,
    pub tenant_id: TenantId,
    pub action: ClusterAction,
    pub status: JobStatus,
    /// Ordered stages; every task of a stage may run concurrently.
    pub stages: Vec<Vec<TaskId>>,
    pub current_stage: usize,
    /// Services the action was planned for.
    #[serde(default)]
    pub services: BTreeSet<String>,
    /// Attempts allowed per node action chain.
    pub max_retries: u32,
    /// Set once retries are exhausted while a rollback stage still runs.
    pub failure: Option<String>,
    #[serde(default)]
    pub message: String,
    pub next_task_no: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl ClusterJob {
    pub fn new(
        id: JobId,
        tenant_id: impl Into<TenantId>,
        action: ClusterAction,
        max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            cluster_id: id.cluster_id().to_string(),
            id,
            tenant_id: tenant_id.into(),
            action,
            status: JobStatus::NotSubmitted,
            stages: Vec::new(),
            current_stage: 0,
            services: BTreeSet::new(),
            max_retries,
            failure: None,
            message: String::new(),
            next_task_no: 1,
            created_at: now,
            updated_at: now,
            version: 0,
        }
    }

    /// Jobs still driven by the job scheduler.
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn allocate_task_id(&mut self) -> TaskId {
        let id = self.id.task(self.next_task_no);
        self.next_task_no += 1;
        id
    }

    pub fn current_stage_tasks(&self) -> &[TaskId] {
        self.stages
            .get(self.current_stage)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_remaining_stages(&self) -> bool {
        self.current_stage < self.stages.len()
    }

    /// Inserts `stages` right after the current stage, keeping their order.
    pub fn insert_after_current(&mut self, stages: Vec<Vec<TaskId>>) {
        let at = (self.current_stage + 1).min(self.stages.len());
        self.stages.splice(at..at, stages.into_iter().filter(|s| !s.is_empty()));
    }

    /// Drops every stage after the current one.
    pub fn truncate_after_current(&mut self) {
        self.stages.truncate(self.current_stage + 1);
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId> {
        self.stages.iter().flatten()
    }
}

/// One unit of work for one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterTask {
    pub id: TaskId,
    pub node_id: NodeId,
    /// Empty for machine-level tasks.
    pub service: Option<String>,
    pub action: ProvisionerAction,
    pub status: TaskStatus,
    /// 1-based attempt of this node's action chain.
    pub attempt: u32,
    /// Set on DELETE tasks undoing a failed machine chain.
    #[serde(default)]
    pub rollback: bool,
    pub submit_time: Option<DateTime<Utc>>,
    pub status_time: DateTime<Utc>,
    /// Worker holding the lease for this task, recorded at take time.
    pub worker_id: Option<WorkerId>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub result: Map<String, Value>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub version: u64,
}

impl ClusterTask {
    pub fn new(
        id: TaskId,
        node_id: impl Into<NodeId>,
        service: Option<String>,
        action: ProvisionerAction,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            node_id: node_id.into(),
            service,
            action,
            status: TaskStatus::NotSubmitted,
            attempt,
            rollback: false,
            submit_time: None,
            status_time: now,
            worker_id: None,
            stdout: String::new(),
            stderr: String::new(),
            result: Map::new(),
            message: String::new(),
            version: 0,
        }
    }

    pub fn job_id(&self) -> &JobId {
        self.id.job_id()
    }

    pub fn as_rollback(mut self) -> Self {
        self.rollback = true;
        self
    }

    /// Human readable task name, e.g. `INSTALL hadoop-hdfs`.
    pub fn name(&self) -> String {
        match &self.service {
            Some(service) => format!("{} {}", self.action, service),
            None => self.action.to_string(),
        }
    }
}

/// Cluster status implied by its latest job and that job's task outcomes.
///
/// A failed create leaves the cluster TERMINATED when no forward task ever
/// completed and INCOMPLETE otherwise; completed rollbacks do not count. Any
/// other failed action leaves it INCONSISTENT.
pub fn derive_cluster_status(job: &ClusterJob, tasks: &[ClusterTask]) -> ClusterStatus {
    match job.status {
        JobStatus::NotSubmitted | JobStatus::Running | JobStatus::Paused => ClusterStatus::Pending,
        JobStatus::Complete => match job.action {
            ClusterAction::ClusterDelete => ClusterStatus::Terminated,
            _ => ClusterStatus::Active,
        },
        JobStatus::Failed => match job.action {
            ClusterAction::ClusterCreate => {
                if tasks
                    .iter()
                    .any(|t| t.status == TaskStatus::Complete && !t.rollback)
                {
                    ClusterStatus::Incomplete
                } else {
                    ClusterStatus::Terminated
                }
            }
            _ => ClusterStatus::Inconsistent,
        },
    }
}
