//! Identity types for clusters, jobs, tasks and the actors that touch them.
//!
//! Plain identifiers are string aliases. Job and task ids are structured so that
//! tasks order totally within their job and jobs order within their cluster.

use std::fmt;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Identifies a cluster.
pub type ClusterId = String;

/// Identifies a node (one machine of a cluster).
pub type NodeId = String;

/// Identifies a tenant; every queue is scoped to one.
pub type TenantId = String;

/// Identifies a user within a tenant.
pub type UserId = String;

/// Identifies a remote worker process holding leases.
pub type WorkerId = String;

/// Identifies a registered provisioner (a pool of workers).
pub type ProvisionerId = String;

/// One job of a cluster: `(cluster_id, seq)`, rendered `"{cluster_id}-{seq:03}"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
#[schemars(with = "String")]
pub struct JobId {
    cluster_id: ClusterId,
    seq: u64,
}

impl JobId {
    pub fn new(cluster_id: impl Into<ClusterId>, seq: u64) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            seq,
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// Id of the job planned after this one on the same cluster.
    pub fn next(&self) -> Self {
        Self::new(self.cluster_id.clone(), self.seq + 1)
    }

    /// Id of the `task_no`-th task of this job.
    pub fn task(&self, task_no: u64) -> TaskId {
        TaskId {
            job_id: self.clone(),
            task_no,
        }
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.cluster_id, self.seq)
    }
}

impl FromStr for JobId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (cluster_id, seq) = split_trailing_number(s)
            .ok_or_else(|| KernelError::Validation(format!("malformed job id '{}'", s)))?;
        Ok(Self::new(cluster_id, seq))
    }
}

impl TryFrom<String> for JobId {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(value: JobId) -> Self {
        value.to_string()
    }
}

/// One task of a job: `(job_id, task_no)`, rendered `"{job_id}-{task_no:03}"`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(try_from = "String", into = "String")]
#[schemars(with = "String")]
pub struct TaskId {
    job_id: JobId,
    task_no: u64,
}

impl TaskId {
    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn task_no(&self) -> u64 {
        self.task_no
    }

    pub fn cluster_id(&self) -> &str {
        self.job_id.cluster_id()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:03}", self.job_id, self.task_no)
    }
}

impl FromStr for TaskId {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || KernelError::Validation(format!("malformed task id '{}'", s));
        let (job, task_no) = split_trailing_number(s).ok_or_else(malformed)?;
        let job_id = job.parse::<JobId>().map_err(|_| malformed())?;
        Ok(job_id.task(task_no))
    }
}

impl TryFrom<String> for TaskId {
    type Error = KernelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TaskId> for String {
    fn from(value: TaskId) -> Self {
        value.to_string()
    }
}

fn split_trailing_number(s: &str) -> Option<(&str, u64)> {
    let (head, tail) = s.rsplit_once('-')?;
    if head.is_empty() || tail.is_empty() || !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((head, tail.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_and_task_ids_render_and_parse() {
        let job = JobId::new("cluster-7", 2);
        let task = job.task(14);
        assert_eq!(job.to_string(), "cluster-7-002");
        assert_eq!(task.to_string(), "cluster-7-002-014");

        let parsed: TaskId = "cluster-7-002-014".parse().unwrap();
        assert_eq!(parsed, task);
        assert_eq!(parsed.cluster_id(), "cluster-7");
        assert_eq!(parsed.job_id().seq(), 2);
    }

    #[test]
    fn task_ids_order_by_number_within_a_job() {
        let job = JobId::new("c1", 1);
        let mut ids = vec![job.task(10), job.task(2), job.task(1)];
        ids.sort();
        let numbers: Vec<u64> = ids.iter().map(TaskId::task_no).collect();
        assert_eq!(numbers, vec![1, 2, 10]);
    }

    #[test]
    fn malformed_ids_are_rejected() {
        assert!("no-number-here".parse::<JobId>().is_err());
        assert!("-001".parse::<JobId>().is_err());
        assert!("c1-001".parse::<TaskId>().is_err());
    }

    #[test]
    fn ids_serialize_as_strings() {
        let task = JobId::new("c9", 1).task(3);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json, serde_json::json!("c9-001-003"));
        let back: TaskId = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }
}
