//! Cluster, node, job and task repository.
//!
//! Every write goes through the store: `insert_*` fails with a conflict when the id
//! is taken, and `update_*` applies a closure to the current record under the
//! record's lock, bumping its version. A closure error leaves the record untouched.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::cluster::{Cluster, Node};
use crate::error::KernelError;
use crate::identity::{ClusterId, JobId, NodeId, TaskId};
use crate::job::{ClusterJob, ClusterTask};

pub type Mutation<'a, T> = &'a mut dyn FnMut(&mut T) -> Result<(), KernelError>;

/// Repository contract consumed by the schedulers and the delivery service.
pub trait ClusterStore: Send + Sync {
    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, KernelError>;
    fn insert_cluster(&self, cluster: Cluster) -> Result<(), KernelError>;
    fn update_cluster(&self, id: &str, f: Mutation<'_, Cluster>) -> Result<Cluster, KernelError>;
    /// Clusters of `tenant_id`, or of every tenant when `None`.
    fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>, KernelError>;
    /// Up to `limit` PENDING/ACTIVE/INCOMPLETE clusters whose expire time is at or
    /// before `now`, oldest expiry first.
    fn list_expired_clusters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Cluster>, KernelError>;

    fn get_node(&self, id: &str) -> Result<Option<Node>, KernelError>;
    fn insert_node(&self, node: Node) -> Result<(), KernelError>;
    fn update_node(&self, id: &str, f: Mutation<'_, Node>) -> Result<Node, KernelError>;
    fn list_nodes(&self, cluster_id: &str) -> Result<Vec<Node>, KernelError>;

    fn get_job(&self, id: &JobId) -> Result<Option<ClusterJob>, KernelError>;
    fn insert_job(&self, job: ClusterJob) -> Result<(), KernelError>;
    fn update_job(&self, id: &JobId, f: Mutation<'_, ClusterJob>) -> Result<ClusterJob, KernelError>;
    /// Jobs that are neither COMPLETE nor FAILED, in id order.
    fn list_active_jobs(&self) -> Result<Vec<ClusterJob>, KernelError>;
    /// Removes a job and its tasks.
    fn delete_job(&self, id: &JobId) -> Result<(), KernelError>;

    fn get_task(&self, id: &TaskId) -> Result<Option<ClusterTask>, KernelError>;
    fn insert_task(&self, task: ClusterTask) -> Result<(), KernelError>;
    fn update_task(&self, id: &TaskId, f: Mutation<'_, ClusterTask>) -> Result<ClusterTask, KernelError>;
    /// Tasks of a job in task id order.
    fn list_tasks(&self, job_id: &JobId) -> Result<Vec<ClusterTask>, KernelError>;

    fn require_cluster(&self, id: &str) -> Result<Cluster, KernelError> {
        self.get_cluster(id)?
            .ok_or_else(|| KernelError::not_found("cluster", id))
    }

    fn require_job(&self, id: &JobId) -> Result<ClusterJob, KernelError> {
        self.get_job(id)?
            .ok_or_else(|| KernelError::not_found("job", id))
    }

    fn require_task(&self, id: &TaskId) -> Result<ClusterTask, KernelError> {
        self.get_task(id)?
            .ok_or_else(|| KernelError::not_found("task", id))
    }
}

#[derive(Default)]
struct Tables {
    clusters: HashMap<ClusterId, Cluster>,
    nodes: HashMap<NodeId, Node>,
    jobs: BTreeMap<JobId, ClusterJob>,
    tasks: BTreeMap<TaskId, ClusterTask>,
}

/// In-memory cluster store.
#[derive(Default)]
pub struct InMemoryClusterStore {
    tables: RwLock<Tables>,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, KernelError> {
        self.tables
            .read()
            .map_err(|e| KernelError::Store(e.to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, KernelError> {
        self.tables
            .write()
            .map_err(|e| KernelError::Store(e.to_string()))
    }
}

trait Versioned: Clone {
    fn version_mut(&mut self) -> &mut u64;
}

macro_rules! versioned {
    ($($ty:ty),*) => {
        $(impl Versioned for $ty {
            fn version_mut(&mut self) -> &mut u64 {
                &mut self.version
            }
        })*
    };
}

versioned!(Cluster, Node, ClusterJob, ClusterTask);

/// Clones `current`, applies `f`, and commits the copy with a bumped version.
fn apply<T: Versioned>(current: &mut T, f: Mutation<'_, T>) -> Result<T, KernelError> {
    let mut next = current.clone();
    f(&mut next)?;
    *next.version_mut() += 1;
    *current = next.clone();
    Ok(next)
}

impl ClusterStore for InMemoryClusterStore {
    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, KernelError> {
        Ok(self.read()?.clusters.get(id).cloned())
    }

    fn insert_cluster(&self, cluster: Cluster) -> Result<(), KernelError> {
        let mut tables = self.write()?;
        if tables.clusters.contains_key(&cluster.id) {
            return Err(KernelError::Conflict(format!("cluster '{}' already exists", cluster.id)));
        }
        tables.clusters.insert(cluster.id.clone(), cluster);
        Ok(())
    }

    fn update_cluster(&self, id: &str, f: Mutation<'_, Cluster>) -> Result<Cluster, KernelError> {
        let mut tables = self.write()?;
        let current = tables
            .clusters
            .get_mut(id)
            .ok_or_else(|| KernelError::not_found("cluster", id))?;
        apply(current, f)
    }

    fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>, KernelError> {
        let tables = self.read()?;
        let mut clusters: Vec<Cluster> = tables
            .clusters
            .values()
            .filter(|c| tenant_id.map_or(true, |t| c.account.tenant_id == t))
            .cloned()
            .collect();
        clusters.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(clusters)
    }

    fn list_expired_clusters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Cluster>, KernelError> {
        let tables = self.read()?;
        let mut expired: Vec<Cluster> = tables
            .clusters
            .values()
            .filter(|c| c.status.is_expirable() && c.is_expired(now))
            .cloned()
            .collect();
        expired.sort_by(|a, b| a.expire_time.cmp(&b.expire_time).then_with(|| a.id.cmp(&b.id)));
        expired.truncate(limit);
        Ok(expired)
    }

    fn get_node(&self, id: &str) -> Result<Option<Node>, KernelError> {
        Ok(self.read()?.nodes.get(id).cloned())
    }

    fn insert_node(&self, node: Node) -> Result<(), KernelError> {
        let mut tables = self.write()?;
        if tables.nodes.contains_key(&node.id) {
            return Err(KernelError::Conflict(format!("node '{}' already exists", node.id)));
        }
        tables.nodes.insert(node.id.clone(), node);
        Ok(())
    }

    fn update_node(&self, id: &str, f: Mutation<'_, Node>) -> Result<Node, KernelError> {
        let mut tables = self.write()?;
        let current = tables
            .nodes
            .get_mut(id)
            .ok_or_else(|| KernelError::not_found("node", id))?;
        apply(current, f)
    }

    fn list_nodes(&self, cluster_id: &str) -> Result<Vec<Node>, KernelError> {
        let tables = self.read()?;
        let mut nodes: Vec<Node> = tables
            .nodes
            .values()
            .filter(|n| n.cluster_id == cluster_id)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    fn get_job(&self, id: &JobId) -> Result<Option<ClusterJob>, KernelError> {
        Ok(self.read()?.jobs.get(id).cloned())
    }

    fn insert_job(&self, job: ClusterJob) -> Result<(), KernelError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(KernelError::Conflict(format!("job '{}' already exists", job.id)));
        }
        tables.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn update_job(&self, id: &JobId, f: Mutation<'_, ClusterJob>) -> Result<ClusterJob, KernelError> {
        let mut tables = self.write()?;
        let current = tables
            .jobs
            .get_mut(id)
            .ok_or_else(|| KernelError::not_found("job", id))?;
        apply(current, f)
    }

    fn list_active_jobs(&self) -> Result<Vec<ClusterJob>, KernelError> {
        Ok(self
            .read()?
            .jobs
            .values()
            .filter(|j| j.is_active())
            .cloned()
            .collect())
    }

    fn delete_job(&self, id: &JobId) -> Result<(), KernelError> {
        let mut tables = self.write()?;
        tables.jobs.remove(id);
        tables.tasks.retain(|task_id, _| task_id.job_id() != id);
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<ClusterTask>, KernelError> {
        Ok(self.read()?.tasks.get(id).cloned())
    }

    fn insert_task(&self, task: ClusterTask) -> Result<(), KernelError> {
        let mut tables = self.write()?;
        if tables.tasks.contains_key(&task.id) {
            return Err(KernelError::Conflict(format!("task '{}' already exists", task.id)));
        }
        tables.tasks.insert(task.id.clone(), task);
        Ok(())
    }

    fn update_task(&self, id: &TaskId, f: Mutation<'_, ClusterTask>) -> Result<ClusterTask, KernelError> {
        let mut tables = self.write()?;
        let current = tables
            .tasks
            .get_mut(id)
            .ok_or_else(|| KernelError::not_found("task", id))?;
        apply(current, f)
    }

    fn list_tasks(&self, job_id: &JobId) -> Result<Vec<ClusterTask>, KernelError> {
        Ok(self
            .read()?
            .tasks
            .values()
            .filter(|t| t.job_id() == job_id)
            .cloned()
            .collect())
    }
}
