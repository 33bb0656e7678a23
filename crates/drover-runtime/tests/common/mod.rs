//! Helpers shared by the provisioning integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{json, Map};

use drover_kernel::{
    Account, Cluster, ClusterJob, ClusterStore, ClusterTask, ClusterTemplate, InMemoryClusterStore,
    JobId, KernelError, LeasePolicy, Mutation, Node, ProviderSpec, ProvisionerAction, ServiceSpec,
    TaskId,
};
use drover_runtime::{
    ActionCatalog, ClusterCreateRequest, Collaborators, ProvisioningRuntime, SchedulerConfig,
    TaskPayload, TaskResult,
};

pub const TENANT: &str = "acme";
pub const WORKER: &str = "worker-1";
pub const PROVISIONER: &str = "provisioner-1";

pub fn template(name: &str, services: &[&str]) -> ClusterTemplate {
    ClusterTemplate {
        name: name.into(),
        services: services.iter().map(|s| s.to_string()).collect(),
        min_nodes: 1,
        max_nodes: 4,
        lease: LeasePolicy {
            initial_secs: 3600,
            max_secs: 4 * 3600,
            step_secs: 3600,
        },
        config: json!({}),
    }
}

pub fn runtime(config: SchedulerConfig) -> ProvisioningRuntime {
    runtime_on(config, Arc::new(InMemoryClusterStore::new()))
}

/// Seeded runtime whose cluster store is `store`.
pub fn runtime_on(config: SchedulerConfig, store: Arc<dyn ClusterStore>) -> ProvisioningRuntime {
    let (ctx, entities, provisioners) = Collaborators::in_memory();
    let ctx = Collaborators { store, ..ctx };
    entities.put_template(template("solo", &["base"])).unwrap();
    entities.put_template(template("stack", &["db", "app"])).unwrap();
    entities
        .put_service(ServiceSpec::new("base").with_action(ProvisionerAction::Install, "shell"))
        .unwrap();
    entities
        .put_service(
            ServiceSpec::new("db")
                .with_action(ProvisionerAction::Install, "shell")
                .with_action(ProvisionerAction::Start, "shell")
                .with_action(ProvisionerAction::Stop, "shell"),
        )
        .unwrap();
    entities
        .put_service(
            ServiceSpec::new("app")
                .install_requires("db")
                .runtime_requires("db")
                .with_action(ProvisionerAction::Install, "shell")
                .with_action(ProvisionerAction::Start, "shell")
                .with_action(ProvisionerAction::Stop, "shell"),
        )
        .unwrap();
    entities
        .put_provider(ProviderSpec {
            name: "cloud".into(),
            provisioner_type: "fake".into(),
            fields: Map::new(),
        })
        .unwrap();
    provisioners.register(PROVISIONER).unwrap();
    ProvisioningRuntime::new(ctx, Arc::new(ActionCatalog::standard()), config)
}

pub fn create(
    rt: &ProvisioningRuntime,
    template: &str,
    services: &[&str],
    nodes: u32,
    now: DateTime<Utc>,
) -> (String, JobId) {
    let request = ClusterCreateRequest::new(
        format!("{}-{}", template, nodes),
        Account::new("alice", TENANT),
        template,
        "cloud",
        nodes,
    )
    .with_services(services.iter().copied());
    let (cluster, job) = rt.clusters.create_cluster(request, now).unwrap();
    (cluster.id, job.id)
}

/// Ticks the job and works every leasable task until the job is terminal.
/// Returns the sorted task names of each round.
pub fn drive<F>(rt: &ProvisioningRuntime, job_id: &JobId, now: DateTime<Utc>, mut outcome: F) -> Vec<Vec<String>>
where
    F: FnMut(&TaskPayload) -> TaskResult,
{
    let mut rounds = Vec::new();
    for _ in 0..64 {
        rt.jobs.tick(now).unwrap();
        let job = rt.ctx.store.require_job(job_id).unwrap();
        if job.status.is_terminal() {
            return rounds;
        }
        let current: HashSet<String> =
            job.current_stage_tasks().iter().map(ToString::to_string).collect();
        let mut round = Vec::new();
        while let Some(payload) = rt.delivery.take_next(WORKER, PROVISIONER, TENANT, now).unwrap() {
            assert!(
                current.contains(&payload.task_id),
                "task {} leased outside stage {}",
                payload.task_id,
                job.current_stage
            );
            let result = outcome(&payload);
            rt.delivery
                .finish(WORKER, PROVISIONER, TENANT, &payload.task_id, result, now)
                .unwrap();
            round.push(payload.task_name);
        }
        round.sort();
        if !round.is_empty() {
            rounds.push(round);
        }
    }
    panic!("job {} did not finish", job_id);
}

pub fn succeed(_: &TaskPayload) -> TaskResult {
    TaskResult::succeeded()
}

pub fn names(round: &[&str]) -> Vec<String> {
    round.iter().map(|s| s.to_string()).collect()
}


/// Cluster store that fails chosen operations a set number of times before
/// passing them through to an in-memory store.
#[derive(Default)]
pub struct FlakyStore {
    inner: InMemoryClusterStore,
    update_cluster: AtomicUsize,
    update_job: AtomicUsize,
    list_nodes: AtomicUsize,
    injected: AtomicUsize,
}

impl FlakyStore {
    pub fn fail_update_cluster(&self, times: usize) {
        self.update_cluster.store(times, Ordering::SeqCst);
    }

    pub fn fail_update_job(&self, times: usize) {
        self.update_job.store(times, Ordering::SeqCst);
    }

    pub fn fail_list_nodes(&self, times: usize) {
        self.list_nodes.store(times, Ordering::SeqCst);
    }

    /// Failures returned so far.
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn trip(&self, armed: &AtomicUsize, op: &str) -> Result<(), KernelError> {
        if armed
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
        {
            self.injected.fetch_add(1, Ordering::SeqCst);
            return Err(KernelError::Store(format!("{} unavailable", op)));
        }
        Ok(())
    }
}

impl ClusterStore for FlakyStore {
    fn get_cluster(&self, id: &str) -> Result<Option<Cluster>, KernelError> {
        self.inner.get_cluster(id)
    }

    fn insert_cluster(&self, cluster: Cluster) -> Result<(), KernelError> {
        self.inner.insert_cluster(cluster)
    }

    fn update_cluster(&self, id: &str, f: Mutation<'_, Cluster>) -> Result<Cluster, KernelError> {
        self.trip(&self.update_cluster, "update_cluster")?;
        self.inner.update_cluster(id, f)
    }

    fn list_clusters(&self, tenant_id: Option<&str>) -> Result<Vec<Cluster>, KernelError> {
        self.inner.list_clusters(tenant_id)
    }

    fn list_expired_clusters(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Cluster>, KernelError> {
        self.inner.list_expired_clusters(now, limit)
    }

    fn get_node(&self, id: &str) -> Result<Option<Node>, KernelError> {
        self.inner.get_node(id)
    }

    fn insert_node(&self, node: Node) -> Result<(), KernelError> {
        self.inner.insert_node(node)
    }

    fn update_node(&self, id: &str, f: Mutation<'_, Node>) -> Result<Node, KernelError> {
        self.inner.update_node(id, f)
    }

    fn list_nodes(&self, cluster_id: &str) -> Result<Vec<Node>, KernelError> {
        self.trip(&self.list_nodes, "list_nodes")?;
        self.inner.list_nodes(cluster_id)
    }

    fn get_job(&self, id: &JobId) -> Result<Option<ClusterJob>, KernelError> {
        self.inner.get_job(id)
    }

    fn insert_job(&self, job: ClusterJob) -> Result<(), KernelError> {
        self.inner.insert_job(job)
    }

    fn update_job(&self, id: &JobId, f: Mutation<'_, ClusterJob>) -> Result<ClusterJob, KernelError> {
        self.trip(&self.update_job, "update_job")?;
        self.inner.update_job(id, f)
    }

    fn list_active_jobs(&self) -> Result<Vec<ClusterJob>, KernelError> {
        self.inner.list_active_jobs()
    }

    fn delete_job(&self, id: &JobId) -> Result<(), KernelError> {
        self.inner.delete_job(id)
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<ClusterTask>, KernelError> {
        self.inner.get_task(id)
    }

    fn insert_task(&self, task: ClusterTask) -> Result<(), KernelError> {
        self.inner.insert_task(task)
    }

    fn update_task(&self, id: &TaskId, f: Mutation<'_, ClusterTask>) -> Result<ClusterTask, KernelError> {
        self.inner.update_task(id, f)
    }

    fn list_tasks(&self, job_id: &JobId) -> Result<Vec<ClusterTask>, KernelError> {
        self.inner.list_tasks(job_id)
    }
}
