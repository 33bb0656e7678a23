//! Turns cluster requests into persisted, staged jobs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use drover_kernel::{
    Account, Cluster, ClusterAction, ClusterJob, ClusterStatus, ClusterTask, ClusterTemplate,
    JobId, KernelError, Node, NodeId, ServiceSpec,
};

use crate::catalog::ActionCatalog;
use crate::config::SchedulerConfig;
use crate::context::Collaborators;
use crate::job_scheduler::supersede_job;
use crate::planner::{JobPlanner, PlanRequest};
use crate::resolver::ServiceDependencyResolver;

/// Assigns services to machines for a new cluster.
pub trait LayoutSolver: Send + Sync {
    /// One service set per machine; the result must have `num_machines` entries.
    fn solve(
        &self,
        template: &ClusterTemplate,
        services: &BTreeSet<String>,
        num_machines: usize,
    ) -> Result<Vec<BTreeSet<String>>, KernelError>;
}

/// Places every requested service on every machine.
#[derive(Clone, Copy, Debug, Default)]
pub struct UniformLayoutSolver;

impl LayoutSolver for UniformLayoutSolver {
    fn solve(
        &self,
        _template: &ClusterTemplate,
        services: &BTreeSet<String>,
        num_machines: usize,
    ) -> Result<Vec<BTreeSet<String>>, KernelError> {
        Ok(vec![services.clone(); num_machines])
    }
}

#[derive(Clone, Debug)]
pub struct ClusterCreateRequest {
    pub name: String,
    pub account: Account,
    pub template: String,
    pub provider: String,
    pub num_machines: u32,
    /// Template defaults when empty.
    pub services: BTreeSet<String>,
    pub provider_fields: Map<String, Value>,
    /// Template config when null.
    pub config: Value,
}

impl ClusterCreateRequest {
    pub fn new(
        name: impl Into<String>,
        account: Account,
        template: impl Into<String>,
        provider: impl Into<String>,
        num_machines: u32,
    ) -> Self {
        Self {
            name: name.into(),
            account,
            template: template.into(),
            provider: provider.into(),
            num_machines,
            services: BTreeSet::new(),
            provider_fields: Map::new(),
            config: Value::Null,
        }
    }

    pub fn with_services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.services = services.into_iter().map(Into::into).collect();
        self
    }
}

pub struct ClusterScheduler {
    ctx: Collaborators,
    catalog: Arc<ActionCatalog>,
    resolver: ServiceDependencyResolver,
    solver: Arc<dyn LayoutSolver>,
    config: SchedulerConfig,
}

impl ClusterScheduler {
    pub fn new(ctx: Collaborators, catalog: Arc<ActionCatalog>, config: SchedulerConfig) -> Self {
        Self {
            resolver: ServiceDependencyResolver::new(catalog.clone()),
            ctx,
            catalog,
            solver: Arc::new(UniformLayoutSolver),
            config,
        }
    }

    pub fn with_solver(mut self, solver: Arc<dyn LayoutSolver>) -> Self {
        self.solver = solver;
        self
    }

    /// Validates `request`, lays out its machines and persists the cluster, its
    /// nodes and the CLUSTER_CREATE job. Nothing is written when validation fails.
    pub fn create_cluster(
        &self,
        request: ClusterCreateRequest,
        now: DateTime<Utc>,
    ) -> Result<(Cluster, ClusterJob), KernelError> {
        let tenant_id = request.account.tenant_id.clone();
        if request.name.trim().is_empty() {
            return Err(KernelError::Validation("cluster name must not be empty".into()));
        }
        let template = self
            .ctx
            .entities
            .template(&request.template)?
            .ok_or_else(|| KernelError::not_found("template", &request.template))?;
        let min_nodes = template.min_nodes.max(1);
        if request.num_machines < min_nodes
            || (template.max_nodes != 0 && request.num_machines > template.max_nodes)
        {
            return Err(KernelError::Validation(format!(
                "template '{}' allows {} to {} nodes, {} requested",
                template.name,
                min_nodes,
                bound(template.max_nodes),
                request.num_machines
            )));
        }
        let services = if request.services.is_empty() {
            template.services.clone()
        } else {
            request.services.clone()
        };
        if services.is_empty() {
            return Err(KernelError::Validation(format!(
                "no services requested and template '{}' has no defaults",
                template.name
            )));
        }
        let specs = self.ctx.entities.services(&services)?;
        let provider = self
            .ctx
            .entities
            .provider(&request.provider)?
            .ok_or_else(|| KernelError::not_found("provider", &request.provider))?;
        let dependencies = self.resolver.resolve(&specs)?;

        let live: Vec<Cluster> = self
            .ctx
            .store
            .list_clusters(Some(&tenant_id))?
            .into_iter()
            .filter(|c| c.status != ClusterStatus::Terminated)
            .collect();
        if live.iter().any(|c| c.name == request.name) {
            return Err(KernelError::Validation(format!(
                "tenant '{}' already has a cluster named '{}'",
                tenant_id, request.name
            )));
        }
        let live_nodes: usize = live.iter().map(|c| c.nodes.len()).sum();
        let quota = self.ctx.tenants.quota(&tenant_id)?;
        let num_machines = request.num_machines as usize;
        if !quota.admits(live.len() + 1, live_nodes + num_machines) {
            return Err(KernelError::Conflict(format!(
                "tenant '{}' quota of {} clusters / {} nodes exceeded",
                tenant_id,
                bound(quota.max_clusters),
                bound(quota.max_nodes)
            )));
        }

        let layout = self.solver.solve(&template, &services, num_machines)?;
        if layout.len() != num_machines {
            return Err(KernelError::Validation(format!(
                "layout for template '{}' has {} nodes, {} requested",
                template.name,
                layout.len(),
                num_machines
            )));
        }

        let cluster_id = Uuid::new_v4().simple().to_string();
        let nodes: Vec<Node> = layout
            .into_iter()
            .enumerate()
            .map(|(i, node_services)| {
                Node::new(format!("{}-n{}", cluster_id, i + 1), cluster_id.clone(), node_services)
            })
            .collect();
        let placement: BTreeMap<NodeId, BTreeSet<String>> = nodes
            .iter()
            .map(|node| (node.id.clone(), node.services.clone()))
            .collect();
        let spec_index = index_specs(specs);

        let job_id = JobId::new(cluster_id.clone(), 1);
        let mut job = ClusterJob::new(
            job_id.clone(),
            tenant_id.clone(),
            ClusterAction::ClusterCreate,
            self.config.max_retries,
            now,
        );
        job.services = services.clone();
        let plan = JobPlanner::new(&self.catalog).plan(&PlanRequest {
            action: ClusterAction::ClusterCreate,
            placement: &placement,
            specs: &spec_index,
            dependencies: &dependencies,
        })?;
        let tasks = plan.materialize(&mut job, now);

        let cluster = Cluster {
            id: cluster_id.clone(),
            name: request.name,
            account: request.account,
            status: ClusterStatus::Pending,
            template: template.name.clone(),
            provider: provider.name.clone(),
            provider_fields: request.provider_fields,
            services,
            nodes: placement.keys().cloned().collect(),
            config: if request.config.is_null() {
                template.config.clone()
            } else {
                request.config
            },
            create_time: now,
            expire_time: template.lease.initial().map(|initial| now + initial),
            latest_job_id: Some(job_id),
            message: String::new(),
            version: 0,
        };

        for node in nodes {
            self.ctx.store.insert_node(node)?;
        }
        self.ctx.store.insert_cluster(cluster.clone())?;
        for task in tasks {
            self.ctx.store.insert_task(task)?;
        }
        self.ctx.store.insert_job(job.clone())?;

        log::info!(
            "cluster_created cluster_id={} tenant_id={} template={} nodes={} job_id={} stages={}",
            cluster.id,
            tenant_id,
            cluster.template,
            cluster.nodes.len(),
            job.id,
            job.stages.len()
        );
        Ok((cluster, job))
    }

    /// Plans `action` on an existing cluster. Empty `targets` means every service
    /// of the cluster (not allowed for ADD_SERVICES).
    pub fn schedule_action(
        &self,
        cluster_id: &str,
        account: &Account,
        action: ClusterAction,
        targets: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<ClusterJob, KernelError> {
        let cluster = self.ctx.store.require_cluster(cluster_id)?;
        if !account.can_manage(&cluster.account) {
            return Err(KernelError::Forbidden(format!(
                "user '{}' may not manage cluster '{}'",
                account.user_id, cluster.id
            )));
        }
        if action == ClusterAction::ClusterCreate {
            return Err(KernelError::Validation(
                "CLUSTER_CREATE is requested through cluster creation".into(),
            ));
        }
        if cluster.status == ClusterStatus::Terminated {
            return Err(KernelError::Conflict(format!(
                "cluster '{}' is terminated",
                cluster.id
            )));
        }
        let deleting = action == ClusterAction::ClusterDelete;
        if !deleting
            && !matches!(
                cluster.status,
                ClusterStatus::Active | ClusterStatus::Inconsistent
            )
        {
            return Err(KernelError::Conflict(format!(
                "cluster '{}' is {:?}, {} needs an active cluster",
                cluster.id, cluster.status, action
            )));
        }

        let expected = cluster.latest_job_id.clone().ok_or_else(|| {
            KernelError::Conflict(format!("cluster '{}' has no job history", cluster.id))
        })?;
        let latest = self.ctx.store.require_job(&expected)?;
        if latest.is_active() && !deleting {
            return Err(KernelError::Conflict(format!(
                "job '{}' is still {:?} on cluster '{}'",
                latest.id, latest.status, cluster.id
            )));
        }

        let nodes = self.ctx.store.list_nodes(&cluster.id)?;
        let (job_services, specs, placement, dependencies): (
            BTreeSet<String>,
            Vec<ServiceSpec>,
            BTreeMap<NodeId, BTreeSet<String>>,
            _,
        ) = match action {
            ClusterAction::ClusterDelete => {
                let placement = nodes
                    .iter()
                    .map(|node| (node.id.clone(), BTreeSet::new()))
                    .collect();
                (BTreeSet::new(), Vec::new(), placement, self.resolver.resolve(&[])?)
            }
            ClusterAction::AddServices => {
                if targets.is_empty() {
                    return Err(KernelError::Validation(
                        "ADD_SERVICES needs at least one service".into(),
                    ));
                }
                if let Some(present) = targets.iter().find(|s| cluster.services.contains(*s)) {
                    return Err(KernelError::Validation(format!(
                        "service '{}' is already on cluster '{}'",
                        present, cluster.id
                    )));
                }
                let mut specs = self.ctx.entities.services(&cluster.services)?;
                specs.extend(self.ctx.entities.services(targets)?);
                let dependencies = self.resolver.resolve(&specs)?;
                let placement = nodes
                    .iter()
                    .map(|node| (node.id.clone(), targets.clone()))
                    .collect();
                (targets.clone(), specs, placement, dependencies)
            }
            _ => {
                if let Some(unknown) = targets.iter().find(|s| !cluster.services.contains(*s)) {
                    return Err(KernelError::Validation(format!(
                        "service '{}' is not on cluster '{}'",
                        unknown, cluster.id
                    )));
                }
                let targets = if targets.is_empty() {
                    &cluster.services
                } else {
                    targets
                };
                let existing = self.ctx.entities.services(&cluster.services)?;
                let dependencies = self.resolver.resolve(&existing)?;
                let mut covered = targets.clone();
                for target in targets {
                    match action {
                        ClusterAction::StartServices => {
                            covered.extend(dependencies.runtime.transitive_dependencies(target));
                        }
                        ClusterAction::StopServices
                        | ClusterAction::RestartServices
                        | ClusterAction::ClusterConfigureWithRestart => {
                            covered.extend(dependencies.runtime.transitive_dependents(target));
                        }
                        _ => {}
                    }
                }
                let placement = nodes
                    .iter()
                    .map(|node| {
                        let on_node = node.services.intersection(&covered).cloned().collect();
                        (node.id.clone(), on_node)
                    })
                    .collect();
                (covered, existing, placement, dependencies)
            }
        };

        let job_id = cluster.next_job_id();
        let mut job = ClusterJob::new(
            job_id.clone(),
            cluster.account.tenant_id.clone(),
            action,
            self.config.max_retries,
            now,
        );
        job.services = job_services;
        let spec_index = index_specs(specs);
        let plan = JobPlanner::new(&self.catalog).plan(&PlanRequest {
            action,
            placement: &placement,
            specs: &spec_index,
            dependencies: &dependencies,
        })?;
        let tasks = plan.materialize(&mut job, now);

        let previous_status = cluster.status;
        self.ctx.store.update_cluster(&cluster.id, &mut |current| {
            if current.latest_job_id.as_ref() != Some(&expected) {
                return Err(KernelError::Conflict(format!(
                    "cluster '{}' was scheduled concurrently",
                    current.id
                )));
            }
            if current.status == ClusterStatus::Terminated {
                return Err(KernelError::Conflict(format!(
                    "cluster '{}' is terminated",
                    current.id
                )));
            }
            current.latest_job_id = Some(job_id.clone());
            current.status = ClusterStatus::Pending;
            Ok(())
        })?;

        if let Err(err) = self.persist_job(&job, tasks) {
            log::warn!(
                "job_persist_failed cluster_id={} job_id={} error={}",
                cluster.id,
                job.id,
                err
            );
            let reverted = self.ctx.store.update_cluster(&cluster.id, &mut |current| {
                if current.latest_job_id.as_ref() == Some(&job_id) {
                    current.latest_job_id = Some(expected.clone());
                    current.status = previous_status;
                }
                Ok(())
            });
            if let Err(revert) = reverted {
                log::error!("cluster_revert_failed cluster_id={} error={}", cluster.id, revert);
            }
            if let Err(cleanup) = self.ctx.store.delete_job(&job.id) {
                log::debug!("job_cleanup_skipped job_id={} error={}", job.id, cleanup);
            }
            return Err(err);
        }

        if latest.is_active() {
            // the job tick fails it on its next pass if this does not
            if let Err(err) = supersede_job(&self.ctx, &latest.id, &job.id, now) {
                log::warn!(
                    "job_supersede_deferred job_id={} by={} error={}",
                    latest.id,
                    job.id,
                    err
                );
            }
        }

        log::info!(
            "cluster_action_scheduled cluster_id={} action={} job_id={} stages={} services={}",
            cluster.id,
            action,
            job.id,
            job.stages.len(),
            job.services.len()
        );
        Ok(job)
    }

    fn persist_job(&self, job: &ClusterJob, tasks: Vec<ClusterTask>) -> Result<(), KernelError> {
        for task in tasks {
            self.ctx.store.insert_task(task)?;
        }
        self.ctx.store.insert_job(job.clone())
    }

    /// Moves the cluster's expire time towards `requested`, bounded by the
    /// template's maximum lease and by one step past the current expire time.
    pub fn extend_lease(
        &self,
        cluster_id: &str,
        account: &Account,
        requested: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Cluster, KernelError> {
        let cluster = self.ctx.store.require_cluster(cluster_id)?;
        if !account.can_manage(&cluster.account) {
            return Err(KernelError::Forbidden(format!(
                "user '{}' may not manage cluster '{}'",
                account.user_id, cluster.id
            )));
        }
        if cluster.status == ClusterStatus::Terminated {
            return Err(KernelError::Conflict(format!(
                "cluster '{}' is terminated",
                cluster.id
            )));
        }
        let current = cluster.expire_time.ok_or_else(|| {
            KernelError::Validation(format!("cluster '{}' never expires", cluster.id))
        })?;
        if requested <= now {
            return Err(KernelError::Validation(format!(
                "requested expire time {} is in the past",
                requested
            )));
        }
        let template = self
            .ctx
            .entities
            .template(&cluster.template)?
            .ok_or_else(|| KernelError::not_found("template", &cluster.template))?;

        let mut target = requested;
        if let Some(max) = template.lease.max() {
            target = target.min(cluster.create_time + max);
        }
        if let Some(step) = template.lease.step() {
            target = target.min(current + step);
        }
        if target <= current {
            return Err(KernelError::Validation(format!(
                "cluster '{}' lease cannot be extended past {}",
                cluster.id, current
            )));
        }

        let updated = self.ctx.store.update_cluster(&cluster.id, &mut |cluster| {
            cluster.expire_time = Some(target);
            Ok(())
        })?;
        log::info!(
            "cluster_lease_extended cluster_id={} from={} to={}",
            updated.id,
            current,
            target
        );
        Ok(updated)
    }
}

fn index_specs(specs: Vec<ServiceSpec>) -> BTreeMap<String, ServiceSpec> {
    specs.into_iter().map(|s| (s.name.clone(), s)).collect()
}

fn bound(limit: u32) -> String {
    if limit == 0 {
        "unbounded".to_string()
    } else {
        limit.to_string()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use drover_kernel::{ErrorKind, InMemoryEntityStore, LeasePolicy, ProviderSpec, ProvisionerAction, TenantQuota};

    use super::*;

    fn template(lease: LeasePolicy) -> ClusterTemplate {
        ClusterTemplate {
            name: "base".into(),
            services: BTreeSet::from(["web".to_string()]),
            min_nodes: 1,
            max_nodes: 3,
            lease,
            config: Value::Null,
        }
    }

    fn seed(entities: &InMemoryEntityStore, lease: LeasePolicy) {
        entities.put_template(template(lease)).unwrap();
        entities
            .put_service(
                ServiceSpec::new("web")
                    .with_action(ProvisionerAction::Install, "shell")
                    .with_action(ProvisionerAction::Start, "shell")
                    .with_action(ProvisionerAction::Stop, "shell"),
            )
            .unwrap();
        entities
            .put_provider(ProviderSpec {
                name: "cloud".into(),
                provisioner_type: "openstack".into(),
                fields: Map::new(),
            })
            .unwrap();
    }

    fn scheduler(lease: LeasePolicy) -> ClusterScheduler {
        let (ctx, entities, _) = Collaborators::in_memory();
        seed(&entities, lease);
        ClusterScheduler::new(ctx, Arc::new(ActionCatalog::standard()), SchedulerConfig::default())
    }

    fn request(nodes: u32) -> ClusterCreateRequest {
        ClusterCreateRequest::new("demo", Account::new("alice", "t1"), "base", "cloud", nodes)
    }

    #[test]
    fn create_persists_cluster_nodes_and_job() {
        let scheduler = scheduler(LeasePolicy::default());
        let now = Utc::now();
        let (cluster, job) = scheduler.create_cluster(request(2), now).unwrap();
        assert_eq!(cluster.status, ClusterStatus::Pending);
        assert_eq!(cluster.nodes.len(), 2);
        assert_eq!(cluster.latest_job_id.as_ref(), Some(&job.id));
        assert_eq!(cluster.expire_time, None);
        assert_eq!(job.services, BTreeSet::from(["web".to_string()]));
        assert_eq!(scheduler.ctx.store.list_tasks(&job.id).unwrap().len(), 2 * 3 + 2 * 2);
        assert!(scheduler.ctx.store.get_job(&job.id).unwrap().is_some());
    }

    #[test]
    fn node_count_outside_template_bounds_persists_nothing() {
        let scheduler = scheduler(LeasePolicy::default());
        let err = scheduler.create_cluster(request(4), Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(scheduler.ctx.store.list_clusters(None).unwrap().is_empty());
    }

    #[test]
    fn unknown_service_and_provider_are_not_found() {
        let scheduler = scheduler(LeasePolicy::default());
        let err = scheduler
            .create_cluster(request(1).with_services(["zookeeper"]), Utc::now())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let mut req = request(1);
        req.provider = "nowhere".into();
        assert_eq!(
            scheduler.create_cluster(req, Utc::now()).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn tenant_quota_is_enforced() {
        let (ctx, entities, _) = Collaborators::in_memory();
        seed(&entities, LeasePolicy::default());
        let tenants = Arc::new(drover_kernel::InMemoryTenantDirectory::new(TenantQuota {
            max_clusters: 1,
            max_nodes: 0,
        }));
        let scheduler = ClusterScheduler::new(
            ctx.with_tenants(tenants),
            Arc::new(ActionCatalog::standard()),
            SchedulerConfig::default(),
        );
        scheduler.create_cluster(request(1), Utc::now()).unwrap();
        let mut second = request(1);
        second.name = "other".into();
        let err = scheduler.create_cluster(second, Utc::now()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn actions_are_rejected_while_a_job_is_active() {
        let scheduler = scheduler(LeasePolicy::default());
        let (cluster, _) = scheduler.create_cluster(request(1), Utc::now()).unwrap();
        let err = scheduler
            .schedule_action(
                &cluster.id,
                &Account::new("alice", "t1"),
                ClusterAction::StopServices,
                &BTreeSet::new(),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = scheduler
            .schedule_action(
                &cluster.id,
                &Account::new("mallory", "t1"),
                ClusterAction::ClusterDelete,
                &BTreeSet::new(),
                Utc::now(),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Forbidden);
    }

    #[test]
    fn delete_supersedes_the_active_job() {
        let scheduler = scheduler(LeasePolicy::default());
        let (cluster, create) = scheduler.create_cluster(request(1), Utc::now()).unwrap();
        let delete = scheduler
            .schedule_action(
                &cluster.id,
                &Account::admin("t1"),
                ClusterAction::ClusterDelete,
                &BTreeSet::new(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(delete.id.seq(), 2);
        assert_eq!(delete.stages.len(), 1);
        let create = scheduler.ctx.store.require_job(&create.id).unwrap();
        assert_eq!(create.status, drover_kernel::JobStatus::Failed);
        let cluster = scheduler.ctx.store.require_cluster(&cluster.id).unwrap();
        assert_eq!(cluster.latest_job_id, Some(delete.id));
    }

    #[test]
    fn lease_extension_is_bounded_by_step_and_max() {
        let scheduler = scheduler(LeasePolicy {
            initial_secs: 3600,
            max_secs: 3 * 3600,
            step_secs: 3600,
        });
        let now = Utc::now();
        let (cluster, _) = scheduler.create_cluster(request(1), now).unwrap();
        let owner = Account::new("alice", "t1");

        let extended = scheduler
            .extend_lease(&cluster.id, &owner, now + Duration::days(1), now)
            .unwrap();
        assert_eq!(extended.expire_time, Some(now + Duration::hours(2)));

        let extended = scheduler
            .extend_lease(&cluster.id, &owner, now + Duration::days(1), now)
            .unwrap();
        assert_eq!(extended.expire_time, Some(now + Duration::hours(3)));

        let err = scheduler
            .extend_lease(&cluster.id, &owner, now + Duration::days(1), now)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
