//! Provisioning core with the worker task API.
//!
//! Seeds an in-memory catalog with one template, service and provider, then runs
//! the job tick and cleanup sweep loops next to the HTTP server.
//!
//! Run with:
//!   cargo run -p drover-runtime --example task_server --features "execution-server"
//!
//! The lease queue backend follows `DROVER_QUEUE_BACKEND` (memory, sqlite, postgres).

#[cfg(feature = "execution-server")]
use std::collections::BTreeSet;
#[cfg(feature = "execution-server")]
use std::sync::Arc;

#[cfg(feature = "execution-server")]
use axum::http::StatusCode;
#[cfg(feature = "execution-server")]
use axum::response::IntoResponse;
#[cfg(feature = "execution-server")]
use axum::routing::get;
#[cfg(feature = "execution-server")]
use axum::{Json, Router};
#[cfg(feature = "execution-server")]
use chrono::Utc;
#[cfg(feature = "execution-server")]
use drover_execution_runtime::QueueStorageConfig;
#[cfg(feature = "execution-server")]
use drover_kernel::{
    Account, ClusterTemplate, InMemoryEntityStore, InMemoryProvisionerRegistry, LeasePolicy,
    ProviderSpec, ProvisionerAction, ServiceSpec,
};
#[cfg(feature = "execution-server")]
use drover_runtime::server::build_router;
#[cfg(feature = "execution-server")]
use drover_runtime::{
    ActionCatalog, ClusterCreateRequest, Collaborators, ProvisioningRuntime, SchedulerConfig,
};
#[cfg(feature = "execution-server")]
use serde_json::{json, Map};
#[cfg(feature = "execution-server")]
use tracing_subscriber::EnvFilter;

#[cfg(feature = "execution-server")]
fn seed_catalog(
    entities: &InMemoryEntityStore,
    provisioners: &InMemoryProvisionerRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    entities.put_template(ClusterTemplate {
        name: "web-tier".into(),
        services: BTreeSet::from(["base".to_string(), "nginx".to_string()]),
        min_nodes: 1,
        max_nodes: 8,
        lease: LeasePolicy {
            initial_secs: 24 * 3600,
            max_secs: 7 * 24 * 3600,
            step_secs: 24 * 3600,
        },
        config: json!({"nginx": {"port": 8080}}),
    })?;
    entities.put_service(
        ServiceSpec::new("base")
            .with_action(ProvisionerAction::Install, "shell")
            .with_action(ProvisionerAction::Configure, "shell"),
    )?;
    entities.put_service(
        ServiceSpec::new("nginx")
            .install_requires("base")
            .runtime_requires("base")
            .with_action(ProvisionerAction::Install, "shell")
            .with_action(ProvisionerAction::Configure, "shell")
            .with_action(ProvisionerAction::Start, "shell")
            .with_action(ProvisionerAction::Stop, "shell"),
    )?;
    entities.put_provider(ProviderSpec {
        name: "local".into(),
        provisioner_type: "fake".into(),
        fields: Map::new(),
    })?;
    provisioners.register("provisioner-1")?;
    Ok(())
}

#[cfg(feature = "execution-server")]
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status":"ok"})))
}

#[cfg(feature = "execution-server")]
fn spawn_background_loops(runtime: &ProvisioningRuntime) {
    let jobs = runtime.jobs.clone();
    let tick_interval = runtime.config.tick_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tick_interval);
        loop {
            interval.tick().await;
            let jobs = jobs.clone();
            match tokio::task::spawn_blocking(move || jobs.tick(Utc::now())).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "job tick failed"),
                Err(err) => tracing::error!(error = %err, "job tick panicked"),
            }
        }
    });

    let cleanup = runtime.cleanup.clone();
    let cleanup_interval = runtime.config.cleanup_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        loop {
            interval.tick().await;
            let cleanup = cleanup.clone();
            match tokio::task::spawn_blocking(move || cleanup.run(Utc::now())).await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!(error = %err, "cleanup sweep failed"),
                Err(err) => tracing::error!(error = %err, "cleanup sweep panicked"),
            }
        }
    });
}

#[cfg(feature = "execution-server")]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let addr = std::env::var("DROVER_SERVER_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".into());
    let config = SchedulerConfig::from_env()?;
    let queue_config = QueueStorageConfig::from_env("drover_task_server.db")?;
    queue_config.startup_health_check().await?;
    let queue = queue_config.open()?;

    let (ctx, entities, provisioners) = Collaborators::in_memory();
    seed_catalog(&entities, &provisioners)?;
    let runtime = ProvisioningRuntime::new(
        ctx.with_queue(queue),
        Arc::new(ActionCatalog::standard()),
        config,
    );

    if std::env::var("DROVER_DEMO_CLUSTER").is_ok() {
        let request = ClusterCreateRequest::new(
            "demo",
            Account::new("demo-user", "demo-tenant"),
            "web-tier",
            "local",
            2,
        );
        let (cluster, job) = runtime.clusters.create_cluster(request, Utc::now())?;
        println!(
            "created cluster {} (job {}, {} stages) for tenant demo-tenant",
            cluster.id,
            job.id,
            job.stages.len()
        );
    }

    spawn_background_loops(&runtime);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let app = Router::new()
        .route("/healthz", get(healthz))
        .merge(build_router(runtime.api_state()));

    println!("task server listening on http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

#[cfg(not(feature = "execution-server"))]
fn main() {
    eprintln!("This example requires feature: execution-server");
    eprintln!("Run: cargo run -p drover-runtime --example task_server --features \"execution-server\"");
}
