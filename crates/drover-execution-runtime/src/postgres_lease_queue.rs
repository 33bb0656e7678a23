//! Postgres-backed lease queue.
//!
//! This module is feature-gated behind `kernel-postgres`. Calls are synchronous:
//! each one blocks on a dedicated single-worker tokio runtime, so callers already
//! running inside a tokio runtime must go through `spawn_blocking`.

#![cfg(feature = "kernel-postgres")]

use std::future::Future;
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, TimeZone, Utc};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use drover_kernel::error::KernelError;
use drover_kernel::identity::TenantId;

use crate::models::{ElementOutcome, LeaseRecord, LeasedElement, QueueElement};
use crate::queue::LeaseQueue;

fn is_valid_schema_ident(schema: &str) -> bool {
    !schema.is_empty()
        && schema
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn db_runtime() -> Result<Arc<tokio::runtime::Runtime>, String> {
    static DB_RT: OnceLock<Result<Arc<tokio::runtime::Runtime>, String>> = OnceLock::new();
    DB_RT
        .get_or_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .worker_threads(1)
                .thread_name("drover-queue-pg")
                .build()
                .map(Arc::new)
                .map_err(|e| e.to_string())
        })
        .clone()
}

fn map_driver_err(prefix: &str, e: impl std::fmt::Display) -> KernelError {
    KernelError::Driver(format!("{prefix}: {e}"))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, KernelError> {
    serde_json::from_str(raw).map_err(|e| KernelError::Queue(format!("decode payload: {}", e)))
}

#[derive(Clone)]
pub struct PostgresLeaseQueue {
    pool: Option<PgPool>,
    schema: String,
    init_error: Option<String>,
    db_runtime: Option<Arc<tokio::runtime::Runtime>>,
    schema_ready: Arc<OnceLock<Result<(), String>>>,
}

impl PostgresLeaseQueue {
    pub fn new(database_url: impl Into<String>) -> Self {
        let database_url = database_url.into();
        let db_runtime = db_runtime().ok();
        let pool = {
            // pool maintenance tasks are spawned onto the db runtime
            let _guard = db_runtime.as_ref().map(|rt| rt.enter());
            PgPoolOptions::new()
                .max_connections(5)
                .connect_lazy(&database_url)
                .ok()
        };
        let init_error = if pool.is_some() {
            None
        } else {
            Some("failed to initialize lazy postgres queue pool".to_string())
        };
        Self {
            pool,
            schema: "public".to_string(),
            init_error,
            db_runtime,
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool: Some(pool),
            schema: "public".to_string(),
            init_error: None,
            db_runtime: db_runtime().ok(),
            schema_ready: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self.schema_ready = Arc::new(OnceLock::new());
        self
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, KernelError> {
        if let Some(err) = &self.init_error {
            return Err(map_driver_err("postgres init error", err));
        }
        self.db_runtime
            .as_deref()
            .ok_or_else(|| map_driver_err("runtime not available", "no db runtime"))
    }

    fn pool(&self) -> Result<&PgPool, KernelError> {
        self.pool
            .as_ref()
            .ok_or_else(|| map_driver_err("pool not available", "no postgres pool"))
    }

    fn ensure_schema(&self) -> Result<(), KernelError> {
        if !is_valid_schema_ident(&self.schema) {
            return Err(map_driver_err("invalid schema", &self.schema));
        }
        let result = self.schema_ready.get_or_init(|| {
            let schema = self.schema.clone();
            let sql_schema = format!("CREATE SCHEMA IF NOT EXISTS \"{}\"", schema);
            let sql_elements = format!(
                "CREATE TABLE IF NOT EXISTS \"{}\".lease_queue_elements (
                    seq BIGSERIAL PRIMARY KEY,
                    tenant_id TEXT NOT NULL,
                    element_id TEXT NOT NULL,
                    payload_json TEXT NOT NULL,
                    state TEXT NOT NULL,
                    consumer_id TEXT NULL,
                    lease_start_ms BIGINT NULL,
                    queued_at_ms BIGINT NOT NULL,
                    UNIQUE (tenant_id, element_id)
                )",
                schema
            );
            let sql_idx = format!(
                "CREATE INDEX IF NOT EXISTS idx_lease_queue_tenant_state
                 ON \"{}\".lease_queue_elements(tenant_id, state, seq)",
                schema
            );
            let pool = self.pool().map_err(|e| e.to_string())?.clone();
            let rt = self.runtime().map_err(|e| e.to_string())?;
            rt.block_on(async {
                sqlx::query(&sql_schema).execute(&pool).await?;
                sqlx::query(&sql_elements).execute(&pool).await?;
                sqlx::query(&sql_idx).execute(&pool).await?;
                Ok::<(), sqlx::Error>(())
            })
            .map_err(|e| e.to_string())
        });
        result
            .clone()
            .map_err(|e| map_driver_err("schema bootstrap", e))
    }

    /// Runs `op` with a pool handle and the quoted table name.
    fn run<T, F, Fut>(&self, op: F) -> Result<T, KernelError>
    where
        F: FnOnce(PgPool, String) -> Fut,
        Fut: Future<Output = Result<T, KernelError>>,
    {
        self.ensure_schema()?;
        let pool = self.pool()?.clone();
        let table = format!("\"{}\".lease_queue_elements", self.schema);
        self.runtime()?.block_on(op(pool, table))
    }
}

impl LeaseQueue for PostgresLeaseQueue {
    fn add(
        &self,
        tenant_id: &str,
        element: QueueElement,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let payload = serde_json::to_string(&element.payload)
            .map_err(|e| KernelError::Queue(format!("encode payload: {}", e)))?;
        let tenant_id = tenant_id.to_string();
        self.run(|pool, table| async move {
            let sql = format!(
                "INSERT INTO {} (tenant_id, element_id, payload_json, state, queued_at_ms)
                 VALUES ($1, $2, $3, 'queued', $4)
                 ON CONFLICT (tenant_id, element_id) DO NOTHING",
                table
            );
            let inserted = sqlx::query(&sql)
                .bind(&tenant_id)
                .bind(&element.id)
                .bind(&payload)
                .bind(dt_to_ms(now))
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("enqueue element", e))?
                .rows_affected();
            Ok(inserted > 0)
        })
    }

    fn take(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeasedElement>, KernelError> {
        let tenant_id = tenant_id.to_string();
        let consumer_id = consumer_id.to_string();
        let now_ms = dt_to_ms(now);
        self.run(|pool, table| async move {
            let sql = format!(
                "UPDATE {table}
                 SET state = 'being_consumed', consumer_id = $2, lease_start_ms = $3
                 WHERE seq = (
                   SELECT seq FROM {table}
                   WHERE tenant_id = $1 AND state = 'queued'
                   ORDER BY seq ASC
                   LIMIT 1
                   FOR UPDATE SKIP LOCKED
                 )
                 RETURNING element_id, payload_json",
                table = table
            );
            let row = sqlx::query(&sql)
                .bind(&tenant_id)
                .bind(&consumer_id)
                .bind(now_ms)
                .fetch_optional(&pool)
                .await
                .map_err(|e| map_driver_err("lease element", e))?;
            let Some(row) = row else {
                return Ok(None);
            };
            let element_id: String = row.get(0);
            let payload = parse_payload(row.get::<String, _>(1).as_str())?;
            Ok(Some(LeasedElement {
                element: QueueElement {
                    id: element_id.clone(),
                    payload,
                },
                lease: LeaseRecord {
                    tenant_id,
                    element_id,
                    consumer_id,
                    lease_start: ms_to_dt(now_ms),
                },
            }))
        })
    }

    fn record_progress(
        &self,
        consumer_id: &str,
        tenant_id: &str,
        element_id: &str,
        outcome: ElementOutcome,
        message: &str,
    ) -> Result<bool, KernelError> {
        let args = (
            consumer_id.to_string(),
            tenant_id.to_string(),
            element_id.to_string(),
        );
        let applied = self.run(|pool, table| async move {
            let (consumer_id, tenant_id, element_id) = args;
            let sql = if outcome.removes_element() {
                format!(
                    "DELETE FROM {}
                     WHERE tenant_id = $1 AND element_id = $2
                       AND state = 'being_consumed' AND consumer_id = $3",
                    table
                )
            } else {
                format!(
                    "UPDATE {}
                     SET state = 'queued', consumer_id = NULL, lease_start_ms = NULL
                     WHERE tenant_id = $1 AND element_id = $2
                       AND state = 'being_consumed' AND consumer_id = $3",
                    table
                )
            };
            let affected = sqlx::query(&sql)
                .bind(&tenant_id)
                .bind(&element_id)
                .bind(&consumer_id)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("record progress", e))?
                .rows_affected();
            Ok(affected > 0)
        })?;
        log::debug!(
            "lease_progress tenant_id={} element_id={} consumer_id={} outcome={:?} applied={} message={}",
            tenant_id,
            element_id,
            consumer_id,
            outcome,
            applied,
            message
        );
        Ok(applied)
    }

    fn remove(&self, tenant_id: &str, element_id: &str) -> Result<bool, KernelError> {
        let tenant_id = tenant_id.to_string();
        let element_id = element_id.to_string();
        self.run(|pool, table| async move {
            let sql = format!("DELETE FROM {} WHERE tenant_id = $1 AND element_id = $2", table);
            let affected = sqlx::query(&sql)
                .bind(&tenant_id)
                .bind(&element_id)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("remove element", e))?
                .rows_affected();
            Ok(affected > 0)
        })
    }

    fn remove_all(&self, tenant_id: &str) -> Result<u64, KernelError> {
        let tenant_id = tenant_id.to_string();
        self.run(|pool, table| async move {
            let sql = format!("DELETE FROM {} WHERE tenant_id = $1", table);
            Ok(sqlx::query(&sql)
                .bind(&tenant_id)
                .execute(&pool)
                .await
                .map_err(|e| map_driver_err("remove all elements", e))?
                .rows_affected())
        })
    }

    fn size(&self, tenant_id: &str) -> Result<usize, KernelError> {
        let tenant_id = tenant_id.to_string();
        self.run(|pool, table| async move {
            let sql = format!("SELECT COUNT(*) FROM {} WHERE tenant_id = $1", table);
            let count: i64 = sqlx::query_scalar(&sql)
                .bind(&tenant_id)
                .fetch_one(&pool)
                .await
                .map_err(|e| map_driver_err("count elements", e))?;
            Ok(count as usize)
        })
    }

    fn get_queued(&self, tenant_id: &str) -> Result<Vec<QueueElement>, KernelError> {
        let tenant_id = tenant_id.to_string();
        self.run(|pool, table| async move {
            let sql = format!(
                "SELECT element_id, payload_json FROM {}
                 WHERE tenant_id = $1 AND state = 'queued'
                 ORDER BY seq ASC",
                table
            );
            let rows = sqlx::query(&sql)
                .bind(&tenant_id)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("get queued", e))?;
            rows.into_iter()
                .map(|row| {
                    Ok(QueueElement {
                        id: row.get(0),
                        payload: parse_payload(row.get::<String, _>(1).as_str())?,
                    })
                })
                .collect()
        })
    }

    fn get_being_consumed(&self, tenant_id: &str) -> Result<Vec<LeasedElement>, KernelError> {
        let tenant_id = tenant_id.to_string();
        self.run(|pool, table| async move {
            let sql = format!(
                "SELECT element_id, payload_json, consumer_id, lease_start_ms FROM {}
                 WHERE tenant_id = $1 AND state = 'being_consumed'
                 ORDER BY lease_start_ms ASC, seq ASC",
                table
            );
            let rows = sqlx::query(&sql)
                .bind(&tenant_id)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("get being consumed", e))?;
            rows.into_iter()
                .map(|row| {
                    let element_id: String = row.get(0);
                    Ok(LeasedElement {
                        element: QueueElement {
                            id: element_id.clone(),
                            payload: parse_payload(row.get::<String, _>(1).as_str())?,
                        },
                        lease: LeaseRecord {
                            tenant_id: tenant_id.clone(),
                            element_id,
                            consumer_id: row.get(2),
                            lease_start: ms_to_dt(row.get::<i64, _>(3)),
                        },
                    })
                })
                .collect()
        })
    }

    fn tenants(&self) -> Result<Vec<TenantId>, KernelError> {
        self.run(|pool, table| async move {
            let sql = format!("SELECT DISTINCT tenant_id FROM {} ORDER BY tenant_id", table);
            sqlx::query_scalar::<_, String>(&sql)
                .fetch_all(&pool)
                .await
                .map_err(|e| map_driver_err("list tenants", e))
        })
    }
}
