//! Lease queue backend selection and startup health checks.

use std::collections::HashMap;
use std::sync::Arc;

#[cfg(feature = "kernel-postgres")]
use sqlx::postgres::PgPoolOptions;

use crate::memory_queue::InMemoryLeaseQueue;
#[cfg(feature = "kernel-postgres")]
use crate::postgres_lease_queue::PostgresLeaseQueue;
use crate::queue::LeaseQueue;
#[cfg(feature = "sqlite-persistence")]
use crate::sqlite_lease_queue::SqliteLeaseQueue;

const ENV_KEYS: [&str; 5] = [
    "DROVER_QUEUE_BACKEND",
    "DROVER_SQLITE_DB",
    "DROVER_POSTGRES_DSN",
    "DROVER_POSTGRES_SCHEMA",
    "DROVER_POSTGRES_REQUIRE_SCHEMA",
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueueStorageBackend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Clone, Debug)]
pub struct QueueStorageConfig {
    pub backend: QueueStorageBackend,
    pub sqlite_db_path: String,
    pub postgres_dsn: Option<String>,
    pub postgres_schema: String,
    pub postgres_require_schema: bool,
}

impl Default for QueueStorageConfig {
    fn default() -> Self {
        Self {
            backend: QueueStorageBackend::Memory,
            sqlite_db_path: "drover-queue.db".to_string(),
            postgres_dsn: None,
            postgres_schema: "public".to_string(),
            postgres_require_schema: false,
        }
    }
}

impl QueueStorageConfig {
    pub fn from_env(default_sqlite_db_path: &str) -> Result<Self, String> {
        let mut envs = HashMap::new();
        for key in ENV_KEYS {
            if let Ok(value) = std::env::var(key) {
                envs.insert(key.to_string(), value);
            }
        }
        Self::from_env_map(default_sqlite_db_path, &envs)
    }

    pub fn from_env_map(
        default_sqlite_db_path: &str,
        envs: &HashMap<String, String>,
    ) -> Result<Self, String> {
        let backend_raw = envs
            .get("DROVER_QUEUE_BACKEND")
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_else(|| "memory".to_string());
        let backend = match backend_raw.as_str() {
            "memory" => QueueStorageBackend::Memory,
            "sqlite" => QueueStorageBackend::Sqlite,
            "postgres" => QueueStorageBackend::Postgres,
            other => {
                return Err(format!(
                    "invalid DROVER_QUEUE_BACKEND='{}'. expected one of: memory, sqlite, postgres",
                    other
                ));
            }
        };

        let sqlite_db_path = envs
            .get("DROVER_SQLITE_DB")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default_sqlite_db_path.to_string());
        let postgres_dsn = envs
            .get("DROVER_POSTGRES_DSN")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let postgres_schema = envs
            .get("DROVER_POSTGRES_SCHEMA")
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| "public".to_string());
        let postgres_require_schema = envs
            .get("DROVER_POSTGRES_REQUIRE_SCHEMA")
            .map(|v| parse_bool(v))
            .unwrap_or(false);

        if backend == QueueStorageBackend::Postgres && postgres_dsn.is_none() {
            return Err("DROVER_QUEUE_BACKEND=postgres requires DROVER_POSTGRES_DSN".to_string());
        }

        Ok(Self {
            backend,
            sqlite_db_path,
            postgres_dsn,
            postgres_schema,
            postgres_require_schema,
        })
    }

    /// Opens the configured queue.
    pub fn open(&self) -> Result<Arc<dyn LeaseQueue>, String> {
        match self.backend {
            QueueStorageBackend::Memory => Ok(Arc::new(InMemoryLeaseQueue::new())),
            QueueStorageBackend::Sqlite => self.open_sqlite(),
            QueueStorageBackend::Postgres => self.open_postgres(),
        }
    }

    fn open_sqlite(&self) -> Result<Arc<dyn LeaseQueue>, String> {
        #[cfg(not(feature = "sqlite-persistence"))]
        {
            Err(
                "DROVER_QUEUE_BACKEND=sqlite requires feature 'sqlite-persistence'. Rebuild with --features \"sqlite-persistence\"."
                    .to_string(),
            )
        }
        #[cfg(feature = "sqlite-persistence")]
        {
            let queue = SqliteLeaseQueue::new(&self.sqlite_db_path).map_err(|e| {
                format!(
                    "failed to open sqlite lease queue DROVER_SQLITE_DB='{}': {}",
                    self.sqlite_db_path, e
                )
            })?;
            Ok(Arc::new(queue))
        }
    }

    fn open_postgres(&self) -> Result<Arc<dyn LeaseQueue>, String> {
        #[cfg(not(feature = "kernel-postgres"))]
        {
            Err(
                "DROVER_QUEUE_BACKEND=postgres requires feature 'kernel-postgres'. Rebuild with --features \"kernel-postgres\"."
                    .to_string(),
            )
        }
        #[cfg(feature = "kernel-postgres")]
        {
            let dsn = self
                .postgres_dsn
                .as_deref()
                .ok_or_else(|| "postgres dsn is missing".to_string())?;
            Ok(Arc::new(
                PostgresLeaseQueue::new(dsn.to_string()).with_schema(self.postgres_schema.clone()),
            ))
        }
    }

    pub async fn startup_health_check(&self) -> Result<(), String> {
        match self.backend {
            QueueStorageBackend::Memory => Ok(()),
            QueueStorageBackend::Sqlite => {
                let queue = self.open_sqlite()?;
                queue.tenants().map_err(|e| {
                    format!(
                        "queue backend sqlite health check failed for DROVER_SQLITE_DB='{}': {}",
                        self.sqlite_db_path, e
                    )
                })?;
                Ok(())
            }
            QueueStorageBackend::Postgres => self.postgres_health_check().await,
        }
    }

    async fn postgres_health_check(&self) -> Result<(), String> {
        #[cfg(not(feature = "kernel-postgres"))]
        {
            self.open_postgres().map(|_| ())
        }
        #[cfg(feature = "kernel-postgres")]
        {
            let dsn = self
                .postgres_dsn
                .as_deref()
                .ok_or_else(|| "postgres dsn is missing".to_string())?;
            let pool = PgPoolOptions::new()
                .max_connections(1)
                .connect(dsn)
                .await
                .map_err(|e| format!("failed to connect postgres dsn '{}': {}", dsn, e))?;

            let schema_exists = sqlx::query_scalar::<_, i32>(
                "SELECT 1 FROM pg_namespace WHERE nspname = $1 LIMIT 1",
            )
            .bind(&self.postgres_schema)
            .fetch_optional(&pool)
            .await
            .map_err(|e| {
                format!(
                    "failed to query postgres schema '{}': {}",
                    self.postgres_schema, e
                )
            })?
            .is_some();

            if self.postgres_require_schema && !schema_exists {
                return Err(format!(
                    "postgres schema '{}' does not exist (DROVER_POSTGRES_REQUIRE_SCHEMA=true). create schema first or set DROVER_POSTGRES_REQUIRE_SCHEMA=false",
                    self.postgres_schema
                ));
            }

            let queue = PostgresLeaseQueue::with_pool(pool).with_schema(self.postgres_schema.clone());
            tokio::task::spawn_blocking(move || queue.tenants())
                .await
                .map_err(|e| format!("postgres health check task failed: {}", e))?
                .map_err(|e| {
                    format!(
                        "queue backend postgres health check failed for schema '{}': {}",
                        self.postgres_schema, e
                    )
                })?;
            Ok(())
        }
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{QueueStorageBackend, QueueStorageConfig};

    #[test]
    fn parse_defaults_to_memory_backend() {
        let cfg = QueueStorageConfig::from_env_map("default.db", &HashMap::new())
            .expect("parse default config");
        assert_eq!(cfg.backend, QueueStorageBackend::Memory);
        assert_eq!(cfg.sqlite_db_path, "default.db");
        assert_eq!(cfg.postgres_schema, "public");
        assert!(!cfg.postgres_require_schema);
    }

    #[test]
    fn parse_invalid_backend_fails() {
        let envs = HashMap::from([("DROVER_QUEUE_BACKEND".to_string(), "redis".to_string())]);
        let err = QueueStorageConfig::from_env_map("default.db", &envs)
            .expect_err("invalid backend must fail");
        assert!(err.contains("invalid DROVER_QUEUE_BACKEND"));
    }

    #[test]
    fn parse_postgres_without_dsn_fails() {
        let envs = HashMap::from([("DROVER_QUEUE_BACKEND".to_string(), "Postgres".to_string())]);
        let err = QueueStorageConfig::from_env_map("default.db", &envs)
            .expect_err("missing postgres dsn must fail");
        assert!(err.contains("DROVER_POSTGRES_DSN"));
    }

    #[test]
    fn parse_postgres_custom_schema() {
        let envs = HashMap::from([
            ("DROVER_QUEUE_BACKEND".to_string(), "postgres".to_string()),
            (
                "DROVER_POSTGRES_DSN".to_string(),
                "postgres://localhost/test".to_string(),
            ),
            ("DROVER_POSTGRES_SCHEMA".to_string(), "drover_queue".to_string()),
            ("DROVER_POSTGRES_REQUIRE_SCHEMA".to_string(), "yes".to_string()),
        ]);
        let cfg = QueueStorageConfig::from_env_map("default.db", &envs).expect("parse postgres config");
        assert_eq!(cfg.backend, QueueStorageBackend::Postgres);
        assert_eq!(cfg.postgres_schema, "drover_queue");
        assert!(cfg.postgres_require_schema);
    }

    #[tokio::test]
    async fn memory_backend_opens_and_passes_health_check() {
        let cfg = QueueStorageConfig::default();
        cfg.startup_health_check()
            .await
            .expect("memory health check should pass");
        let queue = cfg.open().expect("open memory queue");
        assert_eq!(queue.size("t1").unwrap(), 0);
    }

    #[cfg(feature = "sqlite-persistence")]
    #[tokio::test]
    async fn sqlite_startup_health_check_accepts_valid_path() {
        let path = std::env::temp_dir().join(format!("drover-backend-config-{}.db", uuid::Uuid::new_v4()));
        let cfg = QueueStorageConfig {
            backend: QueueStorageBackend::Sqlite,
            sqlite_db_path: path.to_string_lossy().to_string(),
            ..QueueStorageConfig::default()
        };
        cfg.startup_health_check()
            .await
            .expect("sqlite health check should pass");
        let _ = std::fs::remove_file(path);
    }
}
