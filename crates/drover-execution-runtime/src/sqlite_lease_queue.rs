//! SQLite-backed lease queue.

#![cfg(feature = "sqlite-persistence")]

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use drover_kernel::error::KernelError;
use drover_kernel::identity::TenantId;

use crate::models::{ElementOutcome, LeaseRecord, LeasedElement, QueueElement};
use crate::queue::LeaseQueue;

#[derive(Clone)]
pub struct SqliteLeaseQueue {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteLeaseQueue {
    pub fn new(db_path: &str) -> Result<Self, KernelError> {
        let conn = Connection::open(db_path)
            .map_err(|e| KernelError::Driver(format!("open sqlite lease queue: {}", e)))?;
        let queue = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        queue.ensure_schema()?;
        Ok(queue)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, KernelError> {
        self.conn
            .lock()
            .map_err(|_| KernelError::Driver("sqlite lease queue lock poisoned".to_string()))
    }

    fn ensure_schema(&self) -> Result<(), KernelError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS lease_queue_elements (
              seq INTEGER PRIMARY KEY AUTOINCREMENT,
              tenant_id TEXT NOT NULL,
              element_id TEXT NOT NULL,
              payload_json TEXT NOT NULL,
              state TEXT NOT NULL,
              consumer_id TEXT NULL,
              lease_start_ms INTEGER NULL,
              queued_at_ms INTEGER NOT NULL,
              UNIQUE(tenant_id, element_id)
            );
            CREATE INDEX IF NOT EXISTS idx_lease_queue_tenant_state ON lease_queue_elements(tenant_id, state, seq);
            "#,
        )
        .map_err(|e| KernelError::Driver(format!("init sqlite lease queue schema: {}", e)))?;
        Ok(())
    }
}

impl LeaseQueue for SqliteLeaseQueue {
    fn add(
        &self,
        tenant_id: &str,
        element: QueueElement,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let payload = serde_json::to_string(&element.payload)
            .map_err(|e| KernelError::Queue(format!("encode payload: {}", e)))?;
        let conn = self.lock()?;
        match conn.execute(
            "INSERT INTO lease_queue_elements
             (tenant_id, element_id, payload_json, state, consumer_id, lease_start_ms, queued_at_ms)
             VALUES (?1, ?2, ?3, 'queued', NULL, NULL, ?4)",
            params![tenant_id, element.id, payload, dt_to_ms(now)],
        ) {
            Ok(_) => Ok(true),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Ok(false)
            }
            Err(e) => Err(KernelError::Driver(format!("enqueue element: {}", e))),
        }
    }

    fn take(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeasedElement>, KernelError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| KernelError::Driver(format!("begin take tx: {}", e)))?;
        let head = tx
            .query_row(
                "SELECT seq, element_id, payload_json FROM lease_queue_elements
                 WHERE tenant_id = ?1 AND state = 'queued'
                 ORDER BY seq ASC LIMIT 1",
                params![tenant_id],
                |r| Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)),
            )
            .optional()
            .map_err(|e| KernelError::Driver(format!("select queue head: {}", e)))?;
        let Some((seq, element_id, payload_json)) = head else {
            return Ok(None);
        };
        let updated = tx
            .execute(
                "UPDATE lease_queue_elements
                 SET state = 'being_consumed', consumer_id = ?1, lease_start_ms = ?2
                 WHERE seq = ?3 AND state = 'queued'",
                params![consumer_id, dt_to_ms(now), seq],
            )
            .map_err(|e| KernelError::Driver(format!("lease element: {}", e)))?;
        if updated == 0 {
            return Ok(None);
        }
        tx.commit()
            .map_err(|e| KernelError::Driver(format!("commit take tx: {}", e)))?;
        let payload = parse_payload(&payload_json)?;
        Ok(Some(LeasedElement {
            element: QueueElement {
                id: element_id.clone(),
                payload,
            },
            lease: LeaseRecord {
                tenant_id: tenant_id.to_string(),
                element_id,
                consumer_id: consumer_id.to_string(),
                lease_start: ms_to_dt(dt_to_ms(now)),
            },
        }))
    }

    fn record_progress(
        &self,
        consumer_id: &str,
        tenant_id: &str,
        element_id: &str,
        outcome: ElementOutcome,
        message: &str,
    ) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let affected = if outcome.removes_element() {
            conn.execute(
                "DELETE FROM lease_queue_elements
                 WHERE tenant_id = ?1 AND element_id = ?2
                   AND state = 'being_consumed' AND consumer_id = ?3",
                params![tenant_id, element_id, consumer_id],
            )
        } else {
            conn.execute(
                "UPDATE lease_queue_elements
                 SET state = 'queued', consumer_id = NULL, lease_start_ms = NULL
                 WHERE tenant_id = ?1 AND element_id = ?2
                   AND state = 'being_consumed' AND consumer_id = ?3",
                params![tenant_id, element_id, consumer_id],
            )
        }
        .map_err(|e| KernelError::Driver(format!("record progress: {}", e)))?;
        log::debug!(
            "lease_progress tenant_id={} element_id={} consumer_id={} outcome={:?} applied={} message={}",
            tenant_id,
            element_id,
            consumer_id,
            outcome,
            affected > 0,
            message
        );
        Ok(affected > 0)
    }

    fn remove(&self, tenant_id: &str, element_id: &str) -> Result<bool, KernelError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM lease_queue_elements WHERE tenant_id = ?1 AND element_id = ?2",
                params![tenant_id, element_id],
            )
            .map_err(|e| KernelError::Driver(format!("remove element: {}", e)))?;
        Ok(affected > 0)
    }

    fn remove_all(&self, tenant_id: &str) -> Result<u64, KernelError> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM lease_queue_elements WHERE tenant_id = ?1",
                params![tenant_id],
            )
            .map_err(|e| KernelError::Driver(format!("remove all elements: {}", e)))?;
        Ok(affected as u64)
    }

    fn size(&self, tenant_id: &str) -> Result<usize, KernelError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM lease_queue_elements WHERE tenant_id = ?1",
                params![tenant_id],
                |r| r.get(0),
            )
            .map_err(|e| KernelError::Driver(format!("count elements: {}", e)))?;
        Ok(count as usize)
    }

    fn get_queued(&self, tenant_id: &str) -> Result<Vec<QueueElement>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT element_id, payload_json FROM lease_queue_elements
                 WHERE tenant_id = ?1 AND state = 'queued'
                 ORDER BY seq ASC",
            )
            .map_err(|e| KernelError::Driver(format!("prepare get queued: {}", e)))?;
        let rows = stmt
            .query_map(params![tenant_id], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(|e| KernelError::Driver(format!("query get queued: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            let (id, payload_json) = row.map_err(map_rusqlite_err)?;
            out.push(QueueElement {
                id,
                payload: parse_payload(&payload_json)?,
            });
        }
        Ok(out)
    }

    fn get_being_consumed(&self, tenant_id: &str) -> Result<Vec<LeasedElement>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT element_id, payload_json, consumer_id, lease_start_ms
                 FROM lease_queue_elements
                 WHERE tenant_id = ?1 AND state = 'being_consumed'
                 ORDER BY lease_start_ms ASC, seq ASC",
            )
            .map_err(|e| KernelError::Driver(format!("prepare get being consumed: {}", e)))?;
        let rows = stmt
            .query_map(params![tenant_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| KernelError::Driver(format!("query get being consumed: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            let (element_id, payload_json, consumer_id, lease_start_ms) =
                row.map_err(map_rusqlite_err)?;
            out.push(LeasedElement {
                element: QueueElement {
                    id: element_id.clone(),
                    payload: parse_payload(&payload_json)?,
                },
                lease: LeaseRecord {
                    tenant_id: tenant_id.to_string(),
                    element_id,
                    consumer_id,
                    lease_start: ms_to_dt(lease_start_ms),
                },
            });
        }
        Ok(out)
    }

    fn tenants(&self) -> Result<Vec<TenantId>, KernelError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT DISTINCT tenant_id FROM lease_queue_elements ORDER BY tenant_id")
            .map_err(|e| KernelError::Driver(format!("prepare list tenants: {}", e)))?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(|e| KernelError::Driver(format!("query list tenants: {}", e)))?;
        let tenants = rows
            .map(|r| r.map_err(map_rusqlite_err))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(tenants)
    }
}

fn parse_payload(raw: &str) -> Result<serde_json::Value, KernelError> {
    serde_json::from_str(raw).map_err(|e| KernelError::Queue(format!("decode payload: {}", e)))
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

fn map_rusqlite_err(err: rusqlite::Error) -> KernelError {
    KernelError::Driver(format!("sqlite lease queue: {}", err))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn state_survives_reopening_the_database() {
        let path = std::env::temp_dir().join(format!("drover-queue-{}.db", uuid::Uuid::new_v4()));
        let path_str = path.to_string_lossy().to_string();
        let now = Utc::now();
        {
            let queue = SqliteLeaseQueue::new(&path_str).unwrap();
            queue.add("t1", QueueElement::new("a", json!({"n": 1})), now).unwrap();
            queue.add("t1", QueueElement::new("b", json!({"n": 2})), now).unwrap();
            queue.take("t1", "w1", now).unwrap();
        }
        let reopened = SqliteLeaseQueue::new(&path_str).unwrap();
        let leased = reopened.get_being_consumed("t1").unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].element.payload, json!({"n": 1}));
        assert_eq!(leased[0].lease.lease_start.timestamp_millis(), now.timestamp_millis());
        assert_eq!(reopened.get_queued("t1").unwrap()[0].id, "b");
        let _ = std::fs::remove_file(path);
    }
}
