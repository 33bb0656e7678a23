//! Lease ownership and timeout handling.
//!
//! [WorkerLease] wraps a [LeaseRecord] and enforces single-owner processing:
//! callers check [WorkerLease::verify_owner] before acting on an element's
//! behalf. Timed-out leases are found with [stale_leases]; resolving them is the
//! caller's job, the queue itself never expires a lease.

use chrono::{DateTime, Duration, Utc};

use drover_kernel::error::KernelError;

use crate::models::{LeaseRecord, LeasedElement};
use crate::queue::LeaseQueue;

/// Strict single-owner guard for one lease.
#[derive(Clone, Debug)]
pub struct WorkerLease {
    record: LeaseRecord,
}

impl WorkerLease {
    pub fn from_record(record: LeaseRecord) -> Self {
        Self { record }
    }

    pub fn record(&self) -> &LeaseRecord {
        &self.record
    }

    pub fn element_id(&self) -> &str {
        &self.record.element_id
    }

    pub fn consumer_id(&self) -> &str {
        &self.record.consumer_id
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.record.lease_start
    }

    /// True once the lease has gone `timeout` without being resolved.
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        self.age(now) > timeout
    }

    /// `Ok(())` only if `consumer_id` holds this lease.
    pub fn verify_owner(&self, consumer_id: &str) -> Result<(), KernelError> {
        if self.record.consumer_id != consumer_id {
            return Err(KernelError::LeaseMismatch(format!(
                "element {} is leased to {}, not {}",
                self.record.element_id, self.record.consumer_id, consumer_id
            )));
        }
        Ok(())
    }
}

/// Lease timing knobs.
#[derive(Clone, Debug)]
pub struct LeaseConfig {
    /// A lease older than this with no progress recorded is stuck.
    pub lease_timeout: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::minutes(10),
        }
    }
}

/// Leased elements of `tenant_id` whose lease outlived `config.lease_timeout`.
pub fn stale_leases<Q: LeaseQueue + ?Sized>(
    queue: &Q,
    tenant_id: &str,
    config: &LeaseConfig,
    now: DateTime<Utc>,
) -> Result<Vec<LeasedElement>, KernelError> {
    Ok(queue
        .get_being_consumed(tenant_id)?
        .into_iter()
        .filter(|leased| {
            WorkerLease::from_record(leased.lease.clone()).is_expired(now, config.lease_timeout)
        })
        .collect())
}
