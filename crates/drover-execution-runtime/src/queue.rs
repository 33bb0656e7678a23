//! Lease queue contract shared by every backend.
//!
//! One FIFO queue per tenant. An element moves `Queued -> BeingConsumed` on
//! [LeaseQueue::take] and leaves that state only through
//! [LeaseQueue::record_progress] by its lease holder, or through the admin
//! removal calls. The queue never expires leases on its own.

use chrono::{DateTime, Utc};

use drover_kernel::error::KernelError;
use drover_kernel::identity::TenantId;

use crate::models::{ElementOutcome, LeasedElement, QueueElement};
use crate::observability::QueueMetrics;

pub trait LeaseQueue: Send + Sync {
    /// Appends `element`; returns false when the tenant already holds an element
    /// with the same id (queued or leased).
    fn add(
        &self,
        tenant_id: &str,
        element: QueueElement,
        now: DateTime<Utc>,
    ) -> Result<bool, KernelError>;

    /// Leases the oldest queued element to `consumer_id`. Two concurrent calls
    /// never lease the same element.
    fn take(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeasedElement>, KernelError>;

    /// Resolves the lease on `element_id`. Returns false, changing nothing, when
    /// the element is not currently leased to `consumer_id`.
    fn record_progress(
        &self,
        consumer_id: &str,
        tenant_id: &str,
        element_id: &str,
        outcome: ElementOutcome,
        message: &str,
    ) -> Result<bool, KernelError>;

    /// Removes an element whatever its lease state; returns whether it existed.
    fn remove(&self, tenant_id: &str, element_id: &str) -> Result<bool, KernelError>;

    /// Removes every element of the tenant; returns how many were removed.
    fn remove_all(&self, tenant_id: &str) -> Result<u64, KernelError>;

    /// Queued plus leased elements.
    fn size(&self, tenant_id: &str) -> Result<usize, KernelError>;

    /// Queued elements, oldest first.
    fn get_queued(&self, tenant_id: &str) -> Result<Vec<QueueElement>, KernelError>;

    /// Leased elements, oldest lease first.
    fn get_being_consumed(&self, tenant_id: &str) -> Result<Vec<LeasedElement>, KernelError>;

    /// Tenants that currently hold at least one element.
    fn tenants(&self) -> Result<Vec<TenantId>, KernelError>;

    fn metrics(&self, tenant_id: &str) -> Result<QueueMetrics, KernelError> {
        let queued = self.get_queued(tenant_id)?.len();
        let in_progress = self.get_being_consumed(tenant_id)?.len();
        Ok(QueueMetrics::new(tenant_id, queued, in_progress))
    }
}
