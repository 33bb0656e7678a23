//! Lease queue element and lease records.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use drover_kernel::identity::{TenantId, WorkerId};

/// A leasable unit of work; `id` is unique within its tenant queue.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueueElement {
    pub id: String,
    /// Opaque to the queue.
    pub payload: Value,
}

impl QueueElement {
    pub fn new(id: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Exclusive right of one consumer to process one element.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct LeaseRecord {
    pub tenant_id: TenantId,
    pub element_id: String,
    pub consumer_id: WorkerId,
    pub lease_start: DateTime<Utc>,
}

/// An element together with the lease it is held under.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LeasedElement {
    pub element: QueueElement,
    pub lease: LeaseRecord,
}

/// How a consumer's progress report resolves its lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ElementOutcome {
    /// Processed; the element is removed.
    Acked,
    /// Returned to the queue at its original position.
    Requeued,
    /// Given up on; the element is removed.
    Dropped,
}

impl ElementOutcome {
    pub fn removes_element(&self) -> bool {
        !matches!(self, Self::Requeued)
    }
}
