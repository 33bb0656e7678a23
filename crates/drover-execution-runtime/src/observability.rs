//! Queue depth metrics for operational visibility.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use drover_kernel::identity::TenantId;

/// Depth of one tenant queue at the time it was read.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QueueMetrics {
    pub tenant_id: TenantId,
    /// Elements waiting for a consumer.
    pub queued: usize,
    /// Elements currently leased.
    pub in_progress: usize,
}

impl QueueMetrics {
    pub fn new(tenant_id: impl Into<TenantId>, queued: usize, in_progress: usize) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            queued,
            in_progress,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.in_progress
    }

    /// Sums per-tenant metrics, e.g. for a fleet-wide view.
    pub fn aggregate<'a>(
        tenant_id: impl Into<TenantId>,
        metrics: impl IntoIterator<Item = &'a QueueMetrics>,
    ) -> Self {
        metrics
            .into_iter()
            .fold(Self::new(tenant_id, 0, 0), |mut acc, m| {
                acc.queued += m.queued;
                acc.in_progress += m.in_progress;
                acc
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_sums_depths() {
        let per_tenant = vec![QueueMetrics::new("t1", 2, 1), QueueMetrics::new("t2", 0, 4)];
        let all = QueueMetrics::aggregate("*", &per_tenant);
        assert_eq!(all.queued, 2);
        assert_eq!(all.in_progress, 5);
        assert_eq!(all.total(), 7);
    }

    #[test]
    fn metrics_schema_names_fields() {
        let schema = schemars::schema_for!(QueueMetrics);
        let json = serde_json::to_value(&schema).unwrap();
        let props = json["properties"].as_object().unwrap();
        assert!(props.contains_key("queued"));
        assert!(props.contains_key("in_progress"));
    }
}
