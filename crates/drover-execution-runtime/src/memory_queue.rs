//! In-memory lease queue.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use drover_kernel::error::KernelError;
use drover_kernel::identity::TenantId;

use crate::models::{ElementOutcome, LeaseRecord, LeasedElement, QueueElement};
use crate::queue::LeaseQueue;

struct Slot {
    element: QueueElement,
    lease: Option<LeaseRecord>,
}

#[derive(Default)]
struct TenantQueue {
    next_seq: u64,
    /// seq -> slot; seq order is FIFO order.
    slots: BTreeMap<u64, Slot>,
    /// element id -> seq
    index: HashMap<String, u64>,
}

impl TenantQueue {
    fn remove(&mut self, element_id: &str) -> bool {
        match self.index.remove(element_id) {
            Some(seq) => self.slots.remove(&seq).is_some(),
            None => false,
        }
    }
}

/// Lease queue held in process memory; one mutex guards every tenant queue.
#[derive(Default)]
pub struct InMemoryLeaseQueue {
    queues: Mutex<HashMap<TenantId, TenantQueue>>,
}

impl InMemoryLeaseQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<TenantId, TenantQueue>>, KernelError> {
        self.queues
            .lock()
            .map_err(|_| KernelError::Queue("in-memory lease queue lock poisoned".to_string()))
    }
}

impl LeaseQueue for InMemoryLeaseQueue {
    fn add(
        &self,
        tenant_id: &str,
        element: QueueElement,
        _now: DateTime<Utc>,
    ) -> Result<bool, KernelError> {
        let mut queues = self.lock()?;
        let queue = queues.entry(tenant_id.to_string()).or_default();
        if queue.index.contains_key(&element.id) {
            return Ok(false);
        }
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.index.insert(element.id.clone(), seq);
        queue.slots.insert(
            seq,
            Slot {
                element,
                lease: None,
            },
        );
        Ok(true)
    }

    fn take(
        &self,
        tenant_id: &str,
        consumer_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<LeasedElement>, KernelError> {
        let mut queues = self.lock()?;
        let Some(queue) = queues.get_mut(tenant_id) else {
            return Ok(None);
        };
        let Some(slot) = queue.slots.values_mut().find(|s| s.lease.is_none()) else {
            return Ok(None);
        };
        let lease = LeaseRecord {
            tenant_id: tenant_id.to_string(),
            element_id: slot.element.id.clone(),
            consumer_id: consumer_id.to_string(),
            lease_start: now,
        };
        slot.lease = Some(lease.clone());
        Ok(Some(LeasedElement {
            element: slot.element.clone(),
            lease,
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
        let mut queues = self.lock()?;
        let Some(queue) = queues.get_mut(tenant_id) else {
            return Ok(false);
        };
        let Some(slot) = queue
            .index
            .get(element_id)
            .and_then(|seq| queue.slots.get_mut(seq))
        else {
            return Ok(false);
        };
        let held = slot
            .lease
            .as_ref()
            .is_some_and(|lease| lease.consumer_id == consumer_id);
        if !held {
            log::debug!(
                "lease_progress_ignored tenant_id={} element_id={} consumer_id={}",
                tenant_id,
                element_id,
                consumer_id
            );
            return Ok(false);
        }
        if outcome.removes_element() {
            queue.remove(element_id);
            if queue.slots.is_empty() {
                queues.remove(tenant_id);
            }
        } else {
            slot.lease = None;
        }
        log::debug!(
            "lease_progress tenant_id={} element_id={} outcome={:?} message={}",
            tenant_id,
            element_id,
            outcome,
            message
        );
        Ok(true)
    }

    fn remove(&self, tenant_id: &str, element_id: &str) -> Result<bool, KernelError> {
        let mut queues = self.lock()?;
        let Some(queue) = queues.get_mut(tenant_id) else {
            return Ok(false);
        };
        let removed = queue.remove(element_id);
        if queue.slots.is_empty() {
            queues.remove(tenant_id);
        }
        Ok(removed)
    }

    fn remove_all(&self, tenant_id: &str) -> Result<u64, KernelError> {
        let mut queues = self.lock()?;
        Ok(queues
            .remove(tenant_id)
            .map(|queue| queue.slots.len() as u64)
            .unwrap_or(0))
    }

    fn size(&self, tenant_id: &str) -> Result<usize, KernelError> {
        Ok(self
            .lock()?
            .get(tenant_id)
            .map(|queue| queue.slots.len())
            .unwrap_or(0))
    }

    fn get_queued(&self, tenant_id: &str) -> Result<Vec<QueueElement>, KernelError> {
        Ok(self
            .lock()?
            .get(tenant_id)
            .map(|queue| {
                queue
                    .slots
                    .values()
                    .filter(|s| s.lease.is_none())
                    .map(|s| s.element.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_being_consumed(&self, tenant_id: &str) -> Result<Vec<LeasedElement>, KernelError> {
        let queues = self.lock()?;
        let mut leased: Vec<LeasedElement> = queues
            .get(tenant_id)
            .map(|queue| {
                queue
                    .slots
                    .values()
                    .filter_map(|s| {
                        s.lease.as_ref().map(|lease| LeasedElement {
                            element: s.element.clone(),
                            lease: lease.clone(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        leased.sort_by_key(|l| l.lease.lease_start);
        Ok(leased)
    }

    fn tenants(&self) -> Result<Vec<TenantId>, KernelError> {
        let queues = self.lock()?;
        let mut tenants: Vec<TenantId> = queues
            .iter()
            .filter(|(_, queue)| !queue.slots.is_empty())
            .map(|(tenant, _)| tenant.clone())
            .collect();
        tenants.sort();
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use serde_json::json;

    use super::*;

    #[test]
    fn concurrent_takes_never_share_an_element() {
        let queue = Arc::new(InMemoryLeaseQueue::new());
        let now = Utc::now();
        for i in 0..64 {
            queue
                .add("t1", QueueElement::new(format!("e{}", i), json!(i)), now)
                .unwrap();
        }

        let handles: Vec<_> = (0..8)
            .map(|w| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    while let Some(leased) = queue.take("t1", &format!("w{}", w), Utc::now()).unwrap() {
                        taken.push(leased.element.id);
                    }
                    taken
                })
            })
            .collect();

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        let before = all.len();
        all.dedup();
        assert_eq!(before, 64);
        assert_eq!(all.len(), 64);
    }

    #[test]
    fn remove_all_only_touches_one_tenant() {
        let queue = InMemoryLeaseQueue::new();
        let now = Utc::now();
        queue.add("t1", QueueElement::new("a", json!(null)), now).unwrap();
        queue.add("t1", QueueElement::new("b", json!(null)), now).unwrap();
        queue.add("t2", QueueElement::new("a", json!(null)), now).unwrap();
        queue.take("t1", "w1", now).unwrap();

        assert_eq!(queue.remove_all("t1").unwrap(), 2);
        assert_eq!(queue.size("t1").unwrap(), 0);
        assert_eq!(queue.tenants().unwrap(), vec!["t2".to_string()]);
    }

    #[test]
    fn drained_tenants_are_forgotten() {
        let queue = InMemoryLeaseQueue::new();
        let now = Utc::now();
        queue.add("t1", QueueElement::new("a", json!(null)), now).unwrap();
        queue.add("t1", QueueElement::new("b", json!(null)), now).unwrap();
        queue.add("t2", QueueElement::new("c", json!(null)), now).unwrap();

        queue.take("t1", "w1", now).unwrap();
        assert!(queue
            .record_progress("w1", "t1", "a", ElementOutcome::Acked, "done")
            .unwrap());
        assert!(queue.remove("t1", "b").unwrap());
        assert!(queue.remove("t2", "c").unwrap());
        assert!(queue.lock().unwrap().is_empty());

        // a drained tenant queues again from scratch
        assert!(queue.add("t1", QueueElement::new("a", json!(null)), now).unwrap());
        assert_eq!(queue.size("t1").unwrap(), 1);
    }
}
