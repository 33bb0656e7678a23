//! Drover execution runtime: the per-tenant lease queue that hands tasks to
//! remote workers.
//!
//! Backends: [InMemoryLeaseQueue] always; `SqliteLeaseQueue` with the
//! `sqlite-persistence` feature; `PostgresLeaseQueue` with `kernel-postgres`.
//! [QueueStorageConfig] picks one from the environment.

pub mod backend_config;
pub mod lease;
pub mod memory_queue;
pub mod models;
pub mod observability;
#[cfg(feature = "kernel-postgres")]
pub mod postgres_lease_queue;
pub mod queue;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_lease_queue;

pub use backend_config::{QueueStorageBackend, QueueStorageConfig};
pub use lease::{stale_leases, LeaseConfig, WorkerLease};
pub use memory_queue::InMemoryLeaseQueue;
pub use models::{ElementOutcome, LeaseRecord, LeasedElement, QueueElement};
pub use observability::QueueMetrics;
#[cfg(feature = "kernel-postgres")]
pub use postgres_lease_queue::PostgresLeaseQueue;
pub use queue::LeaseQueue;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_lease_queue::SqliteLeaseQueue;
