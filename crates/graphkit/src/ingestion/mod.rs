//! Ingestion pipeline (C8, spec §4.8): partitioned queue, elastic worker
//! pools, dependency-ordered batch flush, and the orchestrator tying them
//! together with circuit breakers and a bounded error quarantine.

pub mod batch;
pub mod pipeline;
pub mod queue;
pub mod workers;

pub use batch::{BatchConfig, BatchOutcome, ChangePayload, Stores};
pub use pipeline::{FileFilters, IngestionConfig, IngestionPipeline, MonitoringConfig, QuarantinedItem, WorkersConfig};
pub use queue::{ChangeItem, PartitionedQueue, QueueConfig};
pub use workers::{RestartPolicy, ScalingSample, WorkerPool, WorkerPoolConfig};
