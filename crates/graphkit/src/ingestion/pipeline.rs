//! Ingestion orchestrator (C8, spec §4.8): wires the partitioned queue,
//! per-stage worker pools, and the batch processor together, and owns the
//! cross-cutting concerns worker pools and the batch processor don't: file
//! filtering, per-store circuit breakers, and the bounded error quarantine.

use crate::error::{Error, Result};
use crate::events::{kind, Event, Level};
use crate::ingestion::batch::{
    fingerprint_for, BatchConfig, BatchProcessor, ChangePayload, Stores,
};
use crate::ingestion::queue::{PartitionedQueue, QueueConfig};
use crate::ingestion::workers::{decide_target, RestartPolicy, ScalingSample, WorkOutcome, WorkerPool, WorkerPoolConfig};
use crate::search::glob_to_regex;
use crate::telemetry::Telemetry;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

/// Per-stage worker pool sizing (spec §4.8 `workers` config block).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkersConfig {
    pub parsers: WorkerPoolConfig,
    pub entity_workers: WorkerPoolConfig,
    pub relationship_workers: WorkerPoolConfig,
    pub embedding_workers: WorkerPoolConfig,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            parsers: WorkerPoolConfig { min: 2, max: 8 },
            entity_workers: WorkerPoolConfig { min: 2, max: 8 },
            relationship_workers: WorkerPoolConfig { min: 2, max: 8 },
            embedding_workers: WorkerPoolConfig { min: 1, max: 4 },
        }
    }
}

/// Accept/reject glob lists applied to a change's path before it is admitted
/// to the queue.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileFilters {
    pub accept: Vec<String>,
    pub reject: Vec<String>,
}

impl FileFilters {
    fn admits(&self, path: &str) -> bool {
        let matches = |glob: &str| Regex::new(&glob_to_regex(glob)).map(|re| re.is_match(path)).unwrap_or(false);
        if self.reject.iter().any(|g| matches(g)) {
            return false;
        }
        self.accept.is_empty() || self.accept.iter().any(|g| matches(g))
    }
}

/// Supervisor sampling cadence and scale-down hysteresis (spec §4.8
/// `monitoring` config block plus the supervisor's own timing).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct MonitoringConfig {
    pub metrics_interval: Duration,
    pub health_check_interval: Duration,
    pub scale_down_after_samples: u32,
    pub low_utilization_threshold: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            metrics_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(5),
            scale_down_after_samples: 3,
            low_utilization_threshold: 0.30,
        }
    }
}

/// Full ingestion configuration (spec §4.8 "Config options (enumerated)").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngestionConfig {
    pub queue: QueueConfig,
    pub workers: WorkersConfig,
    pub batching: BatchConfig,
    pub monitoring: MonitoringConfig,
    pub file_filters: FileFilters,
    pub skip_embeddings: bool,
    pub retry_budget: usize,
    pub circuit_error_ratio: f64,
    pub circuit_window: usize,
    pub circuit_cooldown: Duration,
    pub quarantine_capacity: usize,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            workers: WorkersConfig::default(),
            batching: BatchConfig::default(),
            monitoring: MonitoringConfig::default(),
            file_filters: FileFilters::default(),
            skip_embeddings: false,
            retry_budget: 3,
            circuit_error_ratio: 0.5,
            circuit_window: 20,
            circuit_cooldown: Duration::from_secs(30),
            quarantine_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Per-downstream-store circuit breaker (spec §4.8): opens after a
/// configurable error ratio over a sliding window of outcomes; while open,
/// fast-fails with [`Error::CircuitOpen`]; a probe is allowed through after
/// `cooldown` elapses, closing the circuit again on success.
struct CircuitBreaker {
    name: String,
    window: Mutex<VecDeque<bool>>,
    window_size: usize,
    error_ratio: f64,
    cooldown: Duration,
    state: Mutex<CircuitState>,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    fn new(name: impl Into<String>, window_size: usize, error_ratio: f64, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            window: Mutex::new(VecDeque::with_capacity(window_size)),
            window_size,
            error_ratio,
            cooldown,
            state: Mutex::new(CircuitState::Closed),
            opened_at: Mutex::new(None),
        }
    }

    /// `Ok(())` if a call may proceed (closed, or half-open probe); fast
    /// fails with [`Error::CircuitOpen`] while open and within cooldown.
    async fn allow(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let opened_at = *self.opened_at.lock().await;
                if opened_at.is_some_and(|t| t.elapsed() >= self.cooldown) {
                    *state = CircuitState::HalfOpen;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    async fn record(&self, success: bool) {
        let mut window = self.window.lock().await;
        window.push_back(success);
        while window.len() > self.window_size {
            window.pop_front();
        }
        let errors = window.iter().filter(|ok| !**ok).count();
        let ratio = errors as f64 / window.len().max(1) as f64;
        drop(window);

        let mut state = self.state.lock().await;
        match *state {
            CircuitState::HalfOpen => {
                if success {
                    *state = CircuitState::Closed;
                    *self.opened_at.lock().await = None;
                } else {
                    *state = CircuitState::Open;
                    *self.opened_at.lock().await = Some(Instant::now());
                }
            }
            CircuitState::Closed if ratio >= self.error_ratio => {
                *state = CircuitState::Open;
                *self.opened_at.lock().await = Some(Instant::now());
                warn!(store = %self.name, ratio, "circuit breaker opened");
            }
            _ => {}
        }
    }
}

/// One item routed to the error quarantine after its retry budget was
/// exhausted (spec §4.8 "error quarantine (bounded sample, default last
/// 100)"), grounded on the teacher's `DlqMessage` shape
/// (`dashflow-streaming/src/dlq.rs`) trimmed to what this engine needs.
#[derive(Debug, Clone)]
pub struct QuarantinedItem {
    pub fingerprint: String,
    pub kind: &'static str,
    pub error: String,
    pub quarantined_at: chrono::DateTime<chrono::Utc>,
}

struct RingBuffer<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Clone> RingBuffer<T> {
    fn new(capacity: usize) -> Self {
        Self { items: Mutex::new(VecDeque::with_capacity(capacity)), capacity: capacity.max(1) }
    }

    async fn push(&self, item: T) {
        let mut items = self.items.lock().await;
        if items.len() == self.capacity {
            items.pop_front();
        }
        items.push_back(item);
    }

    async fn snapshot(&self) -> Vec<T> {
        self.items.lock().await.iter().cloned().collect()
    }
}

/// Orchestrates the full ingest topology for one process: partitioned queue
/// -> worker pools -> batch processor -> stores.
pub struct IngestionPipeline {
    config: IngestionConfig,
    queue: Arc<PartitionedQueue<ChangePayload>>,
    batch: Arc<BatchProcessor>,
    stores: Stores,
    telemetry: Telemetry,
    entity_circuit: Arc<CircuitBreaker>,
    relationship_circuit: Arc<CircuitBreaker>,
    vector_circuit: Arc<CircuitBreaker>,
    quarantine_buffer: Arc<RingBuffer<QuarantinedItem>>,
    processed_total: AtomicU64,
    restart_attempts: AtomicU32,
}

impl IngestionPipeline {
    pub fn new(config: IngestionConfig, stores: Stores, telemetry: Telemetry) -> (Arc<Self>, Vec<tokio::sync::mpsc::Receiver<crate::ingestion::queue::ChangeItem<ChangePayload>>>) {
        let (queue, receivers) = PartitionedQueue::new(config.queue);
        let pipeline = Arc::new(Self {
            entity_circuit: Arc::new(CircuitBreaker::new(
                "entity",
                config.circuit_window,
                config.circuit_error_ratio,
                config.circuit_cooldown,
            )),
            relationship_circuit: Arc::new(CircuitBreaker::new(
                "relationship",
                config.circuit_window,
                config.circuit_error_ratio,
                config.circuit_cooldown,
            )),
            vector_circuit: Arc::new(CircuitBreaker::new(
                "vector",
                config.circuit_window,
                config.circuit_error_ratio,
                config.circuit_cooldown,
            )),
            quarantine_buffer: Arc::new(RingBuffer::new(config.quarantine_capacity)),
            batch: Arc::new(BatchProcessor::new(config.batching)),
            queue: Arc::new(queue),
            config,
            stores,
            telemetry,
            processed_total: AtomicU64::new(0),
            restart_attempts: AtomicU32::new(0),
        });
        (pipeline, receivers)
    }

    /// Submit one already-parsed draft, honoring file filters and
    /// partition-level backpressure (spec §4.8 `PartitionedQueue`).
    #[instrument(skip(self, payload))]
    pub fn submit(&self, path: Option<&str>, payload: ChangePayload) -> Result<()> {
        if let Some(path) = path {
            if !self.config.file_filters.admits(path) {
                return Ok(());
            }
        }
        let fingerprint = fingerprint_for(&payload);
        self.queue.try_enqueue(fingerprint, payload).map(|_| ())
    }

    /// Spawns the worker pools draining `receivers` (one per queue
    /// partition) and the periodic timeout-flush task. Runs until every
    /// receiver's channel closes.
    pub async fn run(self: Arc<Self>, receivers: Vec<tokio::sync::mpsc::Receiver<crate::ingestion::queue::ChangeItem<ChangePayload>>>) {
        self.telemetry
            .events()
            .publish(Event::new(kind::PIPELINE_STARTED, Level::Info, "ingestion pipeline started"));

        let mut handles = Vec::new();
        let mut pools = Vec::with_capacity(receivers.len());
        for receiver in receivers {
            let pool = Arc::new(WorkerPool::new(
                "parser",
                receiver,
                self.config.workers.parsers,
                self.telemetry.clone(),
            ));
            pools.push(Arc::clone(&pool));
            let pipeline = Arc::clone(&self);
            handles.push(tokio::spawn(async move {
                pipeline.drain_partition(pool).await;
            }));
        }

        let pipeline = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            pipeline.flush_on_timeout_loop().await;
        }));

        let pipeline = Arc::clone(&self);
        handles.push(tokio::spawn(async move {
            pipeline.supervise_parser_pools(pools).await;
        }));

        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Samples each parser pool's partition depth at `monitoring.metricsInterval`
    /// and rescales toward the target the water marks imply (spec §4.8
    /// "A supervisor samples partition depth ... at a fixed interval").
    async fn supervise_parser_pools(self: Arc<Self>, pools: Vec<Arc<WorkerPool<ChangePayload>>>) {
        let mut interval = tokio::time::interval(self.config.monitoring.metrics_interval);
        let mut consecutive_low = vec![0u32; pools.len()];
        loop {
            interval.tick().await;
            for (index, pool) in pools.iter().enumerate() {
                let depth = self.queue.depth(index);
                let target = pool.current_target();
                let utilization = if target == 0 { 0.0 } else { depth as f64 / (target * self.config.queue.max_depth) as f64 };
                let sample = ScalingSample { depth, utilization };
                if depth < self.config.queue.low_water && utilization < self.config.monitoring.low_utilization_threshold {
                    consecutive_low[index] += 1;
                } else {
                    consecutive_low[index] = 0;
                }
                let next = self.scale_decision(target, sample, consecutive_low[index]);
                if next != target {
                    pool.rescale(next);
                    info!(partition = index, from = target, to = next, "rescaled parser pool");
                }
            }
        }
    }

    async fn drain_partition(self: Arc<Self>, pool: Arc<WorkerPool<ChangePayload>>) {
        let pipeline = Arc::clone(&self);
        pool.run(
            move |item| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.stage_and_maybe_flush(item.fingerprint, item.payload).await }
            },
            RestartPolicy { max_retries: self.config.retry_budget, ..RestartPolicy::default() },
            {
                let pipeline = Arc::clone(&self);
                move |outcome| {
                    let pipeline = Arc::clone(&pipeline);
                    if let WorkOutcome::Quarantined { item, error } = outcome {
                        let kind = match &item.payload {
                            ChangePayload::Entity(_) => "entity",
                            ChangePayload::Relationship(_) => "relationship",
                            ChangePayload::Embedding { .. } => "embedding",
                        };
                        let message = match error {
                            Err(e) => e.to_string(),
                            Ok(()) => "unknown error".to_string(),
                        };
                        pipeline.restart_attempts.fetch_add(1, Ordering::Relaxed);
                        tokio::spawn(async move {
                            pipeline
                                .quarantine(QuarantinedItem {
                                    fingerprint: item.fingerprint,
                                    kind,
                                    error: message,
                                    quarantined_at: chrono::Utc::now(),
                                })
                                .await;
                        });
                    }
                }
            },
        )
        .await;
    }

    async fn stage_and_maybe_flush(&self, fingerprint: String, payload: ChangePayload) -> Result<()> {
        if self.config.skip_embeddings {
            if let ChangePayload::Embedding { .. } = &payload {
                return Ok(());
            }
        }
        let should_flush = self.batch.push(fingerprint, payload).await;
        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush_on_timeout_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.batching.timeout);
        loop {
            interval.tick().await;
            if self.batch.is_timed_out().await {
                if let Err(error) = self.flush().await {
                    warn!(%error, "timeout-triggered flush failed");
                }
            }
        }
    }

    #[instrument(skip(self))]
    async fn flush(&self) -> Result<()> {
        self.entity_circuit.allow().await?;
        let outcome = self.batch.flush(&self.stores).await;
        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(error) => {
                self.entity_circuit.record(false).await;
                self.telemetry.events().publish(Event::new(
                    kind::PIPELINE_ERROR,
                    Level::Error,
                    error.to_string(),
                ));
                return Err(error);
            }
        };

        self.entity_circuit.record(outcome.entities_written > 0 || outcome.failed.iter().all(|f| f.kind != "entity")).await;
        self.relationship_circuit
            .record(outcome.relationships_written > 0 || outcome.failed.iter().all(|f| f.kind != "relationship"))
            .await;
        self.vector_circuit
            .record(outcome.embeddings_written > 0 || outcome.failed.iter().all(|f| f.kind != "embedding"))
            .await;

        self.processed_total.fetch_add(
            (outcome.entities_written + outcome.relationships_written + outcome.embeddings_written) as u64,
            Ordering::Relaxed,
        );

        for failure in &outcome.failed {
            self.quarantine(QuarantinedItem {
                fingerprint: failure.fingerprint.clone(),
                kind: failure.kind,
                error: failure.error.clone(),
                quarantined_at: chrono::Utc::now(),
            })
            .await;
        }

        self.telemetry.events().publish(Event::new(
            kind::BATCH_COMPLETED,
            Level::Info,
            format!(
                "entities={} relationships={} embeddings={} failed={}",
                outcome.entities_written,
                outcome.relationships_written,
                outcome.embeddings_written,
                outcome.failed.len()
            ),
        ));
        info!(
            entities = outcome.entities_written,
            relationships = outcome.relationships_written,
            embeddings = outcome.embeddings_written,
            failed = outcome.failed.len(),
            "batch flushed"
        );
        Ok(())
    }

    async fn quarantine(&self, item: QuarantinedItem) {
        self.telemetry.events().publish(
            Event::new(kind::WORKER_ERROR, Level::Warn, item.error.clone())
                .with_data(serde_json::json!({ "fingerprint": item.fingerprint, "kind": item.kind })),
        );
        self.quarantine_buffer.push(item).await;
    }

    /// Bounded sample of recently quarantined items (spec §4.8).
    pub async fn quarantined(&self) -> Vec<QuarantinedItem> {
        self.quarantine_buffer.snapshot().await
    }

    pub fn processed_total(&self) -> u64 {
        self.processed_total.load(Ordering::Relaxed)
    }

    /// Count of worker restart attempts after a retry-budget exhaustion
    /// (spec §4.8 worker crash/restart accounting).
    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts.load(Ordering::Relaxed)
    }

    /// Current partition depths, for a telemetry/health surface.
    pub fn partition_depths(&self) -> Vec<usize> {
        (0..self.queue.partitions()).map(|p| self.queue.depth(p)).collect()
    }

    /// Pure scaling decision for one stage given the latest sample; callers
    /// (a supervisor task, or a test) feed this into [`WorkerPool::rescale`].
    pub fn scale_decision(&self, current: usize, sample: ScalingSample, consecutive_low_samples: u32) -> usize {
        decide_target(
            current,
            sample,
            self.config.queue,
            self.config.monitoring.low_utilization_threshold,
            consecutive_low_samples,
            self.config.monitoring.scale_down_after_samples,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_filters_reject_takes_precedence_over_accept() {
        let filters = FileFilters {
            accept: vec!["**/*.rs".to_string()],
            reject: vec!["**/target/**".to_string()],
        };
        assert!(filters.admits("src/main.rs"));
        assert!(!filters.admits("target/debug/main.rs"));
    }

    #[tokio::test]
    async fn circuit_opens_after_error_ratio_exceeded() {
        let breaker = CircuitBreaker::new("entity", 4, 0.5, Duration::from_secs(60));
        breaker.record(false).await;
        breaker.record(false).await;
        breaker.record(true).await;
        let allowed = breaker.allow().await;
        assert!(matches!(allowed, Err(Error::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn circuit_half_opens_after_cooldown_and_closes_on_success() {
        let breaker = CircuitBreaker::new("entity", 4, 0.5, Duration::from_millis(10));
        breaker.record(false).await;
        breaker.record(false).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(breaker.allow().await.is_ok());
        breaker.record(true).await;
        assert!(breaker.allow().await.is_ok());
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest_past_capacity() {
        let buffer: RingBuffer<u32> = RingBuffer::new(2);
        buffer.push(1).await;
        buffer.push(2).await;
        buffer.push(3).await;
        assert_eq!(buffer.snapshot().await, vec![2, 3]);
    }
}
