//! Stage worker pools: elastic concurrency, crash restart with backoff, and
//! quarantine after retry exhaustion (C8, spec §4.8).
//!
//! A pool owns a single shared receiver for its stage and runs up to
//! `max` concurrent pulls against it, gated by a [`tokio::sync::Semaphore`]
//! whose permit count the supervisor raises or lowers toward a sampled
//! target. This mirrors the teacher's consumer supervisor loop
//! (`dashflow-streaming/src/consumer/mod.rs`) in spirit — sample, compare to
//! water marks, adjust — without literally spawning and killing OS tasks on
//! every tick.

use crate::error::Result;
use crate::ingestion::queue::{ChangeItem, QueueConfig};
use crate::telemetry::Telemetry;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::{instrument, warn};

/// Min/max worker counts for one stage (spec §4.8 `workers` config block).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WorkerPoolConfig {
    pub min: usize,
    pub max: usize,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { min: 2, max: 8 }
    }
}

/// Exponential backoff applied to a failing item before it is quarantined.
#[derive(Debug, Clone, Copy)]
pub struct RestartPolicy {
    pub base: Duration,
    pub cap: Duration,
    pub max_retries: usize,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            cap: Duration::from_secs(3),
            max_retries: 10,
        }
    }
}

impl RestartPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let cap_ms = self.cap.as_millis() as u64;
        ExponentialBackoff::from_millis(self.base.as_millis().max(1) as u64)
            .max_delay(Duration::from_millis(cap_ms))
            .map(jitter)
            .take(self.max_retries)
    }
}

/// Outcome of processing one item through a worker pool.
pub enum WorkOutcome<T> {
    Processed,
    Quarantined { item: ChangeItem<T>, error: Result<()> },
}

/// A stage's concurrency controller: a shared receiver plus a semaphore the
/// supervisor resizes toward a sampled target.
pub struct WorkerPool<T> {
    name: &'static str,
    receiver: Arc<Mutex<mpsc::Receiver<ChangeItem<T>>>>,
    permits: Arc<Semaphore>,
    target: Arc<AtomicUsize>,
    config: WorkerPoolConfig,
    telemetry: Telemetry,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new(
        name: &'static str,
        receiver: mpsc::Receiver<ChangeItem<T>>,
        config: WorkerPoolConfig,
        telemetry: Telemetry,
    ) -> Self {
        let target = config.min.max(1);
        Self {
            name,
            receiver: Arc::new(Mutex::new(receiver)),
            permits: Arc::new(Semaphore::new(target)),
            target: Arc::new(AtomicUsize::new(target)),
            config,
            telemetry,
        }
    }

    /// Drains the pool's receiver, running `process` with up to the current
    /// permit count of concurrency, retrying transient failures with
    /// exponential backoff up to `restart.max_retries` before quarantining.
    ///
    /// Returns when the channel closes (producer side dropped).
    #[instrument(skip(self, process, restart, on_outcome))]
    pub async fn run<F, Fut>(
        &self,
        process: F,
        restart: RestartPolicy,
        on_outcome: impl Fn(WorkOutcome<T>) + Send + Sync + 'static,
    ) where
        F: Fn(ChangeItem<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send,
        T: Clone,
    {
        let process = Arc::new(process);
        let on_outcome = Arc::new(on_outcome);
        let inflight = self
            .telemetry
            .gauge("graphkit_ingestion_stage_inflight", "in-flight items per stage", &["stage"]);
        loop {
            let item = {
                let mut guard = self.receiver.lock().await;
                guard.recv().await
            };
            let Some(item) = item else { break };

            let permit = Arc::clone(&self.permits).acquire_owned().await;
            let Ok(permit) = permit else { break };
            inflight.with_label_values(&[self.name]).inc();

            let process = Arc::clone(&process);
            let on_outcome = Arc::clone(&on_outcome);
            let name = self.name;
            let inflight = inflight.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let fingerprint = item.fingerprint.clone();
                let payload = item.payload.clone();
                let attempt_process = process.clone();
                let result = Retry::spawn(restart.strategy(), move || {
                    let process = attempt_process.clone();
                    let item = ChangeItem {
                        fingerprint: fingerprint.clone(),
                        payload: payload.clone(),
                    };
                    async move { process(item).await }
                })
                .await;
                inflight.with_label_values(&[name]).dec();
                match result {
                    Ok(()) => on_outcome(WorkOutcome::Processed),
                    Err(error) => {
                        warn!(stage = name, "worker exhausted retry budget, quarantining item");
                        on_outcome(WorkOutcome::Quarantined { item, error: Err(error) });
                    }
                }
            });
        }
    }

    /// Applies a new target concurrency, clamped to `[min, max]`, adjusting
    /// the semaphore's available permits up or down to match (spec §4.8
    /// supervisor: "depth > highWater -> scale up by 1 per stage; depth <
    /// lowWater and utilization < 30% for N samples -> scale down").
    pub fn rescale(&self, desired: usize) {
        let desired = desired.clamp(self.config.min.max(1), self.config.max.max(self.config.min).max(1));
        let previous = self.target.swap(desired, Ordering::SeqCst);
        if desired > previous {
            self.permits.add_permits(desired - previous);
        } else if desired < previous {
            let to_remove = previous - desired;
            // forget() drops permits without returning them, shrinking the
            // pool's effective concurrency without disturbing in-flight work.
            if let Ok(permits) = self.permits.try_acquire_many(to_remove as u32) {
                permits.forget();
            }
        }
    }

    pub fn current_target(&self) -> usize {
        self.target.load(Ordering::SeqCst)
    }

    pub fn queue_config_hint(&self) -> WorkerPoolConfig {
        self.config
    }
}

/// A stage's scale decision, computed from queue depth samples (spec §4.8).
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalingSample {
    pub depth: usize,
    pub utilization: f64,
}

/// Decide a new target size from the latest sample and water marks. Pure
/// function so the supervisor loop (in `pipeline.rs`) stays testable without
/// a live queue.
pub fn decide_target(
    current: usize,
    sample: ScalingSample,
    queue: QueueConfig,
    low_utilization_threshold: f64,
    consecutive_low_samples: u32,
    scale_down_after: u32,
) -> usize {
    if sample.depth >= queue.high_water {
        current + 1
    } else if sample.depth < queue.low_water
        && sample.utilization < low_utilization_threshold
        && consecutive_low_samples >= scale_down_after
        && current > 0
    {
        current.saturating_sub(1)
    } else {
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingestion::queue::{PartitionedQueue, QueueConfig};

    #[test]
    fn decide_target_scales_up_past_high_water() {
        let queue = QueueConfig::default();
        let next = decide_target(2, ScalingSample { depth: 9_000, utilization: 0.9 }, queue, 0.3, 0, 3);
        assert_eq!(next, 3);
    }

    #[test]
    fn decide_target_scales_down_after_sustained_idle() {
        let queue = QueueConfig::default();
        let next = decide_target(4, ScalingSample { depth: 100, utilization: 0.1 }, queue, 0.3, 3, 3);
        assert_eq!(next, 3);
    }

    #[test]
    fn decide_target_holds_steady_without_sustained_signal() {
        let queue = QueueConfig::default();
        let next = decide_target(4, ScalingSample { depth: 100, utilization: 0.1 }, queue, 0.3, 1, 3);
        assert_eq!(next, 4);
    }

    #[tokio::test]
    async fn run_processes_items_until_channel_closes() {
        let (queue, mut rx) = PartitionedQueue::<u32>::new(QueueConfig {
            partitions: 1,
            max_depth: 8,
            high_water: 6,
            low_water: 1,
        });
        queue.try_enqueue("a".to_string(), 1).unwrap();
        queue.try_enqueue("b".to_string(), 2).unwrap();
        let receiver = rx.remove(0);
        let pool = WorkerPool::new("parser", receiver, WorkerPoolConfig { min: 1, max: 2 }, Telemetry::new());
        let processed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let processed_clone = Arc::clone(&processed);
        drop(queue);
        pool.run(
            move |_item| {
                let processed = Arc::clone(&processed_clone);
                async move {
                    processed.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            RestartPolicy::default(),
            |_outcome| {},
        )
        .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(processed.load(Ordering::SeqCst), 2);
    }
}
