//! Metrics, health, and structured events emitted by every component (C11).
//!
//! The counter/gauge/histogram registration helpers mirror the teacher's
//! `dashflow-streaming/src/metrics_utils.rs`: a process-wide cache keyed by
//! metric name, so re-registering the same name from multiple call sites
//! returns the existing collector instead of panicking (the upstream
//! `prometheus::register_*!` macros panic on duplicate registration).

use crate::events::{Event, EventBus};
use dashmap::DashMap;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static COUNTER_VECS: LazyLock<DashMap<String, CounterVec>> = LazyLock::new(DashMap::new);
static GAUGE_VECS: LazyLock<DashMap<String, GaugeVec>> = LazyLock::new(DashMap::new);
static HISTOGRAM_VECS: LazyLock<DashMap<String, HistogramVec>> = LazyLock::new(DashMap::new);

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> CounterVec {
    if let Some(existing) = COUNTER_VECS.get(name) {
        return existing.clone();
    }
    let metric = CounterVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|_| CounterVec::new(Opts::new(format!("{name}_invalid"), help), labels).unwrap());
    let _ = registry.register(Box::new(metric.clone()));
    COUNTER_VECS.insert(name.to_string(), metric.clone());
    metric
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
    if let Some(existing) = GAUGE_VECS.get(name) {
        return existing.clone();
    }
    let metric = GaugeVec::new(Opts::new(name, help), labels)
        .unwrap_or_else(|_| GaugeVec::new(Opts::new(format!("{name}_invalid"), help), labels).unwrap());
    let _ = registry.register(Box::new(metric.clone()));
    GAUGE_VECS.insert(name.to_string(), metric.clone());
    metric
}

fn histogram_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    buckets: Vec<f64>,
    labels: &[&str],
) -> HistogramVec {
    if let Some(existing) = HISTOGRAM_VECS.get(name) {
        return existing.clone();
    }
    let metric = HistogramVec::new(
        HistogramOpts::new(name, help).buckets(buckets.clone()),
        labels,
    )
    .unwrap_or_else(|_| {
        HistogramVec::new(HistogramOpts::new(format!("{name}_invalid"), help).buckets(buckets), labels).unwrap()
    });
    let _ = registry.register(Box::new(metric.clone()));
    HISTOGRAM_VECS.insert(name.to_string(), metric.clone());
    metric
}

/// Readiness status of one component, as surfaced by a health endpoint
/// (spec §4.11).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Healthy,
    Degraded,
    Unhealthy,
}

/// One component's health entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: Status,
    pub detail: Option<String>,
}

/// Aggregate health across every reporting component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthReport {
    pub components: Vec<ComponentHealth>,
}

impl HealthReport {
    /// Overall status: unhealthy if any component is, else degraded if any
    /// is degraded, else healthy.
    pub fn overall(&self) -> Status {
        if self.components.iter().any(|c| c.status == Status::Unhealthy) {
            Status::Unhealthy
        } else if self.components.iter().any(|c| c.status == Status::Degraded) {
            Status::Degraded
        } else {
            Status::Healthy
        }
    }
}

/// The metrics/health/events façade every component is constructed with.
#[derive(Clone)]
pub struct Telemetry {
    registry: Registry,
    bus: EventBus,
    health: std::sync::Arc<DashMap<String, ComponentHealth>>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            registry: Registry::new(),
            bus: EventBus::default(),
            health: std::sync::Arc::new(DashMap::new()),
        }
    }

    /// Shared event bus; components publish and consumers subscribe here.
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, event: Event) {
        self.bus.publish(event);
    }

    /// Fetch (or lazily register) a named counter vector.
    pub fn counter(&self, name: &str, help: &str, labels: &[&str]) -> CounterVec {
        counter_vec(&self.registry, name, help, labels)
    }

    /// Fetch (or lazily register) a named gauge vector.
    pub fn gauge(&self, name: &str, help: &str, labels: &[&str]) -> GaugeVec {
        gauge_vec(&self.registry, name, help, labels)
    }

    /// Fetch (or lazily register) a named histogram vector.
    pub fn histogram(&self, name: &str, help: &str, buckets: Vec<f64>, labels: &[&str]) -> HistogramVec {
        histogram_vec(&self.registry, name, help, buckets, labels)
    }

    /// The backing prometheus registry, for an operator to expose over
    /// `/metrics` (wiring that HTTP surface is out of scope for the core).
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Report (or update) one component's readiness.
    pub fn report_health(&self, name: impl Into<String>, status: Status, detail: Option<String>) {
        let name = name.into();
        self.health.insert(
            name.clone(),
            ComponentHealth { name, status, detail },
        );
    }

    /// Aggregate every reported component's readiness.
    pub fn health(&self) -> HealthReport {
        let mut components: Vec<ComponentHealth> =
            self.health.iter().map(|entry| entry.value().clone()).collect();
        components.sort_by(|a, b| a.name.cmp(&b.name));
        HealthReport { components }
    }
}
