//! Scaler observability instruments
//!
//! All instruments are best-effort: a failure to create or register one
//! is logged and the scaler runs without it.

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::warn;

/// Buckets for runner start wall-time, in seconds
const START_DURATION_BUCKETS: &[f64] = &[1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0];

/// Prometheus instruments exposed by the scaler
pub struct ScalerMetrics {
    idle: Option<IntGauge>,
    busy: Option<IntGauge>,
    starts: Option<IntCounter>,
    destroys: Option<IntCounter>,
    jobs_completed: Option<IntCounterVec>,
    scale_events: Option<IntCounterVec>,
    start_duration: Option<Histogram>,
}

impl ScalerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            idle: register_gauge(registry, "hangar_idle_runners", "Idle runners in inventory"),
            busy: register_gauge(registry, "hangar_busy_runners", "Busy runners in inventory"),
            starts: register_counter(
                registry,
                "hangar_runner_starts_total",
                "Runners started since process start",
            ),
            destroys: register_counter(
                registry,
                "hangar_runner_destroys_total",
                "Runners destroyed since process start",
            ),
            jobs_completed: register_counter_vec(
                registry,
                "hangar_jobs_completed_total",
                "Jobs completed, by result",
                &["result"],
            ),
            scale_events: register_counter_vec(
                registry,
                "hangar_scale_events_total",
                "Desired-count reconciliations, by action",
                &["action"],
            ),
            start_duration: register_histogram(
                registry,
                "hangar_start_duration_seconds",
                "Wall time to provision one runner",
            ),
        }
    }

    /// Instruments that record nothing, for tests
    pub fn disabled() -> Self {
        Self {
            idle: None,
            busy: None,
            starts: None,
            destroys: None,
            jobs_completed: None,
            scale_events: None,
            start_duration: None,
        }
    }

    pub fn set_inventory(&self, idle: usize, busy: usize) {
        if let Some(g) = &self.idle {
            g.set(idle as i64);
        }
        if let Some(g) = &self.busy {
            g.set(busy as i64);
        }
    }

    pub fn runner_started(&self, duration_seconds: f64) {
        if let Some(c) = &self.starts {
            c.inc();
        }
        if let Some(h) = &self.start_duration {
            h.observe(duration_seconds);
        }
    }

    pub fn runner_destroyed(&self) {
        if let Some(c) = &self.destroys {
            c.inc();
        }
    }

    pub fn job_completed(&self, result: &str) {
        if let Some(c) = &self.jobs_completed {
            c.with_label_values(&[result]).inc();
        }
    }

    pub fn scale_event(&self, action: &str) {
        if let Some(c) = &self.scale_events {
            c.with_label_values(&[action]).inc();
        }
    }
}

fn register_gauge(registry: &Registry, name: &str, help: &str) -> Option<IntGauge> {
    let gauge = match IntGauge::new(name, help) {
        Ok(g) => g,
        Err(e) => {
            warn!(name, error = %e, "Failed to create gauge");
            return None;
        }
    };
    register(registry, name, Box::new(gauge.clone())).map(|_| gauge)
}

fn register_counter(registry: &Registry, name: &str, help: &str) -> Option<IntCounter> {
    let counter = match IntCounter::new(name, help) {
        Ok(c) => c,
        Err(e) => {
            warn!(name, error = %e, "Failed to create counter");
            return None;
        }
    };
    register(registry, name, Box::new(counter.clone())).map(|_| counter)
}

fn register_counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Option<IntCounterVec> {
    let counter = match IntCounterVec::new(Opts::new(name, help), labels) {
        Ok(c) => c,
        Err(e) => {
            warn!(name, error = %e, "Failed to create counter");
            return None;
        }
    };
    register(registry, name, Box::new(counter.clone())).map(|_| counter)
}

fn register_histogram(registry: &Registry, name: &str, help: &str) -> Option<Histogram> {
    let opts = HistogramOpts::new(name, help).buckets(START_DURATION_BUCKETS.to_vec());
    let histogram = match Histogram::with_opts(opts) {
        Ok(h) => h,
        Err(e) => {
            warn!(name, error = %e, "Failed to create histogram");
            return None;
        }
    };
    register(registry, name, Box::new(histogram.clone())).map(|_| histogram)
}

fn register(
    registry: &Registry,
    name: &str,
    collector: Box<dyn prometheus::core::Collector>,
) -> Option<()> {
    match registry.register(collector) {
        Ok(()) => Some(()),
        Err(e) => {
            warn!(name, error = %e, "Failed to register instrument");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments_register_once() {
        let registry = Registry::new();
        let metrics = ScalerMetrics::new(&registry);

        metrics.set_inventory(2, 3);
        metrics.runner_started(1.5);
        metrics.runner_destroyed();
        metrics.job_completed("succeeded");
        metrics.scale_event("up");

        let families = registry.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"hangar_idle_runners"));
        assert!(names.contains(&"hangar_start_duration_seconds"));
    }

    #[test]
    fn test_duplicate_registration_degrades() {
        let registry = Registry::new();
        let _first = ScalerMetrics::new(&registry);

        // Same names again: registration fails, instruments are dropped,
        // recording is a no-op
        let second = ScalerMetrics::new(&registry);
        second.runner_started(0.1);
        second.scale_event("none");
    }
}
