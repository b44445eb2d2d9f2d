use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::Instant;

pub struct Metrics {
    registry: Registry,

    // Module metrics
    pub loaded_modules: IntGauge,
    pub quarantined_total: IntCounter,
    pub reloads_total: IntCounter,

    // Dispatch metrics
    pub dispatch_total: IntCounter,
    pub dispatch_failed: IntCounter,
    pub dispatch_timeouts: IntCounter,
    pub dispatch_duration: Histogram,
    pub active_streams: IntGauge,

    // Filter metrics
    pub filter_invocations_total: IntCounter,
    pub filter_failures_total: IntCounter,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("metric creation failed")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("metric creation failed")
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let loaded_modules = gauge(
            "pipeline_gateway_loaded_modules",
            "Number of currently loaded plugin modules",
        );
        let quarantined_total = counter(
            "pipeline_gateway_quarantined_total",
            "Total number of plugin files moved to quarantine",
        );
        let reloads_total = counter(
            "pipeline_gateway_reloads_total",
            "Total number of plugin directory scans",
        );

        let dispatch_total = counter(
            "pipeline_gateway_dispatch_total",
            "Total number of completion dispatches",
        );
        let dispatch_failed = counter(
            "pipeline_gateway_dispatch_failed",
            "Total number of failed completion dispatches",
        );
        let dispatch_timeouts = counter(
            "pipeline_gateway_dispatch_timeouts_total",
            "Total number of completion dispatches that hit the deadline",
        );
        let dispatch_duration = Histogram::with_opts(HistogramOpts::new(
            "pipeline_gateway_dispatch_duration_seconds",
            "Time until a plugin produced its outcome, in seconds",
        ))
        .expect("metric creation failed");
        let active_streams = gauge(
            "pipeline_gateway_active_streams",
            "Number of completion streams currently being pulled",
        );

        let filter_invocations_total = counter(
            "pipeline_gateway_filter_invocations_total",
            "Total number of inlet/outlet hook invocations",
        );
        let filter_failures_total = counter(
            "pipeline_gateway_filter_failures_total",
            "Total number of inlet/outlet hooks that raised",
        );

        registry
            .register(Box::new(loaded_modules.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(quarantined_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(reloads_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_failed.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_timeouts.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(dispatch_duration.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(active_streams.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(filter_invocations_total.clone()))
            .expect("metric registration failed");
        registry
            .register(Box::new(filter_failures_total.clone()))
            .expect("metric registration failed");

        Self {
            registry,
            loaded_modules,
            quarantined_total,
            reloads_total,
            dispatch_total,
            dispatch_failed,
            dispatch_timeouts,
            dispatch_duration,
            active_streams,
            filter_invocations_total,
            filter_failures_total,
        }
    }

    pub fn set_loaded_modules(&self, count: usize) {
        self.loaded_modules.set(count as i64);
    }

    pub fn record_quarantine(&self) {
        self.quarantined_total.inc();
    }

    pub fn record_reload(&self) {
        self.reloads_total.inc();
    }

    pub fn record_dispatch_timeout(&self) {
        self.dispatch_timeouts.inc();
    }

    pub fn record_filter(&self, success: bool) {
        self.filter_invocations_total.inc();
        if !success {
            self.filter_failures_total.inc();
        }
    }

    pub fn stream_started(&self) {
        self.active_streams.inc();
    }

    pub fn stream_finished(&self) {
        self.active_streams.dec();
    }

    pub fn gather_metrics(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        if let Err(e) = TextEncoder::new().encode(&self.gather_metrics(), &mut buffer) {
            tracing::warn!(error = %e, "Failed to encode metrics");
        }
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

/// Times one dispatch from start until the outcome is known
pub struct DispatchTimer {
    start: Instant,
    metrics: Arc<Metrics>,
}

impl DispatchTimer {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        metrics.dispatch_total.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn finish(self) {
        self.metrics
            .dispatch_duration
            .observe(self.start.elapsed().as_secs_f64());
    }

    pub fn fail(self) {
        self.metrics
            .dispatch_duration
            .observe(self.start.elapsed().as_secs_f64());
        self.metrics.dispatch_failed.inc();
    }
}
