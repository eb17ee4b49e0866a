//! Metric definitions and text export.

use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};

/// Metrics for one executor instance.
#[derive(Clone)]
pub struct RunMetrics {
    registry: Registry,
    /// Terminal task outcomes, labeled by kind and status.
    tasks_total: CounterVec,
    /// Backend attempts, labeled by kind and attempt status.
    attempts_total: CounterVec,
    /// Evaluation outcomes, labeled by type (single/pairwise) and result.
    evaluations_total: CounterVec,
    /// Launches currently holding a concurrency permit, labeled by kind.
    in_flight: GaugeVec,
    /// Wall time of a task from first launch to terminal state.
    generation_duration: HistogramVec,
    /// Accumulated known cost in dollars.
    cost_usd: Gauge,
}

impl RunMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_total = CounterVec::new(
            Opts::new("docforge_tasks_total", "Generation tasks reaching a terminal state"),
            &["kind", "status"],
        )?;

        let attempts_total = CounterVec::new(
            Opts::new("docforge_attempts_total", "Backend attempts by outcome"),
            &["kind", "outcome"],
        )?;

        let evaluations_total = CounterVec::new(
            Opts::new("docforge_evaluations_total", "Evaluation records by type and result"),
            &["type", "result"],
        )?;

        let in_flight = GaugeVec::new(
            Opts::new("docforge_generation_in_flight", "Generation launches in flight"),
            &["kind"],
        )?;

        let generation_duration = HistogramVec::new(
            HistogramOpts::new(
                "docforge_generation_duration_seconds",
                "Generation task duration in seconds",
            )
            .buckets(vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
            &["kind"],
        )?;

        let cost_usd = Gauge::new("docforge_cost_usd", "Known accumulated cost in dollars")?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(evaluations_total.clone()))?;
        registry.register(Box::new(in_flight.clone()))?;
        registry.register(Box::new(generation_duration.clone()))?;
        registry.register(Box::new(cost_usd.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            attempts_total,
            evaluations_total,
            in_flight,
            generation_duration,
            cost_usd,
        })
    }

    pub fn record_task(&self, kind: &str, status: &str, duration_secs: f64) {
        self.tasks_total.with_label_values(&[kind, status]).inc();
        self.generation_duration
            .with_label_values(&[kind])
            .observe(duration_secs);
    }

    pub fn record_attempt(&self, kind: &str, outcome: &str) {
        self.attempts_total.with_label_values(&[kind, outcome]).inc();
    }

    pub fn record_evaluation(&self, eval_type: &str, result: &str) {
        self.evaluations_total
            .with_label_values(&[eval_type, result])
            .inc();
    }

    pub fn set_in_flight(&self, kind: &str, value: usize) {
        self.in_flight.with_label_values(&[kind]).set(value as f64);
    }

    pub fn add_cost(&self, cost_usd: f64) {
        self.cost_usd.add(cost_usd);
    }

    /// Metrics in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }
        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instances_are_independent() {
        let first = RunMetrics::new().expect("metrics");
        let second = RunMetrics::new().expect("metrics");
        first.record_task("text-transform", "succeeded", 3.0);

        assert!(first
            .export()
            .contains("docforge_tasks_total{kind=\"text-transform\",status=\"succeeded\"} 1"));
        assert!(!second.export().contains("status=\"succeeded\""));
    }

    #[test]
    fn test_export_contains_recorded_series() {
        let metrics = RunMetrics::new().expect("metrics");
        metrics.record_attempt("deep-research", "timed_out");
        metrics.record_evaluation("pairwise", "recorded");
        metrics.set_in_flight("deep-research", 2);
        metrics.add_cost(0.25);

        let text = metrics.export();
        assert!(text.contains("docforge_attempts_total"));
        assert!(text.contains("docforge_evaluations_total{result=\"recorded\",type=\"pairwise\"} 1"));
        assert!(text.contains("docforge_generation_in_flight{kind=\"deep-research\"} 2"));
        assert!(text.contains("docforge_cost_usd 0.25"));
    }
}
