use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::Duration;

pub mod server;

pub struct Metrics {
    pub deliveries_total: CounterVec,
    pub acks_total: Counter,
    pub nacks_total: CounterVec,
    pub republished_total: CounterVec,
    pub connection_attempts_total: Counter,
    pub reconnects_total: Counter,
    pub panics_total: Counter,
    pub processing_duration_seconds: HistogramVec,
    pub active_consumers: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let deliveries_total = CounterVec::new(
            Opts::new(
                "request_consumer_deliveries_total",
                "Total number of deliveries settled, by processing outcome",
            ),
            &["queue", "outcome"],
        )?;

        let acks_total = Counter::new(
            "request_consumer_acks_total",
            "Total number of deliveries acknowledged",
        )?;

        let nacks_total = CounterVec::new(
            Opts::new(
                "request_consumer_nacks_total",
                "Total number of deliveries negatively acknowledged",
            ),
            &["requeue"],
        )?;

        let republished_total = CounterVec::new(
            Opts::new(
                "request_consumer_republished_total",
                "Total number of republish attempts",
            ),
            &["result"],
        )?;

        let connection_attempts_total = Counter::new(
            "request_consumer_connection_attempts_total",
            "Total number of broker connection attempts",
        )?;

        let reconnects_total = Counter::new(
            "request_consumer_reconnects_total",
            "Total number of reconnects after an unexpected close",
        )?;

        let panics_total = Counter::new(
            "request_consumer_panics_total",
            "Total number of fatal conditions escalated to the panic flag",
        )?;

        let processing_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "request_consumer_processing_duration_seconds",
                "Time taken by the processing task of a delivery",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 30.0]),
            &["outcome"],
        )?;

        let active_consumers = Gauge::new(
            "request_consumer_active_consumers",
            "Number of active queue subscriptions",
        )?;

        registry.register(Box::new(deliveries_total.clone()))?;
        registry.register(Box::new(acks_total.clone()))?;
        registry.register(Box::new(nacks_total.clone()))?;
        registry.register(Box::new(republished_total.clone()))?;
        registry.register(Box::new(connection_attempts_total.clone()))?;
        registry.register(Box::new(reconnects_total.clone()))?;
        registry.register(Box::new(panics_total.clone()))?;
        registry.register(Box::new(processing_duration_seconds.clone()))?;
        registry.register(Box::new(active_consumers.clone()))?;

        Ok(Arc::new(Self {
            deliveries_total,
            acks_total,
            nacks_total,
            republished_total,
            connection_attempts_total,
            reconnects_total,
            panics_total,
            processing_duration_seconds,
            active_consumers,
            registry,
        }))
    }

    pub fn observe_processing(&self, outcome: &str, elapsed: Duration) {
        self.processing_duration_seconds
            .with_label_values(&[outcome])
            .observe(elapsed.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_metrics_registered() {
        let metrics = Metrics::new().unwrap();
        metrics.acks_total.inc();
        metrics
            .nacks_total
            .with_label_values(&["false"])
            .inc();
        metrics.observe_processing("success", Duration::from_millis(20));

        let names: Vec<String> = metrics
            .registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        assert!(names.contains(&"request_consumer_acks_total".to_string()));
        assert!(names.contains(&"request_consumer_nacks_total".to_string()));
        assert!(names.contains(&"request_consumer_processing_duration_seconds".to_string()));
        assert!(names.contains(&"request_consumer_active_consumers".to_string()));
    }

    #[test]
    fn test_independent_registries() {
        assert!(Metrics::new().is_ok());
        assert!(Metrics::new().is_ok());
    }
}
