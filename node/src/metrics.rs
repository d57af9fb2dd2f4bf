//! Prometheus metrics for the saga node.
//!
//! [`SagaMetrics`] owns a dedicated [`Registry`] that an exporter can encode
//! into the Prometheus text exposition format.

use prometheus::{
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry, HistogramOpts,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use saga_types::{EnvelopeStatus, EventStatus, EventType};

pub struct SagaMetrics {
    pub registry: Registry,

    // ── Counters ────────────────────────────────────────────────────────
    /// Handler outcomes, by event type and recorded status.
    pub dispatch_outcomes: IntCounterVec,
    /// Envelope transitions, by the status entered.
    pub envelope_transitions: IntCounterVec,
    /// Blocks accepted by the checkpointer.
    pub blocks_delivered: IntCounter,
    /// Times the stream consumer was restarted after a failure.
    pub stream_reconnects: IntCounter,
    /// Dispatch events re-fired by the sweeper.
    pub events_refired: IntCounter,

    // ── Gauges ──────────────────────────────────────────────────────────
    pub checkpoint_height: IntGauge,

    // ── Histograms ──────────────────────────────────────────────────────
    /// Handler latency in milliseconds, by event type.
    pub handler_latency_ms: HistogramVec,
}

impl SagaMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let dispatch_outcomes = register_int_counter_vec_with_registry!(
            Opts::new("saga_dispatch_outcomes_total", "Handler outcomes by event type"),
            &["event_type", "status"],
            registry
        )?;

        let envelope_transitions = register_int_counter_vec_with_registry!(
            Opts::new("saga_envelope_transitions_total", "Envelope status transitions"),
            &["status"],
            registry
        )?;

        let blocks_delivered = register_int_counter_with_registry!(
            Opts::new("saga_blocks_delivered_total", "Blocks accepted by the checkpointer"),
            registry
        )?;

        let stream_reconnects = register_int_counter_with_registry!(
            Opts::new("saga_stream_reconnects_total", "Block stream restarts"),
            registry
        )?;

        let events_refired = register_int_counter_with_registry!(
            Opts::new("saga_events_refired_total", "Dispatch events re-fired by the sweeper"),
            registry
        )?;

        let checkpoint_height = register_int_gauge_with_registry!(
            Opts::new("saga_checkpoint_height", "Last checkpointed block height"),
            registry
        )?;

        // Exponential buckets covering 1 ms to ~16 s.
        let handler_latency_ms = register_histogram_vec_with_registry!(
            HistogramOpts::new("saga_handler_latency_ms", "Handler latency in milliseconds")
                .buckets(prometheus::exponential_buckets(1.0, 2.0, 15)?),
            &["event_type"],
            registry
        )?;

        Ok(Self {
            registry,
            dispatch_outcomes,
            envelope_transitions,
            blocks_delivered,
            stream_reconnects,
            events_refired,
            checkpoint_height,
            handler_latency_ms,
        })
    }

    pub fn record_outcome(&self, event_type: EventType, status: EventStatus, elapsed_ms: f64) {
        self.dispatch_outcomes
            .with_label_values(&[event_type.as_str(), status.as_str()])
            .inc();
        self.handler_latency_ms
            .with_label_values(&[event_type.as_str()])
            .observe(elapsed_ms);
    }

    pub fn record_transition(&self, status: EnvelopeStatus) {
        self.envelope_transitions
            .with_label_values(&[status.as_str()])
            .inc();
    }

    /// Everything in the registry, in the Prometheus text format.
    pub fn encode_text(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_are_labelled() {
        let metrics = SagaMetrics::new().unwrap();
        metrics.record_outcome(EventType::EnvelopeFragment, EventStatus::Complete, 3.0);
        metrics.record_outcome(EventType::EnvelopeFragment, EventStatus::Complete, 5.0);
        metrics.record_transition(EnvelopeStatus::Fragment);
        assert_eq!(
            metrics
                .dispatch_outcomes
                .with_label_values(&["ENVELOPE_FRAGMENT", "COMPLETE"])
                .get(),
            2
        );
        assert_eq!(
            metrics
                .envelope_transitions
                .with_label_values(&["FRAGMENT"])
                .get(),
            1
        );
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn text_export_names_every_family() {
        let metrics = SagaMetrics::new().unwrap();
        metrics.checkpoint_height.set(42);
        let text = metrics.encode_text().unwrap();
        assert!(text.contains("saga_checkpoint_height 42"));
        assert!(text.contains("saga_blocks_delivered_total"));
    }
}
