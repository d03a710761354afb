use anyhow::Result;
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter, MeterProvider, UpDownCounter},
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use std::time::Duration;
use tracing::info;

use crate::errors::FailureKind;

const METER_NAME: &str = "airwave";

/// Metrics instruments shared by the queue, the dispatcher and the planner
#[derive(Clone)]
pub struct AppObservability {
    pub meter: Meter,

    // Queue
    pub jobs_submitted: Counter<u64>,
    pub jobs_rejected: Counter<u64>,
    pub jobs_rescored: Counter<u64>,

    // Dispatch
    pub jobs_dispatched: Counter<u64>,
    pub jobs_ready: Counter<u64>,
    pub jobs_failed: Counter<u64>,
    pub jobs_requeued: Counter<u64>,
    pub in_flight: UpDownCounter<i64>,
    pub generation_duration: Histogram<f64>,

    // Resilience
    pub provider_attempts: Counter<u64>,
    pub breaker_rejections: Counter<u64>,
    pub breaker_trips: Counter<u64>,
    pub fallback_invocations: Counter<u64>,

    // Broadcast
    pub slots_scheduled: Counter<u64>,
    pub jobs_played: Counter<u64>,
    pub diversity_relaxations: Counter<u64>,
}

impl AppObservability {
    /// Install an SDK meter provider as the global one and build the instruments
    pub fn new(service_name: &str) -> Result<Self> {
        let provider = SdkMeterProvider::builder().build();
        global::set_meter_provider(provider.clone());

        let meter = provider.meter(METER_NAME);

        if let Ok(otlp_endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            info!(
                "OpenTelemetry configured for {}: metrics exporter endpoint {} is not wired, local metrics only",
                service_name, otlp_endpoint
            );
        } else {
            info!(
                "OpenTelemetry configured for {}: local metrics only (OTLP endpoint not configured)",
                service_name
            );
        }

        Ok(Self::build_with_instruments(meter))
    }

    /// Instruments bound to whatever global provider is installed.
    ///
    /// Without a prior call to [`AppObservability::new`] this is the no-op
    /// provider, which is what tests and library users without metrics get.
    pub fn from_global() -> Self {
        Self::build_with_instruments(global::meter(METER_NAME))
    }

    fn build_with_instruments(meter: Meter) -> Self {
        let jobs_submitted = meter
            .u64_counter("jobs_submitted_total")
            .with_description("Submissions accepted into the pending pool")
            .build();
        let jobs_rejected = meter
            .u64_counter("jobs_rejected_total")
            .with_description("Submissions rejected at intake")
            .build();
        let jobs_rescored = meter
            .u64_counter("jobs_rescored_total")
            .with_description("Pending jobs whose score was refreshed")
            .build();

        let jobs_dispatched = meter
            .u64_counter("jobs_dispatched_total")
            .with_description("Jobs handed to a worker")
            .build();
        let jobs_ready = meter
            .u64_counter("jobs_ready_total")
            .with_description("Jobs generated successfully")
            .build();
        let jobs_failed = meter
            .u64_counter("jobs_failed_total")
            .with_description("Jobs that ended terminally failed")
            .build();
        let jobs_requeued = meter
            .u64_counter("jobs_requeued_total")
            .with_description("Jobs returned to the pending pool after an open circuit")
            .build();
        let in_flight = meter
            .i64_up_down_counter("jobs_in_flight")
            .with_description("Jobs currently held by a worker")
            .build();
        let generation_duration = meter
            .f64_histogram("generation_duration_seconds")
            .with_description("Wall time of a resilient invocation including retries")
            .build();

        let provider_attempts = meter
            .u64_counter("provider_attempts_total")
            .with_description("Attempts made against the generation provider")
            .build();
        let breaker_rejections = meter
            .u64_counter("breaker_rejections_total")
            .with_description("Attempts refused by an open circuit")
            .build();
        let breaker_trips = meter
            .u64_counter("breaker_trips_total")
            .with_description("Transitions of a circuit breaker to open")
            .build();
        let fallback_invocations = meter
            .u64_counter("fallback_invocations_total")
            .with_description("Calls routed to the fallback provider")
            .build();

        let slots_scheduled = meter
            .u64_counter("slots_scheduled_total")
            .with_description("Broadcast slots placed on the timeline")
            .build();
        let jobs_played = meter
            .u64_counter("jobs_played_total")
            .with_description("Slots reported played by the playback executor")
            .build();
        let diversity_relaxations = meter
            .u64_counter("diversity_relaxations_total")
            .with_description("Slots filled without a category-diverse candidate")
            .build();

        Self {
            meter,
            jobs_submitted,
            jobs_rejected,
            jobs_rescored,
            jobs_dispatched,
            jobs_ready,
            jobs_failed,
            jobs_requeued,
            in_flight,
            generation_duration,
            provider_attempts,
            breaker_rejections,
            breaker_trips,
            fallback_invocations,
            slots_scheduled,
            jobs_played,
            diversity_relaxations,
        }
    }

    pub fn record_failure(&self, kind: FailureKind) {
        self.jobs_failed
            .add(1, &[KeyValue::new("kind", kind.as_ref().to_string())]);
    }

    pub fn record_generation(&self, elapsed: Duration, attempts: u32, outcome: &'static str) {
        self.generation_duration
            .record(elapsed.as_secs_f64(), &[KeyValue::new("outcome", outcome)]);
        self.provider_attempts.add(u64::from(attempts), &[]);
    }
}

impl std::fmt::Debug for AppObservability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppObservability").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instruments_accept_records_without_provider() {
        let observability = AppObservability::from_global();
        observability.jobs_submitted.add(1, &[]);
        observability.record_failure(FailureKind::Timeout);
        observability.record_generation(Duration::from_millis(250), 2, "ready");
        observability.in_flight.add(-1, &[]);
    }
}
