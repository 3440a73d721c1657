use std::sync::{Arc, Mutex};

use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EventOutcomeLabels {
    outcome: EventOutcome,
}

/// What the reconciler did with a zone event.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum EventOutcome {
    /// Failed validation and was dropped.
    Invalid,
    /// Zone creation transition, logged only.
    PreInstall,
    Ignored,
    Load,
    RestartCheck,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ControlLabels {
    action: String,
    result: ControlResult,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
enum ControlResult {
    Success,
    Error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ErrorTypeLabels {
    error_type: String,
}

// ---------------------------------------------------------------------------
// MetricsRegistry
// ---------------------------------------------------------------------------

/// Prometheus metrics registry for vmadmd.
///
/// All methods are cheap (atomic operations) and safe to call from any async context.
/// The struct is `Clone + Send + Sync` via internal `Arc`.
#[derive(Clone)]
pub struct MetricsRegistry {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    registry: Mutex<Registry>,
    events_total: Family<EventOutcomeLabels, Counter>,
    vm_loads_total: Counter,
    restarts_scheduled_total: Counter,
    display_sessions: Gauge,
    control_total: Family<ControlLabels, Counter>,
    control_duration_seconds: Histogram,
    errors_total: Family<ErrorTypeLabels, Counter>,
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let events_total = Family::<EventOutcomeLabels, Counter>::default();
        registry.register(
            "vmadmd_zone_events",
            "Zone transition events by reconciler outcome",
            events_total.clone(),
        );

        let vm_loads_total = Counter::default();
        registry.register("vmadmd_vm_loads", "VM records loaded from the store", vm_loads_total.clone());

        let restarts_scheduled_total = Counter::default();
        registry.register(
            "vmadmd_restarts_scheduled",
            "Restarts scheduled by restart policies",
            restarts_scheduled_total.clone(),
        );

        let display_sessions = Gauge::default();
        registry.register(
            "vmadmd_display_sessions",
            "VMs with an active remote display session",
            display_sessions.clone(),
        );

        let control_total = Family::<ControlLabels, Counter>::default();
        registry.register(
            "vmadmd_control_requests",
            "Control surface requests by action and result",
            control_total.clone(),
        );

        // Control duration: buckets from 0.01s to ~2.5s (exponential)
        let control_duration_seconds = Histogram::new(exponential_buckets(0.01, 2.0, 8));
        registry.register(
            "vmadmd_control_duration_seconds",
            "Control surface request duration in seconds",
            control_duration_seconds.clone(),
        );

        let errors_total = Family::<ErrorTypeLabels, Counter>::default();
        registry.register("vmadmd_errors", "Total errors by type", errors_total.clone());

        Self {
            inner: Arc::new(MetricsInner {
                registry: Mutex::new(registry),
                events_total,
                vm_loads_total,
                restarts_scheduled_total,
                display_sessions,
                control_total,
                control_duration_seconds,
                errors_total,
            }),
        }
    }

    pub fn record_event(&self, outcome: EventOutcome) {
        self.inner
            .events_total
            .get_or_create(&EventOutcomeLabels { outcome })
            .inc();
    }

    pub fn record_load(&self) {
        self.inner.vm_loads_total.inc();
    }

    pub fn record_restart_scheduled(&self) {
        self.inner.restarts_scheduled_total.inc();
    }

    pub fn set_display_sessions(&self, count: usize) {
        self.inner.display_sessions.set(count as i64);
    }

    /// Record a control surface request completion.
    pub fn record_control(&self, action: &str, duration: std::time::Duration, ok: bool) {
        self.inner.control_duration_seconds.observe(duration.as_secs_f64());
        let result = if ok { ControlResult::Success } else { ControlResult::Error };
        self.inner
            .control_total
            .get_or_create(&ControlLabels {
                action: action.to_string(),
                result,
            })
            .inc();
    }

    /// Increment the error counter for a given error type.
    pub fn record_error(&self, error_type: &str) {
        self.inner
            .errors_total
            .get_or_create(&ErrorTypeLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    /// Encode all metrics in OpenMetrics text format.
    pub fn encode_metrics(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        let registry = self.inner.registry.lock().unwrap_or_else(|e| e.into_inner());
        encode(&mut buf, &registry)?;
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_registry() {
        let text = MetricsRegistry::new().encode_metrics().unwrap();
        assert!(text.contains("vmadmd_zone_events"));
        assert!(text.contains("vmadmd_vm_loads"));
        assert!(text.contains("vmadmd_restarts_scheduled"));
        assert!(text.contains("vmadmd_display_sessions"));
        assert!(text.contains("vmadmd_control_duration_seconds"));
        assert!(text.contains("vmadmd_errors"));
    }

    #[test]
    fn test_record_event_outcomes() {
        let reg = MetricsRegistry::new();
        reg.record_event(EventOutcome::Load);
        reg.record_event(EventOutcome::Invalid);
        let text = reg.encode_metrics().unwrap();
        assert!(text.contains("Load"));
        assert!(text.contains("Invalid"));
    }

    #[test]
    fn test_record_control() {
        let reg = MetricsRegistry::new();
        reg.record_control("stop", std::time::Duration::from_millis(30), true);
        reg.record_control("reset", std::time::Duration::from_millis(30), false);
        let text = reg.encode_metrics().unwrap();
        assert!(text.contains("action=\"stop\""));
        assert!(text.contains("Success"));
        assert!(text.contains("Error"));
    }

    #[test]
    fn test_display_gauge() {
        let reg = MetricsRegistry::new();
        reg.set_display_sessions(3);
        let text = reg.encode_metrics().unwrap();
        assert!(text.contains("vmadmd_display_sessions 3"));
    }

    #[test]
    fn test_clone_is_shared() {
        let reg1 = MetricsRegistry::new();
        let reg2 = reg1.clone();
        reg1.record_error("qmp_connect");
        assert!(reg2.encode_metrics().unwrap().contains("qmp_connect"));
    }
}
