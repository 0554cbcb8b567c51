//! Security telemetry: Prometheus metrics, security log and alert dispatch
//!
//! Every component records through one shared [`SecurityTelemetry`] handle so
//! that a single registry can be exported and the health snapshot can read
//! consistent tallies.

use parking_lot::Mutex;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::error::{AuthzError, Result};
use crate::invariants::Severity;
use crate::trust::{TrustLevel, TrustTransition};
use crate::types::{AuthResult, Privilege, PrivilegeSet};

const NAMESPACE: &str = "authz";

/// Alert delivery channel
pub trait AlertDispatcher: Send + Sync {
    fn send_alert(&self, severity: Severity, title: &str, message: &str);
}

/// Dispatcher that writes alerts to the security log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAlertDispatcher;

impl AlertDispatcher for TracingAlertDispatcher {
    fn send_alert(&self, severity: Severity, title: &str, message: &str) {
        match severity {
            Severity::Critical => error!(target: "security", %severity, title, message, "ALERT"),
            Severity::High => warn!(target: "security", %severity, title, message, "ALERT"),
            _ => info!(target: "security", %severity, title, message, "ALERT"),
        }
    }
}

/// Alert captured by [`RecordingAlertDispatcher`]
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub severity: Severity,
    pub title: String,
    pub message: String,
}

/// Dispatcher that keeps every alert in memory
#[derive(Debug, Default)]
pub struct RecordingAlertDispatcher {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count_at(&self, severity: Severity) -> usize {
        self.alerts
            .lock()
            .iter()
            .filter(|alert| alert.severity == severity)
            .count()
    }
}

impl AlertDispatcher for RecordingAlertDispatcher {
    fn send_alert(&self, severity: Severity, title: &str, message: &str) {
        self.alerts.lock().push(Alert {
            severity,
            title: title.to_string(),
            message: message.to_string(),
        });
    }
}

/// Prometheus metrics for the authorization core
pub struct SecurityMetrics {
    pub decisions: IntCounterVec,
    pub trust_blocked: IntCounterVec,
    pub cache_fallback: IntCounterVec,
    pub timeout_denied: IntCounterVec,
    pub invariant_checks: IntCounterVec,
    pub invariant_violations: IntCounterVec,
    pub token_rejections: IntCounterVec,
    pub audit_writes: IntCounterVec,
    pub validation_samples: IntCounterVec,
    pub trust_transitions: IntCounterVec,
    pub privilege_narrowed: IntCounter,
    pub escalations_blocked: IntCounter,

    /// Current trust level rank (4=NORMAL .. 1=NO_TRUST)
    pub trust_level: IntGauge,

    pub trust_level_duration: HistogramVec,
    pub decision_latency: Histogram,

    registry: Registry,
}

impl SecurityMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let decisions = counter_vec(
            &registry,
            "decisions_total",
            "Authorization decisions",
            &["outcome", "source", "trust_level"],
        )?;
        let trust_blocked = counter_vec(
            &registry,
            "trust_blocked_total",
            "Requests denied because the operation risk exceeds the trust level",
            &["trust_level", "operation"],
        )?;
        let cache_fallback = counter_vec(
            &registry,
            "cache_fallback_total",
            "Decisions served from the grant cache",
            &["trust_level"],
        )?;
        let timeout_denied = counter_vec(
            &registry,
            "timeout_denied_total",
            "Requests denied after a backend timeout",
            &["trust_level"],
        )?;
        let invariant_checks = counter_vec(
            &registry,
            "invariant_checks_total",
            "Security invariant evaluations",
            &["invariant", "passed"],
        )?;
        let invariant_violations = counter_vec(
            &registry,
            "invariant_violations_total",
            "Security invariant violations",
            &["invariant", "severity"],
        )?;
        let token_rejections = counter_vec(
            &registry,
            "token_rejections_total",
            "Retry tokens rejected during validation",
            &["reason"],
        )?;
        let audit_writes = counter_vec(
            &registry,
            "audit_writes_total",
            "Audit record writes per sink",
            &["sink", "outcome"],
        )?;
        let validation_samples = counter_vec(
            &registry,
            "validation_samples_total",
            "Shadow validation samples against the authoritative source",
            &["correct", "source"],
        )?;
        let trust_transitions = counter_vec(
            &registry,
            "trust_transitions_total",
            "Applied trust level transitions",
            &["from", "to"],
        )?;

        let privilege_narrowed = IntCounter::with_opts(
            Opts::new(
                "retry_privilege_narrowed_total",
                "Retries whose effective privileges shrank",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(privilege_narrowed.clone()))?;

        let escalations_blocked = IntCounter::with_opts(
            Opts::new(
                "escalations_blocked_total",
                "Retries where the source offered privileges beyond the original grant",
            )
            .namespace(NAMESPACE),
        )?;
        registry.register(Box::new(escalations_blocked.clone()))?;

        let trust_level = IntGauge::with_opts(
            Opts::new("trust_level", "Current trust level rank").namespace(NAMESPACE),
        )?;
        trust_level.set(TrustLevel::Normal.rank() as i64);
        registry.register(Box::new(trust_level.clone()))?;

        let trust_level_duration = HistogramVec::new(
            HistogramOpts::new(
                "trust_level_duration_seconds",
                "Time spent at a trust level before leaving it",
            )
            .namespace(NAMESPACE)
            .buckets(vec![1.0, 10.0, 30.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]),
            &["level"],
        )?;
        registry.register(Box::new(trust_level_duration.clone()))?;

        let decision_latency = Histogram::with_opts(
            HistogramOpts::new("decision_latency_seconds", "Authorization decision latency")
                .namespace(NAMESPACE)
                .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 2.5]),
        )?;
        registry.register(Box::new(decision_latency.clone()))?;

        Ok(Self {
            decisions,
            trust_blocked,
            cache_fallback,
            timeout_denied,
            invariant_checks,
            invariant_violations,
            token_rejections,
            audit_writes,
            validation_samples,
            trust_transitions,
            privilege_narrowed,
            escalations_blocked,
            trust_level,
            trust_level_duration,
            decision_latency,
            registry,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in the Prometheus text exposition format
    pub fn export(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| AuthzError::Metrics(e.to_string()))
    }
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> Result<IntCounterVec> {
    let counter = IntCounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

/// Shared observability handle
pub struct SecurityTelemetry {
    metrics: SecurityMetrics,
    alerts: Arc<dyn AlertDispatcher>,
    violations: AtomicU64,
    escalations_blocked: AtomicU64,
    validation_samples: AtomicU64,
    validation_correct: AtomicU64,
}

impl SecurityTelemetry {
    pub fn new(alerts: Arc<dyn AlertDispatcher>) -> Result<Self> {
        Ok(Self {
            metrics: SecurityMetrics::new()?,
            alerts,
            violations: AtomicU64::new(0),
            escalations_blocked: AtomicU64::new(0),
            validation_samples: AtomicU64::new(0),
            validation_correct: AtomicU64::new(0),
        })
    }

    /// Telemetry that logs alerts through `tracing`
    pub fn with_tracing_alerts() -> Result<Self> {
        Self::new(Arc::new(TracingAlertDispatcher))
    }

    pub fn metrics(&self) -> &SecurityMetrics {
        &self.metrics
    }

    pub fn alert(&self, severity: Severity, title: &str, message: &str) {
        self.alerts.send_alert(severity, title, message);
    }

    pub fn record_transition(&self, transition: &TrustTransition) {
        let from = transition.from.as_str();
        let to = transition.to.as_str();

        self.metrics
            .trust_transitions
            .with_label_values(&[from, to])
            .inc();
        self.metrics.trust_level.set(transition.to.rank() as i64);
        self.metrics
            .trust_level_duration
            .with_label_values(&[from])
            .observe(transition.time_at_previous.as_secs_f64());

        if transition.is_downgrade() {
            warn!(
                target: "security",
                from,
                to,
                error_rate = transition.metrics.error_rate,
                latency_p99_ms = transition.metrics.latency_p99_ms,
                cache_staleness_secs = transition.metrics.cache_staleness_secs,
                "Trust level downgraded"
            );

            let severity = match transition.to {
                TrustLevel::NoTrust => Some(Severity::Critical),
                TrustLevel::Constrained => Some(Severity::High),
                _ => None,
            };
            if let Some(severity) = severity {
                self.alert(
                    severity,
                    &format!("Trust level degraded to {}", to),
                    &format!(
                        "Authorization trust dropped from {} to {} (error_rate={:.2}%, latency_p99={:.0}ms, staleness={:.0}s)",
                        from,
                        to,
                        transition.metrics.error_rate,
                        transition.metrics.latency_p99_ms,
                        transition.metrics.cache_staleness_secs,
                    ),
                );
            }
        } else {
            info!(target: "security", from, to, "Trust level restored");
        }
    }

    pub fn record_trust_blocked(&self, level: TrustLevel, operation: Privilege) {
        self.metrics
            .trust_blocked
            .with_label_values(&[level.as_str(), operation.as_str()])
            .inc();
    }

    pub fn record_cache_fallback(&self, level: TrustLevel) {
        self.metrics
            .cache_fallback
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn record_timeout_denied(&self, level: TrustLevel) {
        self.metrics
            .timeout_denied
            .with_label_values(&[level.as_str()])
            .inc();
    }

    pub fn record_decision(&self, result: &AuthResult, level: TrustLevel, latency: Duration) {
        let outcome = if result.allowed { "allow" } else { "deny" };
        let source = result.source.map(|s| s.as_str()).unwrap_or("none");

        self.metrics
            .decisions
            .with_label_values(&[outcome, source, level.as_str()])
            .inc();
        self.metrics.decision_latency.observe(latency.as_secs_f64());
    }

    pub fn record_invariant_check(&self, invariant: &str, passed: bool) {
        self.metrics
            .invariant_checks
            .with_label_values(&[invariant, if passed { "true" } else { "false" }])
            .inc();
    }

    pub fn record_violation(&self, invariant: &str, severity: Severity) {
        self.violations.fetch_add(1, Ordering::Relaxed);
        self.metrics
            .invariant_violations
            .with_label_values(&[invariant, severity.as_str()])
            .inc();
    }

    pub fn record_token_rejection(&self, reason: &str) {
        self.metrics
            .token_rejections
            .with_label_values(&[reason])
            .inc();
        warn!(target: "security", reason, "Retry token rejected");
    }

    pub fn record_privilege_narrowed(&self, token_id: &str, removed: &PrivilegeSet) {
        self.metrics.privilege_narrowed.inc();
        warn!(
            target: "security",
            token_id,
            removed = %removed,
            "Privileges narrowed during retry"
        );
    }

    pub fn record_escalation_blocked(&self, token_id: &str, offered: &PrivilegeSet) {
        self.escalations_blocked.fetch_add(1, Ordering::Relaxed);
        self.metrics.escalations_blocked.inc();
        warn!(
            target: "security",
            token_id,
            offered = %offered,
            "Privilege escalation attempt blocked during retry"
        );
    }

    pub fn record_audit_write(&self, sink: &str, ok: bool) {
        self.metrics
            .audit_writes
            .with_label_values(&[sink, if ok { "success" } else { "failure" }])
            .inc();
    }

    pub fn record_validation(&self, correct: bool, source: &str) {
        self.validation_samples.fetch_add(1, Ordering::Relaxed);
        if correct {
            self.validation_correct.fetch_add(1, Ordering::Relaxed);
        }
        self.metrics
            .validation_samples
            .with_label_values(&[if correct { "true" } else { "false" }, source])
            .inc();
        debug!(correct, source, "Recorded shadow validation sample");
    }

    pub fn violation_count(&self) -> u64 {
        self.violations.load(Ordering::Relaxed)
    }

    pub fn escalations_blocked(&self) -> u64 {
        self.escalations_blocked.load(Ordering::Relaxed)
    }

    /// Fraction of sampled decisions that agreed with the authoritative source.
    /// 1.0 before any sample has been taken.
    pub fn correctness_rate(&self) -> f64 {
        let samples = self.validation_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return 1.0;
        }
        self.validation_correct.load(Ordering::Relaxed) as f64 / samples as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trust::TrustMetrics;

    fn transition(from: TrustLevel, to: TrustLevel) -> TrustTransition {
        TrustTransition {
            from,
            to,
            at: chrono::Utc::now(),
            time_at_previous: Duration::from_secs(45),
            metrics: TrustMetrics::new(60.0, 50.0, 0.0),
        }
    }

    #[test]
    fn test_downgrade_alerts_by_target_level() {
        let alerts = Arc::new(RecordingAlertDispatcher::new());
        let telemetry = SecurityTelemetry::new(alerts.clone()).unwrap();

        telemetry.record_transition(&transition(TrustLevel::Normal, TrustLevel::Degraded));
        assert!(alerts.alerts().is_empty());

        telemetry.record_transition(&transition(TrustLevel::Degraded, TrustLevel::Constrained));
        telemetry.record_transition(&transition(TrustLevel::Constrained, TrustLevel::NoTrust));
        assert_eq!(alerts.count_at(Severity::High), 1);
        assert_eq!(alerts.count_at(Severity::Critical), 1);

        // Upgrades never alert
        telemetry.record_transition(&transition(TrustLevel::NoTrust, TrustLevel::Normal));
        assert_eq!(alerts.alerts().len(), 2);
        assert_eq!(telemetry.metrics().trust_level.get(), 4);
    }

    #[test]
    fn test_correctness_rate() {
        let telemetry = SecurityTelemetry::with_tracing_alerts().unwrap();
        assert_eq!(telemetry.correctness_rate(), 1.0);

        telemetry.record_validation(true, "fresh");
        telemetry.record_validation(true, "cache");
        telemetry.record_validation(true, "fresh");
        telemetry.record_validation(false, "cache");
        assert!((telemetry.correctness_rate() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_export_contains_namespaced_metrics() {
        let telemetry = SecurityTelemetry::with_tracing_alerts().unwrap();
        telemetry.record_trust_blocked(TrustLevel::Constrained, Privilege::Write);
        telemetry.record_violation("privilege_bounds", Severity::Critical);

        let text = telemetry.metrics().export().unwrap();
        assert!(text.contains("authz_trust_blocked_total"));
        assert!(text.contains("authz_invariant_violations_total"));
        assert_eq!(telemetry.violation_count(), 1);
    }
}
