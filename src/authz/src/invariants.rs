//! Security invariants evaluated over every tentative decision
//!
//! An invariant is a plain record of a predicate, a severity and a message
//! function. The checker iterates the registered list uniformly and always
//! evaluates all of them, so one check yields the complete violation set.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{AuthzError, Result};
use crate::telemetry::SecurityTelemetry;
use crate::trust::TrustLevel;
use crate::types::{Privilege, PrivilegeSet};

/// Invariant severity; determines the block/alert/log response
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maximum token age per trust level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessLimits {
    pub normal: Duration,
    pub degraded: Duration,
    pub constrained: Duration,
    pub no_trust: Duration,
}

impl Default for FreshnessLimits {
    fn default() -> Self {
        Self {
            normal: Duration::from_secs(3600),
            degraded: Duration::from_secs(1800),
            constrained: Duration::from_secs(300),
            no_trust: Duration::ZERO,
        }
    }
}

impl FreshnessLimits {
    pub fn max_age(&self, level: TrustLevel) -> Duration {
        match level {
            TrustLevel::Normal => self.normal,
            TrustLevel::Degraded => self.degraded,
            TrustLevel::Constrained => self.constrained,
            TrustLevel::NoTrust => self.no_trust,
        }
    }
}

/// Everything an invariant may inspect about one decision
#[derive(Debug, Clone)]
pub struct InvariantContext {
    pub subject: String,
    pub resource: String,
    pub operation: Privilege,

    /// Privileges the tentative decision grants
    pub granted_privileges: PrivilegeSet,

    /// Privileges the authoritative source reports now
    pub current_privileges: PrivilegeSet,

    /// Privileges bound into the token at attempt 0
    pub original_privileges: PrivilegeSet,

    pub trust_level: TrustLevel,
    pub allowed_privileges: PrivilegeSet,

    /// Age of the grant backing the decision
    pub token_age: Duration,
    pub max_token_age: Duration,

    pub attempt: u32,
}

/// A named safety property with its severity
#[derive(Clone)]
pub struct SecurityInvariant {
    pub name: &'static str,
    pub severity: Severity,
    check: fn(&InvariantContext) -> bool,
    message: fn(&InvariantContext) -> String,
}

impl fmt::Debug for SecurityInvariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityInvariant")
            .field("name", &self.name)
            .field("severity", &self.severity)
            .finish()
    }
}

impl SecurityInvariant {
    pub fn new(
        name: &'static str,
        severity: Severity,
        check: fn(&InvariantContext) -> bool,
        message: fn(&InvariantContext) -> String,
    ) -> Self {
        Self {
            name,
            severity,
            check,
            message,
        }
    }

    pub fn holds(&self, ctx: &InvariantContext) -> bool {
        (self.check)(ctx)
    }

    pub fn violation_message(&self, ctx: &InvariantContext) -> String {
        (self.message)(ctx)
    }

    /// Granted privileges never exceed what the trust level allows
    pub fn privilege_bounds() -> Self {
        Self::new(
            "privilege_bounds",
            Severity::Critical,
            |ctx| ctx.granted_privileges.is_subset(&ctx.allowed_privileges),
            |ctx| {
                format!(
                    "Privileges {} exceed those allowed at {}: {}",
                    ctx.granted_privileges.difference(&ctx.allowed_privileges),
                    ctx.trust_level,
                    ctx.allowed_privileges
                )
            },
        )
    }

    /// The backing grant is not older than the level permits
    pub fn temporal_freshness() -> Self {
        Self::new(
            "temporal_freshness",
            Severity::High,
            |ctx| ctx.token_age <= ctx.max_token_age,
            |ctx| {
                format!(
                    "Grant age {:.1}s exceeds {:.1}s allowed at {}",
                    ctx.token_age.as_secs_f64(),
                    ctx.max_token_age.as_secs_f64(),
                    ctx.trust_level
                )
            },
        )
    }

    /// Retries never observe privileges beyond the original grant
    pub fn monotonic_retry_privileges() -> Self {
        Self::new(
            "monotonic_retry_privileges",
            Severity::Critical,
            |ctx| ctx.attempt == 0 || ctx.current_privileges.is_subset(&ctx.original_privileges),
            |ctx| {
                format!(
                    "Retry attempt {} escalated privileges by {}",
                    ctx.attempt,
                    ctx.current_privileges.difference(&ctx.original_privileges)
                )
            },
        )
    }

    /// The fixed catalog every checker starts with
    pub fn catalog() -> Vec<Self> {
        vec![
            Self::privilege_bounds(),
            Self::temporal_freshness(),
            Self::monotonic_retry_privileges(),
        ]
    }
}

/// One failed invariant
#[derive(Debug, Clone, PartialEq)]
pub struct Violation {
    pub invariant: &'static str,
    pub severity: Severity,
    pub message: String,
}

/// Result of evaluating every invariant
#[derive(Debug, Clone, Default)]
pub struct InvariantReport {
    pub checked: usize,
    pub violations: Vec<Violation>,
}

impl InvariantReport {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.violations.iter().map(|v| v.severity).max()
    }

    pub fn is_blocking(&self) -> bool {
        self.max_severity() == Some(Severity::Critical)
    }

    pub fn messages(&self) -> Vec<String> {
        self.violations.iter().map(|v| v.message.clone()).collect()
    }
}

/// Evaluates the registered invariants and applies the severity policy:
/// CRITICAL blocks, HIGH alerts, MEDIUM and LOW are recorded only.
pub struct InvariantChecker {
    invariants: Vec<SecurityInvariant>,
    telemetry: Arc<SecurityTelemetry>,
}

impl InvariantChecker {
    pub fn new(telemetry: Arc<SecurityTelemetry>) -> Self {
        Self {
            invariants: Vec::new(),
            telemetry,
        }
    }

    pub fn with_default_catalog(telemetry: Arc<SecurityTelemetry>) -> Self {
        let mut checker = Self::new(telemetry);
        for invariant in SecurityInvariant::catalog() {
            checker.register(invariant);
        }
        checker
    }

    pub fn register(&mut self, invariant: SecurityInvariant) {
        self.invariants.push(invariant);
    }

    pub fn invariants(&self) -> &[SecurityInvariant] {
        &self.invariants
    }

    /// Evaluate every invariant; never short-circuits
    pub fn evaluate(&self, ctx: &InvariantContext) -> InvariantReport {
        let mut report = InvariantReport {
            checked: self.invariants.len(),
            violations: Vec::new(),
        };

        for invariant in &self.invariants {
            let passed = invariant.holds(ctx);
            self.telemetry.record_invariant_check(invariant.name, passed);
            if passed {
                continue;
            }

            let message = invariant.violation_message(ctx);
            self.telemetry.record_violation(invariant.name, invariant.severity);
            self.respond(invariant, ctx, &message);

            report.violations.push(Violation {
                invariant: invariant.name,
                severity: invariant.severity,
                message,
            });
        }

        report
    }

    /// Evaluate every invariant and fail if any critical one was violated
    pub fn check_all(&self, ctx: &InvariantContext) -> Result<InvariantReport> {
        let report = self.evaluate(ctx);
        if report.is_blocking() {
            return Err(AuthzError::SecurityInvariantViolation {
                severity: Severity::Critical,
                violations: report.messages(),
            });
        }
        Ok(report)
    }

    fn respond(&self, invariant: &SecurityInvariant, ctx: &InvariantContext, message: &str) {
        match invariant.severity {
            Severity::Critical => {
                error!(
                    target: "security",
                    invariant = invariant.name,
                    subject = %ctx.subject,
                    resource = %ctx.resource,
                    operation = %ctx.operation,
                    trust_level = %ctx.trust_level,
                    attempt = ctx.attempt,
                    "{}",
                    message
                );
                self.telemetry.alert(
                    Severity::Critical,
                    &format!("Security invariant violated: {}", invariant.name),
                    message,
                );
            }
            Severity::High => {
                warn!(
                    target: "security",
                    invariant = invariant.name,
                    subject = %ctx.subject,
                    resource = %ctx.resource,
                    "{}",
                    message
                );
                self.telemetry.alert(
                    Severity::High,
                    &format!("Security invariant violated: {}", invariant.name),
                    message,
                );
            }
            Severity::Medium | Severity::Low => {
                info!(
                    target: "security",
                    invariant = invariant.name,
                    severity = %invariant.severity,
                    "{}",
                    message
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::RecordingAlertDispatcher;

    fn context() -> InvariantContext {
        InvariantContext {
            subject: "user:alice".into(),
            resource: "document:1".into(),
            operation: Privilege::Read,
            granted_privileges: PrivilegeSet::from([Privilege::Read]),
            current_privileges: PrivilegeSet::from([Privilege::Read]),
            original_privileges: PrivilegeSet::from([Privilege::Read, Privilege::Write]),
            trust_level: TrustLevel::Constrained,
            allowed_privileges: TrustLevel::Constrained.allowed_privileges(),
            token_age: Duration::from_secs(10),
            max_token_age: Duration::from_secs(300),
            attempt: 1,
        }
    }

    fn checker() -> (InvariantChecker, Arc<RecordingAlertDispatcher>) {
        let alerts = Arc::new(RecordingAlertDispatcher::new());
        let telemetry = Arc::new(SecurityTelemetry::new(alerts.clone()).unwrap());
        (InvariantChecker::with_default_catalog(telemetry), alerts)
    }

    #[test]
    fn test_clean_context_passes() {
        let (checker, alerts) = checker();
        let report = checker.check_all(&context()).unwrap();

        assert_eq!(report.checked, 3);
        assert!(report.passed());
        assert!(alerts.alerts().is_empty());
    }

    #[test]
    fn test_all_invariants_evaluated_after_failure() {
        let (checker, alerts) = checker();
        let mut ctx = context();
        ctx.granted_privileges = PrivilegeSet::from([Privilege::Read, Privilege::Admin]);
        ctx.current_privileges = PrivilegeSet::from([Privilege::Read, Privilege::Admin]);
        ctx.token_age = Duration::from_secs(301);

        let report = checker.evaluate(&ctx);
        assert_eq!(report.violations.len(), 3);
        assert!(report.is_blocking());
        assert_eq!(alerts.count_at(Severity::Critical), 2);
        assert_eq!(alerts.count_at(Severity::High), 1);

        match checker.check_all(&ctx) {
            Err(AuthzError::SecurityInvariantViolation { severity, violations }) => {
                assert_eq!(severity, Severity::Critical);
                assert_eq!(violations.len(), 3);
            }
            other => panic!("expected critical violation, got {:?}", other),
        }
    }

    #[test]
    fn test_high_severity_alerts_without_blocking() {
        let (checker, alerts) = checker();
        let mut ctx = context();
        ctx.token_age = Duration::from_secs(600);

        let report = checker.check_all(&ctx).unwrap();
        assert_eq!(report.max_severity(), Some(Severity::High));
        assert_eq!(alerts.count_at(Severity::High), 1);
    }

    #[test]
    fn test_monotonic_check_skips_first_attempt() {
        let invariant = SecurityInvariant::monotonic_retry_privileges();
        let mut ctx = context();
        ctx.current_privileges = PrivilegeSet::all();

        assert!(!invariant.holds(&ctx));
        ctx.attempt = 0;
        assert!(invariant.holds(&ctx));
    }

    #[test]
    fn test_custom_low_invariant_is_recorded_only() {
        let alerts = Arc::new(RecordingAlertDispatcher::new());
        let telemetry = Arc::new(SecurityTelemetry::new(alerts.clone()).unwrap());
        let mut checker = InvariantChecker::new(telemetry.clone());
        checker.register(SecurityInvariant::new(
            "never_holds",
            Severity::Low,
            |_| false,
            |_| "always violated".to_string(),
        ));

        let report = checker.check_all(&context()).unwrap();
        assert_eq!(report.violations.len(), 1);
        assert!(alerts.alerts().is_empty());
        assert_eq!(telemetry.violation_count(), 1);
    }

    #[test]
    fn test_freshness_limits() {
        let limits = FreshnessLimits::default();
        assert_eq!(limits.max_age(TrustLevel::Normal), Duration::from_secs(3600));
        assert_eq!(limits.max_age(TrustLevel::Degraded), Duration::from_secs(1800));
        assert_eq!(limits.max_age(TrustLevel::Constrained), Duration::from_secs(300));
        assert_eq!(limits.max_age(TrustLevel::NoTrust), Duration::ZERO);
    }
}
