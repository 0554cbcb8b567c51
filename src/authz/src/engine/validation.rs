//! Shadow validation of returned decisions against the authoritative source

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::backend::PrivilegeSource;
use crate::telemetry::SecurityTelemetry;
use crate::types::{AuthResult, DecisionReason, DecisionRequest, DecisionSource};

/// Re-checks a sample of decisions off the request path.
///
/// Sampled checks run in spawned tasks and never touch the returned decision.
pub struct ShadowValidator {
    source: Arc<dyn PrivilegeSource>,
    telemetry: Arc<SecurityTelemetry>,
    sample_rate: f64,
    timeout: Duration,
}

impl ShadowValidator {
    pub fn new(
        source: Arc<dyn PrivilegeSource>,
        telemetry: Arc<SecurityTelemetry>,
        sample_rate: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            source,
            telemetry,
            sample_rate: sample_rate.clamp(0.0, 1.0),
            timeout,
        }
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    /// Only source-backed verdicts can be compared with the source
    fn is_comparable(result: &AuthResult) -> bool {
        match result.source {
            Some(DecisionSource::Fresh) | Some(DecisionSource::Cache) => true,
            Some(DecisionSource::Public) => false,
            None => result.reason == DecisionReason::OperationNotGranted,
        }
    }

    /// Spawn a validation task for a sampled decision
    pub fn maybe_validate(&self, request: &DecisionRequest, result: &AuthResult) -> Option<JoinHandle<()>> {
        if self.sample_rate <= 0.0 || !Self::is_comparable(result) {
            return None;
        }
        if !rand::thread_rng().gen_bool(self.sample_rate) {
            return None;
        }

        let source = self.source.clone();
        let telemetry = self.telemetry.clone();
        let timeout = self.timeout;
        let subject = request.subject.clone();
        let resource = request.resource.clone();
        let operation = request.operation;
        let allowed = result.allowed;
        let label = result.source.map(|s| s.as_str()).unwrap_or("deny");

        Some(tokio::spawn(async move {
            let call = source.get_privileges(&subject, &resource, operation, timeout);
            let truth = match tokio::time::timeout(timeout, call).await {
                Ok(Ok(privileges)) => privileges.contains(operation),
                Ok(Err(e)) => {
                    debug!(error = %e, "Shadow validation skipped, source failed");
                    return;
                }
                Err(_) => {
                    debug!("Shadow validation skipped, source timed out");
                    return;
                }
            };

            let correct = truth == allowed;
            telemetry.record_validation(correct, label);
            if !correct {
                error!(
                    target: "security",
                    subject = %subject.id,
                    resource = %resource.id,
                    operation = %operation,
                    decided = allowed,
                    authoritative = truth,
                    source = label,
                    "Shadow validation mismatch"
                );
            }
        }))
    }
}
