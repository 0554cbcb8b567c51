//! Retry-Safe Authorizer
//!
//! Attempt 0 of a logical request mints an integrity-bound token. Every later
//! attempt must present that token, and the privileges it yields are the
//! running intersection of everything the source reported since attempt 0.
//! Privileges across a retry chain therefore never grow.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backend::PrivilegeSource;
use crate::engine::TrustAwareEngine;
use crate::error::{AuthzError, Result};
use crate::telemetry::SecurityTelemetry;
use crate::token::{AuthorizationToken, TokenSigner, TokenStore};
use crate::types::{AuthResult, DecisionReason, DecisionRequest, DecisionSource, PrivilegeSet};

/// Default token lifetime
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Authorizer outcome plus the privilege sets the invariant checker needs
#[derive(Debug, Clone)]
pub struct RetryGrant {
    pub result: AuthResult,

    /// What the source reported on this attempt, before any narrowing
    pub reported: PrivilegeSet,

    /// What the chain was granted at attempt 0
    pub original: PrivilegeSet,

    pub token_age: Duration,
}

impl RetryGrant {
    fn denied(result: AuthResult) -> Self {
        Self {
            result,
            reported: PrivilegeSet::new(),
            original: PrivilegeSet::new(),
            token_age: Duration::ZERO,
        }
    }
}

pub struct RetrySafeAuthorizer {
    source: Arc<dyn PrivilegeSource>,
    signer: TokenSigner,
    store: Arc<TokenStore>,
    token_ttl: Duration,
    telemetry: Arc<SecurityTelemetry>,
}

impl RetrySafeAuthorizer {
    pub fn new(
        source: Arc<dyn PrivilegeSource>,
        signer: TokenSigner,
        store: Arc<TokenStore>,
        token_ttl: Duration,
        telemetry: Arc<SecurityTelemetry>,
    ) -> Self {
        Self {
            source,
            signer,
            store,
            token_ttl,
            telemetry,
        }
    }

    pub fn store(&self) -> &Arc<TokenStore> {
        &self.store
    }

    pub fn source(&self) -> &Arc<dyn PrivilegeSource> {
        &self.source
    }

    /// Authorize one attempt without a trust-level ceiling
    pub async fn authorize(&self, request: &DecisionRequest, timeout: Duration) -> Result<AuthResult> {
        Ok(self
            .authorize_with_context(request, timeout, &PrivilegeSet::all())
            .await?
            .result)
    }

    /// Authorize one attempt; granted privileges never exceed `allowed`
    pub async fn authorize_with_context(
        &self,
        request: &DecisionRequest,
        timeout: Duration,
        allowed: &PrivilegeSet,
    ) -> Result<RetryGrant> {
        if request.attempt == 0 {
            self.first_attempt(request, timeout, allowed).await
        } else {
            self.retry_attempt(request, timeout, allowed).await
        }
    }

    /// Narrow the chain of `token` to `privileges`, outside the source path.
    /// Used when a retry is served from the grant cache.
    pub fn narrow_chain(&self, token: &AuthorizationToken, privileges: &PrivilegeSet) -> Option<PrivilegeSet> {
        let narrowing = self.store.narrow(&token.id, privileges)?;
        if !narrowing.removed.is_empty() {
            self.telemetry.record_privilege_narrowed(&token.id, &narrowing.removed);
        }
        Some(narrowing.effective)
    }

    /// Sign and store the token that starts a chain.
    ///
    /// Every attempt-0 allow goes through here, including one served from
    /// the grant cache, so later retries are always bounded by `privileges`.
    pub fn mint(
        &self,
        request: &DecisionRequest,
        privileges: PrivilegeSet,
    ) -> Result<Arc<AuthorizationToken>> {
        let token = Arc::new(self.signer.issue(
            &request.subject,
            &request.resource,
            request.operation,
            privileges,
            self.token_ttl,
        )?);
        self.store.insert(token.clone())?;

        debug!(
            token_id = %token.id,
            subject = %request.subject.id,
            resource = %request.resource.id,
            privileges = %token.privileges,
            "Issued authorization token"
        );
        Ok(token)
    }

    async fn first_attempt(
        &self,
        request: &DecisionRequest,
        timeout: Duration,
        allowed: &PrivilegeSet,
    ) -> Result<RetryGrant> {
        let reported = match self.query(request, timeout).await {
            Ok(reported) => reported,
            Err(denial) => return Ok(RetryGrant::denied(denial)),
        };
        let privileges = reported.intersection(allowed);
        let token = self.mint(request, privileges.clone())?;

        Ok(RetryGrant {
            result: AuthResult::allow(
                privileges.clone(),
                DecisionSource::Fresh,
                DecisionReason::FreshAuthorization,
            )
            .with_token(token),
            reported,
            original: privileges,
            token_age: Duration::ZERO,
        })
    }

    async fn retry_attempt(
        &self,
        request: &DecisionRequest,
        timeout: Duration,
        allowed: &PrivilegeSet,
    ) -> Result<RetryGrant> {
        let stored = match self.check_token(request) {
            Ok(stored) => stored,
            Err(denial) => return Ok(RetryGrant::denied(denial)),
        };

        let reported = match self.query(request, timeout).await {
            Ok(reported) => reported,
            Err(denial) => return Ok(RetryGrant::denied(denial.with_token(stored))),
        };

        let Some(narrowing) = self.store.narrow(&stored.id, &reported.intersection(allowed)) else {
            self.telemetry.record_token_rejection(TokenRejection::Unknown.label());
            return Ok(RetryGrant::denied(AuthResult::deny(
                DecisionReason::InvalidOrExpiredToken {
                    detail: TokenRejection::Unknown.detail().to_string(),
                },
            )));
        };

        let offered = reported.difference(&stored.privileges).intersection(allowed);
        if !offered.is_empty() {
            self.telemetry.record_escalation_blocked(&stored.id, &offered);
        }
        if !narrowing.removed.is_empty() {
            self.telemetry.record_privilege_narrowed(&stored.id, &narrowing.removed);
        }

        info!(
            token_id = %stored.id,
            attempt = request.attempt,
            effective = %narrowing.effective,
            "Retry authorized with stored token"
        );

        Ok(RetryGrant {
            result: AuthResult::allow(
                narrowing.effective,
                DecisionSource::Fresh,
                DecisionReason::FreshAuthorization,
            )
            .with_token(stored.clone()),
            reported,
            original: stored.privileges.clone(),
            token_age: stored.age(),
        })
    }

    /// Validate the token a retry presents, without querying the source
    pub fn check_token(
        &self,
        request: &DecisionRequest,
    ) -> std::result::Result<Arc<AuthorizationToken>, AuthResult> {
        self.validate_token(request).map_err(|rejection| {
            self.telemetry.record_token_rejection(rejection.label());
            AuthResult::deny(DecisionReason::InvalidOrExpiredToken {
                detail: rejection.detail().to_string(),
            })
        })
    }

    /// Presence, integrity, expiry, binding, then store identity
    fn validate_token(
        &self,
        request: &DecisionRequest,
    ) -> std::result::Result<Arc<AuthorizationToken>, TokenRejection> {
        let presented = request.previous_token.as_ref().ok_or(TokenRejection::Missing)?;

        if !self.signer.verify(presented) {
            return Err(TokenRejection::Integrity);
        }
        if presented.is_expired() {
            return Err(TokenRejection::Expired);
        }
        if !presented.binds(&request.subject, &request.resource, request.operation) {
            return Err(TokenRejection::Binding);
        }

        let stored = self.store.get(&presented.id).ok_or(TokenRejection::Unknown)?;
        if stored.integrity_tag != presented.integrity_tag {
            return Err(TokenRejection::Integrity);
        }
        Ok(stored)
    }

    /// Single authoritative query bounded by `timeout`; failures become denials
    async fn query(
        &self,
        request: &DecisionRequest,
        timeout: Duration,
    ) -> std::result::Result<PrivilegeSet, AuthResult> {
        let call = self.source.get_privileges(
            &request.subject,
            &request.resource,
            request.operation,
            timeout,
        );

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(privileges)) => Ok(privileges),
            Ok(Err(e)) => {
                warn!(
                    subject = %request.subject.id,
                    resource = %request.resource.id,
                    error = %e,
                    "Privilege source failed"
                );
                Err(AuthResult::deny(DecisionReason::BackendError {
                    detail: e.to_string(),
                }))
            }
            Err(_) => {
                warn!(
                    subject = %request.subject.id,
                    resource = %request.resource.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "Privilege source timed out"
                );
                Err(AuthResult::deny(DecisionReason::BackendTimeout))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenRejection {
    Missing,
    Integrity,
    Expired,
    Binding,
    Unknown,
}

impl TokenRejection {
    fn label(&self) -> &'static str {
        match self {
            TokenRejection::Missing => "missing",
            TokenRejection::Integrity => "integrity",
            TokenRejection::Expired => "expired",
            TokenRejection::Binding => "binding",
            TokenRejection::Unknown => "unknown",
        }
    }

    fn detail(&self) -> &'static str {
        match self {
            TokenRejection::Missing => "retry presented no token",
            TokenRejection::Integrity => "token integrity check failed",
            TokenRejection::Expired => "token expired",
            TokenRejection::Binding => "token bound to a different request",
            TokenRejection::Unknown => "token not found in store",
        }
    }
}

/// Caller-side exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub factor: f64,

    /// Total attempts including the first
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        Duration::from_secs_f64(self.base_delay.as_secs_f64() * self.factor.powi(retry as i32))
    }
}

/// Decide `request` and run `operation` with the granted result, retrying
/// transient failures with backoff.
///
/// Later attempts reuse the chain's token; while no token has been issued the
/// chain restarts at attempt 0. Required audits happen inside each decision,
/// before `operation` runs.
pub async fn execute_with_retry<F, Fut, T>(
    engine: &TrustAwareEngine,
    request: DecisionRequest,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(AuthResult) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut chain_token: Option<Arc<AuthorizationToken>> = None;
    let mut chain_attempt = 0u32;

    for attempt in 0..max_attempts {
        let attempt_request = request.clone().retry(chain_attempt, chain_token.clone());
        let result = engine.decide(&attempt_request).await?;

        if chain_token.is_none() {
            chain_token = result.token.clone();
        }

        let error = if result.allowed {
            match operation(result).await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            }
        } else if result.reason.is_transient() {
            result.denial_error()
        } else {
            return Err(result.denial_error());
        };

        if !error.is_transient() || attempt + 1 >= max_attempts {
            return Err(error);
        }

        let delay = policy.delay_for(attempt);
        warn!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Transient failure, backing off before retry"
        );
        tokio::time::sleep(delay).await;

        if chain_token.is_some() {
            chain_attempt += 1;
        }
    }

    Err(AuthzError::Internal("retry loop exhausted".to_string()))
}
