//! Trust-Aware Decision Engine
//!
//! Composes the Trust Monitor, the Retry-Safe Authorizer, the grant cache, the
//! Invariant Checker and the Resilient Audit Sink into one allow/deny decision.
//!
//! # Architecture
//!
//! ```text
//! Request → TrustCheck ─┬─ NORMAL/DEGRADED → FreshAuthorize ─┬─────────────┐
//!                       │                     (timeout, read) └→ CacheFallback
//!                       ├─ CONSTRAINED → CacheFallback (read only)         │
//!                       ├─ NO_TRUST → public read only                     │
//!                       └─ Deny                                            ↓
//!                                          InvariantCheck → Audit → Decision
//!                                                                     ↓
//!                                                           [Shadow validation]
//! ```

pub mod validation;

pub use validation::ShadowValidator;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::audit::{AuditRecord, AuditSink, InMemoryAuditSink, ResilientAuditSink};
use crate::backend::PrivilegeSource;
use crate::cache::{GrantCache, GrantCacheConfig};
use crate::error::{AuthzError, Result};
use crate::invariants::{FreshnessLimits, InvariantChecker, InvariantContext, SecurityInvariant};
use crate::retry::{RetrySafeAuthorizer, DEFAULT_TOKEN_TTL};
use crate::telemetry::{AlertDispatcher, SecurityTelemetry, TracingAlertDispatcher};
use crate::token::{TokenSigner, TokenStore};
use crate::trust::{TrustLevel, TrustMonitor, TrustMonitorConfig};
use crate::types::{
    AuthResult, DecisionReason, DecisionRequest, DecisionSource, OperationRisk, PrivilegeSet,
};

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fresh-check timeout at NORMAL
    pub normal_timeout: Duration,

    /// Fresh-check timeout at DEGRADED
    pub degraded_timeout: Duration,

    /// Oldest cached grant usable after a timeout at DEGRADED
    pub degraded_cache_max_age: Duration,

    /// Oldest cached grant usable at CONSTRAINED
    pub constrained_cache_max_age: Duration,

    pub cache: GrantCacheConfig,
    pub token_ttl: Duration,
    pub freshness: FreshnessLimits,
    pub monitor: TrustMonitorConfig,

    /// Operations that must be audited before they take effect
    pub required_operations: PrivilegeSet,

    /// Fraction of decisions re-checked against the source (0.0 - 1.0)
    pub validation_sample_rate: f64,

    /// Capacity of each default in-memory audit sink
    pub audit_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            normal_timeout: Duration::from_millis(1000),
            degraded_timeout: Duration::from_millis(500),
            degraded_cache_max_age: Duration::from_secs(300),
            constrained_cache_max_age: Duration::from_secs(60),
            cache: GrantCacheConfig::default(),
            token_ttl: DEFAULT_TOKEN_TTL,
            freshness: FreshnessLimits::default(),
            monitor: TrustMonitorConfig::default(),
            required_operations: ResilientAuditSink::default_required_operations(),
            validation_sample_rate: 0.01,
            audit_buffer_size: 10_000,
        }
    }
}

/// Point-in-time view of the core's security health
#[derive(Debug, Clone)]
pub struct SecurityHealthSnapshot {
    pub trust_level: TrustLevel,
    pub time_at_level: Duration,
    pub correctness_rate: f64,
    pub violation_count: u64,
    pub escalations_blocked: u64,
}

/// Decision before the invariant check
struct Tentative {
    result: AuthResult,

    /// Age of the grant backing an allow
    grant_age: Duration,

    /// Privileges bound at attempt 0 of the chain
    original: PrivilegeSet,
}

impl Tentative {
    fn deny(reason: DecisionReason) -> Self {
        Self::from_denial(AuthResult::deny(reason))
    }

    fn from_denial(result: AuthResult) -> Self {
        Self {
            result,
            grant_age: Duration::ZERO,
            original: PrivilegeSet::new(),
        }
    }
}

/// Builder for [`TrustAwareEngine`]
pub struct EngineBuilder {
    source: Arc<dyn PrivilegeSource>,
    config: EngineConfig,
    signer: Option<TokenSigner>,
    token_store: Option<Arc<TokenStore>>,
    audit_sinks: Option<(Arc<dyn AuditSink>, Arc<dyn AuditSink>)>,
    alerts: Option<Arc<dyn AlertDispatcher>>,
    telemetry: Option<Arc<SecurityTelemetry>>,
    invariants: Vec<SecurityInvariant>,
}

impl EngineBuilder {
    pub fn new(source: Arc<dyn PrivilegeSource>) -> Self {
        Self {
            source,
            config: EngineConfig::default(),
            signer: None,
            token_store: None,
            audit_sinks: None,
            alerts: None,
            telemetry: None,
            invariants: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn signer(mut self, signer: TokenSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn token_store(mut self, store: Arc<TokenStore>) -> Self {
        self.token_store = Some(store);
        self
    }

    pub fn audit_sinks(mut self, primary: Arc<dyn AuditSink>, fallback: Arc<dyn AuditSink>) -> Self {
        self.audit_sinks = Some((primary, fallback));
        self
    }

    pub fn alerts(mut self, alerts: Arc<dyn AlertDispatcher>) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Share an existing telemetry handle; overrides `alerts`
    pub fn telemetry(mut self, telemetry: Arc<SecurityTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Register an invariant in addition to the default catalog
    pub fn invariant(mut self, invariant: SecurityInvariant) -> Self {
        self.invariants.push(invariant);
        self
    }

    pub fn build(self) -> Result<TrustAwareEngine> {
        let config = self.config;

        let telemetry = match self.telemetry {
            Some(telemetry) => telemetry,
            None => {
                let alerts = self
                    .alerts
                    .unwrap_or_else(|| Arc::new(TracingAlertDispatcher) as Arc<dyn AlertDispatcher>);
                Arc::new(SecurityTelemetry::new(alerts)?)
            }
        };

        let monitor = Arc::new(TrustMonitor::new(config.monitor.clone(), telemetry.clone()));

        let authorizer = RetrySafeAuthorizer::new(
            self.source.clone(),
            self.signer.unwrap_or_else(TokenSigner::generate),
            self.token_store.unwrap_or_default(),
            config.token_ttl,
            telemetry.clone(),
        );

        let mut checker = InvariantChecker::with_default_catalog(telemetry.clone());
        for invariant in self.invariants {
            checker.register(invariant);
        }

        let (primary, fallback) = self.audit_sinks.unwrap_or_else(|| {
            let primary: Arc<dyn AuditSink> =
                Arc::new(InMemoryAuditSink::new("primary", config.audit_buffer_size));
            let fallback: Arc<dyn AuditSink> =
                Arc::new(InMemoryAuditSink::new("fallback", config.audit_buffer_size));
            (primary, fallback)
        });
        let audit = ResilientAuditSink::new(primary, fallback, telemetry.clone())
            .with_required_operations(config.required_operations.clone());

        let validator = ShadowValidator::new(
            self.source,
            telemetry.clone(),
            config.validation_sample_rate,
            config.normal_timeout,
        );

        info!(
            normal_timeout_ms = config.normal_timeout.as_millis() as u64,
            degraded_timeout_ms = config.degraded_timeout.as_millis() as u64,
            sample_rate = config.validation_sample_rate,
            invariants = checker.invariants().len(),
            "TrustAwareEngine initialized"
        );

        Ok(TrustAwareEngine {
            cache: Arc::new(GrantCache::new(config.cache.clone())),
            config,
            monitor,
            authorizer,
            checker,
            audit,
            validator,
            telemetry,
        })
    }
}

/// Trust-aware authorization decision engine
pub struct TrustAwareEngine {
    config: EngineConfig,
    monitor: Arc<TrustMonitor>,
    authorizer: RetrySafeAuthorizer,
    checker: InvariantChecker,
    cache: Arc<GrantCache>,
    audit: ResilientAuditSink,
    validator: ShadowValidator,
    telemetry: Arc<SecurityTelemetry>,
}

impl TrustAwareEngine {
    pub fn builder(source: Arc<dyn PrivilegeSource>) -> EngineBuilder {
        EngineBuilder::new(source)
    }

    /// Decide one attempt of a request.
    ///
    /// Returns a deny decision for every degraded outcome. Errors are reserved
    /// for audit failures of required operations and internal faults.
    pub async fn decide(&self, request: &DecisionRequest) -> Result<AuthResult> {
        let started = Instant::now();
        let level = self.monitor.current();

        let tentative = self.evaluate(request, level).await?;
        let result = self.enforce_invariants(request, level, tentative)?;

        self.telemetry
            .record_decision(&result, level, started.elapsed());

        let required = self.audit.is_required(request.operation);
        let record = AuditRecord::new(
            &request.subject.id,
            &request.resource.id,
            request.operation,
            &result,
            level,
            required,
        );
        self.audit.log(&record, required).await?;

        debug!(
            subject = %request.subject.id,
            resource = %request.resource.id,
            operation = %request.operation,
            attempt = request.attempt,
            allowed = result.allowed,
            reason = %result.reason,
            trust_level = %level,
            "Authorization decided"
        );

        self.validator.maybe_validate(request, &result);
        Ok(result)
    }

    /// Decide, then run `side_effect` only when allowed.
    ///
    /// The audit write for the decision completes before `side_effect` starts.
    pub async fn execute<F, Fut, T>(&self, request: &DecisionRequest, side_effect: F) -> Result<T>
    where
        F: FnOnce(AuthResult) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let result = self.decide(request).await?;
        if !result.allowed {
            return Err(result.denial_error());
        }
        side_effect(result).await
    }

    pub fn current_trust_level(&self) -> TrustLevel {
        self.monitor.current()
    }

    pub fn security_health_snapshot(&self) -> SecurityHealthSnapshot {
        SecurityHealthSnapshot {
            trust_level: self.monitor.current(),
            time_at_level: self.monitor.time_at_level(),
            correctness_rate: self.telemetry.correctness_rate(),
            violation_count: self.telemetry.violation_count(),
            escalations_blocked: self.telemetry.escalations_blocked(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn trust_monitor(&self) -> &Arc<TrustMonitor> {
        &self.monitor
    }

    pub fn grant_cache(&self) -> &Arc<GrantCache> {
        &self.cache
    }

    pub fn token_store(&self) -> &Arc<TokenStore> {
        self.authorizer.store()
    }

    pub fn telemetry(&self) -> &Arc<SecurityTelemetry> {
        &self.telemetry
    }

    async fn evaluate(&self, request: &DecisionRequest, level: TrustLevel) -> Result<Tentative> {
        let risk = OperationRisk::of(request.operation, &request.resource);

        if !level.permits(risk) {
            self.telemetry.record_trust_blocked(level, request.operation);
            info!(
                target: "security",
                subject = %request.subject.id,
                operation = %request.operation,
                risk = %risk,
                trust_level = %level,
                "Operation blocked by trust level"
            );
            return Ok(Tentative::deny(DecisionReason::TrustLevelExceeded { level, risk }));
        }

        match level {
            TrustLevel::Normal | TrustLevel::Degraded => self.fresh_or_fallback(request, level).await,
            TrustLevel::Constrained => self.cached_only(request, level),
            TrustLevel::NoTrust => Ok(Self::public_only()),
        }
    }

    async fn fresh_or_fallback(&self, request: &DecisionRequest, level: TrustLevel) -> Result<Tentative> {
        let timeout = match level {
            TrustLevel::Normal => self.config.normal_timeout,
            _ => self.config.degraded_timeout,
        };
        let allowed = level.allowed_privileges();

        let grant = self
            .authorizer
            .authorize_with_context(request, timeout, &allowed)
            .await?;

        if grant.result.allowed {
            if request.attempt == 0 {
                self.cache.put(
                    &request.subject,
                    &request.resource,
                    request.operation,
                    grant.reported.clone(),
                );
            }

            let result = grant.result;
            if !result.privileges.contains(request.operation) {
                let mut denied = AuthResult::deny(DecisionReason::OperationNotGranted);
                denied.token = result.token;
                return Ok(Tentative {
                    result: denied,
                    grant_age: grant.token_age,
                    original: grant.original,
                });
            }

            return Ok(Tentative {
                result,
                grant_age: grant.token_age,
                original: grant.original,
            });
        }

        let denial = grant.result;
        if denial.reason.is_transient()
            && level == TrustLevel::Degraded
            && request.operation.is_read_only()
        {
            if let Some(fallback) =
                self.from_cache(request, level, self.config.degraded_cache_max_age, &denial)?
            {
                return Ok(fallback);
            }
        }

        if denial.reason == DecisionReason::BackendTimeout {
            self.telemetry.record_timeout_denied(level);
        }
        Ok(Tentative::from_denial(denial))
    }

    /// Reads only, and only from a recent cached grant; the risk gate has
    /// already rejected every other operation.
    fn cached_only(&self, request: &DecisionRequest, level: TrustLevel) -> Result<Tentative> {
        let chain = AuthResult::deny(DecisionReason::InsufficientTrustLevel { level });
        let chain = if request.attempt > 0 {
            match self.authorizer.check_token(request) {
                Ok(token) => chain.with_token(token),
                Err(denial) => return Ok(Tentative::from_denial(denial)),
            }
        } else {
            chain
        };

        match self.from_cache(request, level, self.config.constrained_cache_max_age, &chain)? {
            Some(fallback) => Ok(fallback),
            None => Ok(Tentative::deny(DecisionReason::InsufficientTrustLevel { level })),
        }
    }

    fn public_only() -> Tentative {
        Tentative {
            result: AuthResult::allow(
                PrivilegeSet::new(),
                DecisionSource::Public,
                DecisionReason::PublicResource,
            ),
            grant_age: Duration::ZERO,
            original: PrivilegeSet::new(),
        }
    }

    /// Serve a read from a cached grant aged at most `max_age`.
    ///
    /// A retry chain is narrowed to the cached grant, so fallback never widens
    /// what the chain already holds. A first attempt served here starts its
    /// chain at the clamped cached grant.
    fn from_cache(
        &self,
        request: &DecisionRequest,
        level: TrustLevel,
        max_age: Duration,
        denial: &AuthResult,
    ) -> Result<Option<Tentative>> {
        let Some(cached) = self.cache.get_fresh(
            &request.subject,
            &request.resource,
            request.operation,
            max_age,
        ) else {
            return Ok(None);
        };

        let mut privileges = cached.privileges.intersection(&level.allowed_privileges());
        let mut original = privileges.clone();

        let chain = match &denial.token {
            Some(token) if request.attempt > 0 => {
                let Some(narrowed) = self.authorizer.narrow_chain(token, &privileges) else {
                    return Ok(None);
                };
                privileges = narrowed;
                original = token.privileges.clone();
                Some(token.clone())
            }
            _ => None,
        };

        if !privileges.contains(request.operation) {
            return Ok(None);
        }

        let token = match chain {
            Some(token) => token,
            None if request.attempt == 0 => self.authorizer.mint(request, privileges.clone())?,
            None => return Ok(None),
        };

        self.telemetry.record_cache_fallback(level);
        info!(
            subject = %request.subject.id,
            resource = %request.resource.id,
            trust_level = %level,
            age_secs = cached.age().as_secs_f64(),
            "Serving decision from cached grant"
        );

        Ok(Some(Tentative {
            result: AuthResult::allow(privileges, DecisionSource::Cache, DecisionReason::CachedGrant)
                .with_token(token),
            grant_age: cached.age(),
            original,
        }))
    }

    fn enforce_invariants(
        &self,
        request: &DecisionRequest,
        level: TrustLevel,
        tentative: Tentative,
    ) -> Result<AuthResult> {
        let result = tentative.result;
        if !result.allowed {
            return Ok(result);
        }

        let ctx = InvariantContext {
            subject: request.subject.id.clone(),
            resource: request.resource.id.clone(),
            operation: request.operation,
            granted_privileges: result.privileges.clone(),
            current_privileges: result.privileges.clone(),
            original_privileges: if request.attempt == 0 {
                result.privileges.clone()
            } else {
                tentative.original
            },
            trust_level: level,
            allowed_privileges: level.allowed_privileges(),
            token_age: tentative.grant_age,
            max_token_age: self.config.freshness.max_age(level),
            attempt: request.attempt,
        };

        match self.checker.check_all(&ctx) {
            Ok(_) => Ok(result),
            Err(AuthzError::SecurityInvariantViolation { violations, .. }) => {
                error!(
                    target: "security",
                    subject = %request.subject.id,
                    resource = %request.resource.id,
                    operation = %request.operation,
                    violations = violations.len(),
                    "Decision blocked by critical invariant violation"
                );
                Ok(AuthResult::deny(DecisionReason::SecurityInvariantViolation { violations }))
            }
            Err(e) => Err(e),
        }
    }
}
