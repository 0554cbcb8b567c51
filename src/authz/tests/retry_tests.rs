//! Retry-Safe Authorization Tests
//!
//! Token chains, monotonic privilege narrowing, token validation and the
//! caller-side backoff loop.

use async_trait::async_trait;
use cretoai_resilient_authz::{
    engine::{EngineConfig, TrustAwareEngine},
    error::{AuthzError, Result},
    retry::{execute_with_retry, RetryPolicy, RetrySafeAuthorizer, DEFAULT_TOKEN_TTL},
    telemetry::SecurityTelemetry,
    token::{AuthorizationToken, TokenSigner, TokenStore},
    trust::{TrustMetrics, TrustMonitorConfig},
    types::{DecisionReason, DecisionRequest, DecisionSource, Privilege, PrivilegeSet, Resource, Subject},
    PrivilegeSource, StaticPrivilegeSource,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const TIMEOUT: Duration = Duration::from_secs(1);

fn authorizer_with_ttl(ttl: Duration) -> (Arc<StaticPrivilegeSource>, Arc<SecurityTelemetry>, RetrySafeAuthorizer) {
    let source = Arc::new(StaticPrivilegeSource::new());
    let telemetry = Arc::new(SecurityTelemetry::with_tracing_alerts().unwrap());
    let authorizer = RetrySafeAuthorizer::new(
        source.clone(),
        TokenSigner::generate(),
        Arc::new(TokenStore::new()),
        ttl,
        telemetry.clone(),
    );
    (source, telemetry, authorizer)
}

fn authorizer() -> (Arc<StaticPrivilegeSource>, Arc<SecurityTelemetry>, RetrySafeAuthorizer) {
    authorizer_with_ttl(DEFAULT_TOKEN_TTL)
}

fn read_request() -> DecisionRequest {
    DecisionRequest::new(
        Subject::new("user:alice"),
        Resource::new("document:1"),
        Privilege::Read,
    )
}

fn engine_with(source: Arc<dyn PrivilegeSource>) -> TrustAwareEngine {
    TrustAwareEngine::builder(source)
        .config(EngineConfig {
            monitor: TrustMonitorConfig {
                min_dwell: Duration::ZERO,
                downgrade_confirmations: 1,
                ..TrustMonitorConfig::default()
            },
            validation_sample_rate: 0.0,
            ..EngineConfig::default()
        })
        .build()
        .unwrap()
}

fn set_from_mask(mask: u8) -> PrivilegeSet {
    Privilege::ALL
        .into_iter()
        .enumerate()
        .filter(|(i, _)| mask & (1 << i) != 0)
        .map(|(_, p)| p)
        .collect()
}

/// Fails the first `failures` calls, then grants `privileges`
struct FlakySource {
    failures: AtomicU32,
    calls: AtomicU32,
    privileges: PrivilegeSet,
}

impl FlakySource {
    fn new(failures: u32, privileges: PrivilegeSet) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
            privileges,
        }
    }
}

#[async_trait]
impl PrivilegeSource for FlakySource {
    async fn get_privileges(
        &self,
        _subject: &Subject,
        _resource: &Resource,
        _operation: Privilege,
        _timeout: Duration,
    ) -> Result<PrivilegeSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(AuthzError::TransientBackend("connection reset".to_string()));
        }
        Ok(self.privileges.clone())
    }
}

// ============================================================================
// MONOTONIC NARROWING
// ============================================================================

#[tokio::test]
async fn test_retry_narrows_to_current_grant() {
    // TDD: {read, write} on attempt 0, source reports {read} on attempt 1
    let (source, telemetry, authorizer) = authorizer();
    source.grant(
        "user:alice",
        "document:1",
        PrivilegeSet::from([Privilege::Read, Privilege::Write]),
    );

    let first = authorizer.authorize(&read_request(), TIMEOUT).await.unwrap();
    assert!(first.allowed);
    let token = first.token.clone().unwrap();
    assert_eq!(token.privileges, PrivilegeSet::from([Privilege::Read, Privilege::Write]));

    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    let retry = authorizer
        .authorize(&read_request().retry(1, Some(token.clone())), TIMEOUT)
        .await
        .unwrap();

    assert!(retry.allowed);
    assert_eq!(retry.privileges, PrivilegeSet::from([Privilege::Read]));
    assert!(Arc::ptr_eq(retry.token.as_ref().unwrap(), &token));
    assert_eq!(telemetry.metrics().privilege_narrowed.get(), 1);
    assert_eq!(
        authorizer.store().ceiling(&token.id),
        Some(PrivilegeSet::from([Privilege::Read]))
    );
}

#[tokio::test]
async fn test_retry_never_regains_removed_privileges() {
    let (source, telemetry, authorizer) = authorizer();
    source.grant(
        "user:alice",
        "document:1",
        PrivilegeSet::from([Privilege::Read, Privilege::Write]),
    );
    let token = authorizer
        .authorize(&read_request(), TIMEOUT)
        .await
        .unwrap()
        .token
        .unwrap();

    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    authorizer
        .authorize(&read_request().retry(1, Some(token.clone())), TIMEOUT)
        .await
        .unwrap();

    // Source restores write; the chain must not
    source.grant(
        "user:alice",
        "document:1",
        PrivilegeSet::from([Privilege::Read, Privilege::Write]),
    );
    let third = authorizer
        .authorize(&read_request().retry(2, Some(token)), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(third.privileges, PrivilegeSet::from([Privilege::Read]));
    assert_eq!(telemetry.escalations_blocked(), 0);
}

#[tokio::test]
async fn test_escalation_attempt_blocked_and_counted() {
    let (source, telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    let token = authorizer
        .authorize(&read_request(), TIMEOUT)
        .await
        .unwrap()
        .token
        .unwrap();

    source.grant("user:alice", "document:1", PrivilegeSet::all());
    let retry = authorizer
        .authorize(&read_request().retry(1, Some(token)), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(retry.privileges, PrivilegeSet::from([Privilege::Read]));
    assert_eq!(telemetry.escalations_blocked(), 1);
}

#[tokio::test]
async fn test_trust_level_ceiling_applies_to_chain() {
    let (source, _telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::all());

    let grant = authorizer
        .authorize_with_context(&read_request(), TIMEOUT, &PrivilegeSet::from([Privilege::Read]))
        .await
        .unwrap();

    assert_eq!(grant.reported, PrivilegeSet::all());
    assert_eq!(grant.result.privileges, PrivilegeSet::from([Privilege::Read]));

    // A later retry under a wider ceiling stays bounded by the token
    let token = grant.result.token.unwrap();
    let retry = authorizer
        .authorize(&read_request().retry(1, Some(token)), TIMEOUT)
        .await
        .unwrap();
    assert_eq!(retry.privileges, PrivilegeSet::from([Privilege::Read]));
}

#[tokio::test]
async fn test_concurrent_retries_share_one_ceiling() {
    let (source, _telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::all());
    let authorizer = Arc::new(authorizer);
    let token = authorizer
        .authorize(&read_request(), TIMEOUT)
        .await
        .unwrap()
        .token
        .unwrap();

    let handles: Vec<_> = (0..16u8)
        .map(|i| {
            let authorizer = authorizer.clone();
            let source = source.clone();
            let token = token.clone();
            tokio::spawn(async move {
                let mut reported = set_from_mask(i % 32);
                reported.insert(Privilege::Read);
                source.grant("user:alice", "document:1", reported);
                authorizer
                    .authorize(&read_request().retry(1, Some(token)), TIMEOUT)
                    .await
                    .unwrap()
                    .privileges
            })
        })
        .collect();

    for handle in handles {
        let privileges = handle.await.unwrap();
        assert!(privileges.is_subset(&token.privileges));
    }

    let ceiling = authorizer.store().ceiling(&token.id).unwrap();
    assert!(ceiling.contains(Privilege::Read));
    assert!(ceiling.is_subset(&token.privileges));
}

proptest! {
    #[test]
    fn prop_retry_privileges_never_grow(masks in prop::collection::vec(0u8..32, 1..8)) {
        let observed = tokio_test::block_on(async {
            let (source, _telemetry, authorizer) = authorizer();
            source.grant("user:alice", "document:1", set_from_mask(masks[0]));
            let first = authorizer.authorize(&read_request(), TIMEOUT).await.unwrap();
            let token = first.token.clone().unwrap();

            let mut observed = vec![first.privileges];
            for (attempt, mask) in masks.iter().enumerate().skip(1) {
                source.grant("user:alice", "document:1", set_from_mask(*mask));
                let result = authorizer
                    .authorize(&read_request().retry(attempt as u32, Some(token.clone())), TIMEOUT)
                    .await
                    .unwrap();
                observed.push(result.privileges);
            }
            observed
        });

        for pair in observed.windows(2) {
            prop_assert!(pair[1].is_subset(&pair[0]));
        }
    }
}

// ============================================================================
// TOKEN VALIDATION
// ============================================================================

fn assert_token_rejected(result: &cretoai_resilient_authz::AuthResult) {
    assert!(!result.allowed);
    assert_eq!(result.reason.code(), "invalid-or-expired-token");
    assert!(matches!(
        result.denial_error(),
        AuthzError::InvalidOrExpiredToken(_)
    ));
}

#[tokio::test]
async fn test_retry_without_token_rejected() {
    let (source, _telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));

    let result = authorizer
        .authorize(&read_request().retry(1, None), TIMEOUT)
        .await
        .unwrap();

    assert_token_rejected(&result);
    assert_eq!(source.call_count(), 0);
}

#[tokio::test]
async fn test_tampered_token_rejected() {
    let (source, _telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    let token = authorizer
        .authorize(&read_request(), TIMEOUT)
        .await
        .unwrap()
        .token
        .unwrap();

    let mut forged: AuthorizationToken = (*token).clone();
    forged.privileges.insert(Privilege::Admin);

    let result = authorizer
        .authorize(&read_request().retry(1, Some(Arc::new(forged))), TIMEOUT)
        .await
        .unwrap();
    assert_token_rejected(&result);
}

#[tokio::test]
async fn test_token_bound_to_other_request_rejected() {
    let (source, _telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    source.grant("user:alice", "document:2", PrivilegeSet::from([Privilege::Read]));
    let token = authorizer
        .authorize(&read_request(), TIMEOUT)
        .await
        .unwrap()
        .token
        .unwrap();

    let other = DecisionRequest::new(
        Subject::new("user:alice"),
        Resource::new("document:2"),
        Privilege::Read,
    )
    .retry(1, Some(token));

    let result = authorizer.authorize(&other, TIMEOUT).await.unwrap();
    assert_token_rejected(&result);
}

#[tokio::test]
async fn test_token_from_other_signer_rejected() {
    let (source, _telemetry, authorizer) = authorizer();
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));

    let foreign = TokenSigner::generate()
        .issue(
            &Subject::new("user:alice"),
            &Resource::new("document:1"),
            Privilege::Read,
            PrivilegeSet::all(),
            DEFAULT_TOKEN_TTL,
        )
        .unwrap();

    let result = authorizer
        .authorize(&read_request().retry(1, Some(Arc::new(foreign))), TIMEOUT)
        .await
        .unwrap();
    assert_token_rejected(&result);
}

#[tokio::test]
async fn test_expired_token_rejected() {
    let (source, _telemetry, authorizer) = authorizer_with_ttl(Duration::from_millis(1));
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    let token = authorizer
        .authorize(&read_request(), TIMEOUT)
        .await
        .unwrap()
        .token
        .unwrap();

    std::thread::sleep(Duration::from_millis(10));
    assert!(token.is_expired());

    let result = authorizer
        .authorize(&read_request().retry(1, Some(token)), TIMEOUT)
        .await
        .unwrap();
    assert_token_rejected(&result);
    assert_eq!(authorizer.store().purge_expired(), 1);
}

proptest! {
    #[test]
    fn prop_any_field_change_breaks_integrity(field in 0usize..5, mask in 0u8..32) {
        let signer = TokenSigner::generate();
        let token = signer
            .issue(
                &Subject::new("user:alice"),
                &Resource::new("document:1"),
                Privilege::Read,
                PrivilegeSet::from([Privilege::Read]),
                DEFAULT_TOKEN_TTL,
            )
            .unwrap();
        prop_assert!(signer.verify(&token));

        let mut forged = token.clone();
        match field {
            0 => forged.subject.push_str(":evil"),
            1 => forged.resource.push_str(":other"),
            2 => forged.operation = Privilege::Write,
            3 => forged.expires_at += chrono::Duration::seconds(3600),
            _ => {
                let mut privileges = set_from_mask(mask);
                if privileges == token.privileges {
                    privileges.insert(Privilege::Admin);
                }
                forged.privileges = privileges;
            }
        }
        prop_assert!(!signer.verify(&forged));
    }
}

// ============================================================================
// CALLER-SIDE BACKOFF
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_backoff_retries_transient_failures() {
    let source = Arc::new(FlakySource::new(2, PrivilegeSet::from([Privilege::Read])));
    let engine = engine_with(source.clone());
    let started = Instant::now();

    let privileges = execute_with_retry(&engine, read_request(), &RetryPolicy::default(), |result| async move {
        Ok(result.privileges)
    })
    .await
    .unwrap();

    assert_eq!(privileges, PrivilegeSet::from([Privilege::Read]));
    assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    // 1s then 2s
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_gives_up_after_max_attempts() {
    let source = Arc::new(StaticPrivilegeSource::new());
    source.set_unavailable(true);
    let engine = engine_with(source.clone());

    let err = execute_with_retry(&engine, read_request(), &RetryPolicy::default(), |_| async {
        Ok(())
    })
    .await
    .unwrap_err();

    assert!(err.is_transient());
    assert_eq!(source.call_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_denial_not_retried() {
    let source = Arc::new(StaticPrivilegeSource::new());
    let engine = engine_with(source.clone());
    let started = Instant::now();
    let invoked = Arc::new(AtomicU32::new(0));

    let counter = invoked.clone();
    let err = execute_with_retry(&engine, read_request(), &RetryPolicy::default(), move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok(()) }
    })
    .await
    .unwrap_err();

    assert!(matches!(err, AuthzError::PermissionDenied(_)));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(source.call_count(), 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_operation_retry_reuses_chain_token() {
    let source = Arc::new(StaticPrivilegeSource::new());
    source.grant(
        "user:alice",
        "document:1",
        PrivilegeSet::from([Privilege::Read, Privilege::Write]),
    );
    let engine = engine_with(source.clone());
    let seen: Arc<Mutex<Vec<(String, PrivilegeSet)>>> = Arc::new(Mutex::new(Vec::new()));

    let attempts = seen.clone();
    let narrowing_source = source.clone();
    let result = execute_with_retry(&engine, read_request(), &RetryPolicy::default(), move |result| {
        let attempts = attempts.clone();
        let source = narrowing_source.clone();
        async move {
            let mut attempts = attempts.lock();
            attempts.push((result.token.as_ref().unwrap().id.clone(), result.privileges.clone()));
            if attempts.len() == 1 {
                source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
                return Err(AuthzError::TransientBackend("downstream write failed".to_string()));
            }
            Ok(result.reason)
        }
    })
    .await
    .unwrap();

    assert_eq!(result, DecisionReason::FreshAuthorization);
    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].0, seen[1].0);
    assert_eq!(seen[1].1, PrivilegeSet::from([Privilege::Read]));
    assert!(seen[1].1.is_subset(&seen[0].1));
}

#[tokio::test(start_paused = true)]
async fn test_cache_served_attempt_bounds_later_retries() {
    // DEGRADED: attempt 0 times out and is served {read} from cache, then the
    // source grows the grant before the retry reaches it
    let source = Arc::new(StaticPrivilegeSource::new());
    source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
    let engine = engine_with(source.clone());
    engine.decide(&read_request()).await.unwrap();

    source.grant(
        "user:alice",
        "document:1",
        PrivilegeSet::from([Privilege::Read, Privilege::Write, Privilege::Share]),
    );
    engine.trust_monitor().evaluate(TrustMetrics::new(5.0, 50.0, 0.0));
    source.set_latency(Duration::from_secs(2));

    let seen: Arc<Mutex<Vec<(Option<String>, DecisionSource, PrivilegeSet)>>> =
        Arc::new(Mutex::new(Vec::new()));
    let attempts = seen.clone();
    let recovering_source = source.clone();
    let privileges = execute_with_retry(&engine, read_request(), &RetryPolicy::default(), move |result| {
        let attempts = attempts.clone();
        let source = recovering_source.clone();
        async move {
            let mut attempts = attempts.lock();
            attempts.push((
                result.token.as_ref().map(|t| t.id.clone()),
                result.source.unwrap(),
                result.privileges.clone(),
            ));
            if attempts.len() == 1 {
                source.set_latency(Duration::ZERO);
                return Err(AuthzError::TransientBackend("downstream read failed".to_string()));
            }
            Ok(result.privileges)
        }
    })
    .await
    .unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].1, DecisionSource::Cache);
    assert!(seen[0].0.is_some());
    assert_eq!(seen[0].0, seen[1].0);
    assert_eq!(seen[1].1, DecisionSource::Fresh);
    assert_eq!(privileges, PrivilegeSet::from([Privilege::Read]));
    assert_eq!(engine.telemetry().escalations_blocked(), 1);
}

#[test]
fn test_retry_policy_delays() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.delay_for(0), Duration::from_secs(1));
    assert_eq!(policy.delay_for(1), Duration::from_secs(2));
    assert_eq!(policy.delay_for(2), Duration::from_secs(4));
}
