//! External collaborators: the authoritative privilege source and the
//! health-metrics source feeding the Trust Monitor

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{AuthzError, Result};
use crate::trust::TrustMetrics;
use crate::types::{Privilege, PrivilegeSet, Resource, Subject};

/// Authoritative "who can do what" backend
#[async_trait]
pub trait PrivilegeSource: Send + Sync {
    /// Privileges `subject` currently holds on `resource`.
    ///
    /// `timeout` is advisory; callers also enforce it.
    async fn get_privileges(
        &self,
        subject: &Subject,
        resource: &Resource,
        operation: Privilege,
        timeout: Duration,
    ) -> Result<PrivilegeSet>;
}

/// In-memory privilege source with injectable latency and outages
#[derive(Default)]
pub struct StaticPrivilegeSource {
    grants: DashMap<(String, String), PrivilegeSet>,
    latency: RwLock<Duration>,
    unavailable: AtomicBool,
    calls: AtomicU64,
}

impl StaticPrivilegeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the privileges of `subject` on `resource`
    pub fn grant(&self, subject: &str, resource: &str, privileges: PrivilegeSet) {
        self.grants
            .insert((subject.to_string(), resource.to_string()), privileges);
    }

    pub fn revoke(&self, subject: &str, resource: &str) {
        self.grants.remove(&(subject.to_string(), resource.to_string()));
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write() = latency;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `get_privileges` calls received
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PrivilegeSource for StaticPrivilegeSource {
    async fn get_privileges(
        &self,
        subject: &Subject,
        resource: &Resource,
        _operation: Privilege,
        _timeout: Duration,
    ) -> Result<PrivilegeSet> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let latency = *self.latency.read();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AuthzError::TransientBackend(
                "privilege source unavailable".to_string(),
            ));
        }

        Ok(self
            .grants
            .get(&(subject.id.clone(), resource.id.clone()))
            .map(|grant| grant.clone())
            .unwrap_or_default())
    }
}

/// Supplies backend health snapshots to the Trust Monitor
#[async_trait]
pub trait TrustMetricsSource: Send + Sync {
    async fn collect(&self) -> Result<TrustMetrics>;
}

/// Metrics source returning whatever was last set
#[derive(Default)]
pub struct StaticTrustMetricsSource {
    metrics: RwLock<TrustMetrics>,
    failing: AtomicBool,
}

impl StaticTrustMetricsSource {
    pub fn new(metrics: TrustMetrics) -> Self {
        Self {
            metrics: RwLock::new(metrics),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set(&self, metrics: TrustMetrics) {
        *self.metrics.write() = metrics;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrustMetricsSource for StaticTrustMetricsSource {
    async fn collect(&self) -> Result<TrustMetrics> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthzError::TransientBackend(
                "metrics collection failed".to_string(),
            ));
        }
        Ok(*self.metrics.read())
    }
}
