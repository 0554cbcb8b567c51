//! Resilient audit trail for authorization decisions
//!
//! Records go to a primary sink, then a fallback sink. Operations that require
//! an audit trail are blocked when neither sink accepts the record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::error::{AuthzError, Result};
use crate::telemetry::SecurityTelemetry;
use crate::trust::TrustLevel;
use crate::types::{AuthResult, Privilege, PrivilegeSet};

/// Immutable record of one decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub operation: Privilege,
    pub resource: String,
    pub allowed: bool,

    /// Stable reason code
    pub reason: String,

    pub trust_level: TrustLevel,
    pub required: bool,
}

impl AuditRecord {
    pub fn new(
        subject: &str,
        resource: &str,
        operation: Privilege,
        result: &AuthResult,
        trust_level: TrustLevel,
        required: bool,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            subject: subject.to_string(),
            operation,
            resource: resource.to_string(),
            allowed: result.allowed,
            reason: result.reason.code().to_string(),
            trust_level,
            required,
        }
    }
}

/// Audit persistence backend
#[async_trait]
pub trait AuditSink: Send + Sync {
    fn name(&self) -> &str;

    async fn log(&self, record: &AuditRecord) -> Result<()>;
}

/// Bounded in-memory audit buffer
pub struct InMemoryAuditSink {
    name: String,
    records: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
    failing: AtomicBool,
}

impl InMemoryAuditSink {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            failing: AtomicBool::new(false),
        }
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.read().await.iter().cloned().collect()
    }

    pub async fn query_by_subject(&self, subject: &str) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|record| record.subject == subject)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn log(&self, record: &AuditRecord) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AuthzError::AuditSink(format!(
                "{} sink unavailable",
                self.name
            )));
        }

        let mut records = self.records.write().await;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        Ok(())
    }
}

/// Primary/fallback audit writer
pub struct ResilientAuditSink {
    primary: Arc<dyn AuditSink>,
    fallback: Arc<dyn AuditSink>,
    required_operations: PrivilegeSet,
    telemetry: Arc<SecurityTelemetry>,
}

impl ResilientAuditSink {
    /// Privileges whose operations always require an audit trail
    pub fn default_required_operations() -> PrivilegeSet {
        PrivilegeSet::from([Privilege::Admin, Privilege::Delete, Privilege::Share])
    }

    pub fn new(
        primary: Arc<dyn AuditSink>,
        fallback: Arc<dyn AuditSink>,
        telemetry: Arc<SecurityTelemetry>,
    ) -> Self {
        Self {
            primary,
            fallback,
            required_operations: Self::default_required_operations(),
            telemetry,
        }
    }

    pub fn with_required_operations(mut self, required: PrivilegeSet) -> Self {
        self.required_operations = required;
        self
    }

    pub fn is_required(&self, operation: Privilege) -> bool {
        self.required_operations.contains(operation)
    }

    /// Persist `record`; returns whether any sink accepted it.
    ///
    /// Fails with [`AuthzError::AuditFailure`] when both sinks reject a record
    /// whose operation requires an audit trail.
    pub async fn log(&self, record: &AuditRecord, required: bool) -> Result<bool> {
        let primary_err = match self.primary.log(record).await {
            Ok(()) => {
                self.telemetry.record_audit_write("primary", true);
                return Ok(true);
            }
            Err(e) => e,
        };
        self.telemetry.record_audit_write("primary", false);
        warn!(
            sink = self.primary.name(),
            record_id = %record.id,
            error = %primary_err,
            "Primary audit sink failed, trying fallback"
        );

        let fallback_err = match self.fallback.log(record).await {
            Ok(()) => {
                self.telemetry.record_audit_write("fallback", true);
                return Ok(true);
            }
            Err(e) => e,
        };
        self.telemetry.record_audit_write("fallback", false);

        if required || self.is_required(record.operation) {
            error!(
                target: "security",
                record_id = %record.id,
                subject = %record.subject,
                operation = %record.operation,
                resource = %record.resource,
                primary_error = %primary_err,
                fallback_error = %fallback_err,
                "Audit failed on both sinks for a required operation"
            );
            return Err(AuthzError::AuditFailure(format!(
                "could not audit {} on {} by {}: primary: {}; fallback: {}",
                record.operation, record.resource, record.subject, primary_err, fallback_err
            )));
        }

        // Local record of last resort
        match serde_json::to_string(record) {
            Ok(json) => warn!(target: "security", record = %json, "Audit record not persisted"),
            Err(e) => warn!(record_id = %record.id, error = %e, "Audit record not persisted"),
        }
        debug!(record_id = %record.id, "Optional operation proceeds without audit");
        Ok(false)
    }
}
