//! # CretoAI Resilient Authorization Core
//!
//! Trust-aware authorization decisions that stay safe while the authoritative
//! policy backend degrades.
//!
//! ## Features
//!
//! - **Trust Monitor** with dwell time and downgrade confirmation
//! - **Retry-safe tokens** (HMAC-SHA256) whose privileges never grow across retries
//! - **Security invariants** evaluated on every decision, CRITICAL ones block
//! - **Bounded cache fallback** when the backend is slow
//! - **Resilient audit** with primary/fallback sinks for required operations
//! - **Prometheus metrics** and `tracing` security log
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use cretoai_resilient_authz::{
//!     DecisionRequest, Privilege, PrivilegeSet, Resource, StaticPrivilegeSource, Subject,
//!     TrustAwareEngine,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let source = Arc::new(StaticPrivilegeSource::new());
//!     source.grant("user:alice", "document:1", PrivilegeSet::from([Privilege::Read]));
//!
//!     let engine = TrustAwareEngine::builder(source).build()?;
//!     let request = DecisionRequest::new(
//!         Subject::new("user:alice"),
//!         Resource::new("document:1"),
//!         Privilege::Read,
//!     );
//!
//!     let decision = engine.decide(&request).await?;
//!     if decision.allowed {
//!         println!("Access granted via {:?}", decision.source);
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod audit;
pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod invariants;
pub mod retry;
pub mod runtime;
pub mod telemetry;
pub mod token;
pub mod trust;
pub mod types;

// Re-export commonly used types
pub use audit::{AuditRecord, AuditSink, InMemoryAuditSink, ResilientAuditSink};
pub use backend::{PrivilegeSource, StaticPrivilegeSource, StaticTrustMetricsSource, TrustMetricsSource};
pub use cache::{CacheStats, GrantCache, GrantCacheConfig};
pub use config::AuthzConfig;
pub use engine::{EngineBuilder, EngineConfig, SecurityHealthSnapshot, TrustAwareEngine};
pub use error::{AuthzError, Result};
pub use invariants::{InvariantChecker, InvariantContext, SecurityInvariant, Severity};
pub use retry::{execute_with_retry, RetryPolicy, RetrySafeAuthorizer};
pub use runtime::BackgroundTasks;
pub use telemetry::{AlertDispatcher, SecurityTelemetry, TracingAlertDispatcher};
pub use token::{AuthorizationToken, TokenSigner, TokenStore};
pub use trust::{TrustLevel, TrustMetrics, TrustMonitor, TrustMonitorConfig, TrustTransition};
pub use types::{
    AuthResult, DecisionReason, DecisionRequest, DecisionSource, OperationRisk, Privilege,
    PrivilegeSet, Resource, Subject,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
