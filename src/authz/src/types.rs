//! Core authorization types

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{AuthzError, Result};
use crate::token::AuthorizationToken;
use crate::trust::TrustLevel;

/// Atomic capability grantable to a subject over a resource.
///
/// Operations are expressed as the privilege they exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Privilege {
    Read,
    Write,
    Share,
    Delete,
    Admin,
}

impl Privilege {
    /// Every privilege, lowest risk first
    pub const ALL: [Privilege; 5] = [
        Privilege::Read,
        Privilege::Write,
        Privilege::Share,
        Privilege::Delete,
        Privilege::Admin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Privilege::Read => "read",
            Privilege::Write => "write",
            Privilege::Share => "share",
            Privilege::Delete => "delete",
            Privilege::Admin => "admin",
        }
    }

    /// Intrinsic risk tier of exercising this privilege
    pub fn risk(&self) -> OperationRisk {
        match self {
            Privilege::Read => OperationRisk::Low,
            Privilege::Write => OperationRisk::Medium,
            Privilege::Share => OperationRisk::High,
            Privilege::Delete | Privilege::Admin => OperationRisk::Critical,
        }
    }

    pub fn is_read_only(&self) -> bool {
        matches!(self, Privilege::Read)
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Privilege {
    type Err = AuthzError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "read" => Ok(Privilege::Read),
            "write" => Ok(Privilege::Write),
            "share" => Ok(Privilege::Share),
            "delete" => Ok(Privilege::Delete),
            "admin" => Ok(Privilege::Admin),
            other => Err(AuthzError::InvalidInput(format!("Unknown privilege: {}", other))),
        }
    }
}

/// Graded operation risk tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationRisk {
    /// No authentication required
    Public = 1,
    /// Read-only access
    Low = 2,
    /// Writes
    Medium = 3,
    /// Sharing data with other subjects
    High = 4,
    /// Admin, delete and other irreversible changes
    Critical = 5,
}

impl OperationRisk {
    /// Risk of performing `operation` on `resource`
    pub fn of(operation: Privilege, resource: &Resource) -> Self {
        if resource.public && operation.is_read_only() {
            OperationRisk::Public
        } else {
            operation.risk()
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationRisk::Public => "PUBLIC",
            OperationRisk::Low => "LOW",
            OperationRisk::Medium => "MEDIUM",
            OperationRisk::High => "HIGH",
            OperationRisk::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for OperationRisk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of privileges.
///
/// Iteration and serialization are sorted, which keeps token integrity tags
/// independent of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PrivilegeSet(BTreeSet<Privilege>);

impl PrivilegeSet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    pub fn all() -> Self {
        Privilege::ALL.into_iter().collect()
    }

    pub fn insert(&mut self, privilege: Privilege) -> bool {
        self.0.insert(privilege)
    }

    pub fn contains(&self, privilege: Privilege) -> bool {
        self.0.contains(&privilege)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = Privilege> + '_ {
        self.0.iter().copied()
    }

    pub fn is_subset(&self, other: &PrivilegeSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn intersection(&self, other: &PrivilegeSet) -> PrivilegeSet {
        Self(self.0.intersection(&other.0).copied().collect())
    }

    /// Privileges in `self` that are not in `other`
    pub fn difference(&self, other: &PrivilegeSet) -> PrivilegeSet {
        Self(self.0.difference(&other.0).copied().collect())
    }
}

impl FromIterator<Privilege> for PrivilegeSet {
    fn from_iter<I: IntoIterator<Item = Privilege>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[Privilege; N]> for PrivilegeSet {
    fn from(privileges: [Privilege; N]) -> Self {
        privileges.into_iter().collect()
    }
}

impl fmt::Display for PrivilegeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, privilege) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            f.write_str(privilege.as_str())?;
        }
        f.write_str("}")
    }
}

/// Subject requesting access (user, service account, agent)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    /// Subject identifier (e.g., "user:alice@example.com")
    pub id: String,

    /// Additional attributes (e.g., department)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Subject {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Resource being accessed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource identifier (e.g., "document:123")
    pub id: String,

    /// Resource type, taken from the identifier prefix
    #[serde(rename = "type")]
    pub resource_type: String,

    /// Explicitly public resources remain readable when trust is lost
    #[serde(default)]
    pub public: bool,

    /// Additional attributes (e.g., owner, sensitivity)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Resource {
    /// Create a new (non-public) resource from an ID string
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let resource_type = id.split(':').next().unwrap_or("resource").to_string();

        Self {
            id,
            resource_type,
            public: false,
            attributes: HashMap::new(),
        }
    }

    /// Create an explicitly public resource
    pub fn public(id: impl Into<String>) -> Self {
        Self {
            public: true,
            ..Self::new(id)
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// One authorization request, possibly a retry within a chain
#[derive(Debug, Clone)]
pub struct DecisionRequest {
    pub subject: Subject,
    pub resource: Resource,
    pub operation: Privilege,

    /// 0 for the first attempt of a logical request
    pub attempt: u32,

    /// Token issued on attempt 0, required for every later attempt
    pub previous_token: Option<Arc<AuthorizationToken>>,
}

impl DecisionRequest {
    pub fn new(subject: Subject, resource: Resource, operation: Privilege) -> Self {
        Self {
            subject,
            resource,
            operation,
            attempt: 0,
            previous_token: None,
        }
    }

    /// Same request as a later attempt of the chain that `token` started
    pub fn retry(mut self, attempt: u32, token: Option<Arc<AuthorizationToken>>) -> Self {
        self.attempt = attempt;
        self.previous_token = token;
        self
    }
}

/// Where an allow decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Authoritative privilege source answered within the timeout
    Fresh,
    /// Bounded-age grant cache
    Cache,
    /// Public resource read while trust is lost
    Public,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Fresh => "fresh",
            DecisionSource::Cache => "cache",
            DecisionSource::Public => "public",
        }
    }
}

/// Reason for an authorization decision.
///
/// `Display` renders the stable reason code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DecisionReason {
    FreshAuthorization,
    CachedGrant,
    PublicResource,
    TrustLevelExceeded { level: TrustLevel, risk: OperationRisk },
    InvalidOrExpiredToken { detail: String },
    BackendTimeout,
    BackendError { detail: String },
    OperationNotGranted,
    InsufficientTrustLevel { level: TrustLevel },
    SecurityInvariantViolation { violations: Vec<String> },
}

impl DecisionReason {
    pub fn code(&self) -> &'static str {
        match self {
            DecisionReason::FreshAuthorization => "fresh-authorization",
            DecisionReason::CachedGrant => "cached-grant",
            DecisionReason::PublicResource => "public-resource",
            DecisionReason::TrustLevelExceeded { .. } => "trust-level-exceeded",
            DecisionReason::InvalidOrExpiredToken { .. } => "invalid-or-expired-token",
            DecisionReason::BackendTimeout => "backend-timeout",
            DecisionReason::BackendError { .. } => "backend-error",
            DecisionReason::OperationNotGranted => "operation-not-granted",
            DecisionReason::InsufficientTrustLevel { .. } => "insufficient-trust-level",
            DecisionReason::SecurityInvariantViolation { .. } => "security-invariant-violation",
        }
    }

    /// Denials a caller may retry after backing off
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DecisionReason::BackendTimeout | DecisionReason::BackendError { .. }
        )
    }

    /// Human-readable explanation, for logs and audit records
    pub fn describe(&self) -> String {
        match self {
            DecisionReason::TrustLevelExceeded { level, risk } => {
                format!("Operation risk {} exceeds trust level {}", risk, level)
            }
            DecisionReason::InvalidOrExpiredToken { detail } => {
                format!("Invalid or expired authorization token: {}", detail)
            }
            DecisionReason::BackendError { detail } => {
                format!("Authorization backend failed: {}", detail)
            }
            DecisionReason::InsufficientTrustLevel { level } => {
                format!("Insufficient trust level {} for authorization", level)
            }
            DecisionReason::SecurityInvariantViolation { violations } => {
                format!("Security invariant violated: {}", violations.join("; "))
            }
            other => other.code().to_string(),
        }
    }
}

impl fmt::Display for DecisionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Outcome of an authorization decision
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub allowed: bool,
    pub reason: DecisionReason,

    /// Idempotency token of the retry chain, if one was issued
    pub token: Option<Arc<AuthorizationToken>>,

    /// Privileges usable by the operation
    pub privileges: PrivilegeSet,

    /// Present on allow decisions only
    pub source: Option<DecisionSource>,
}

impl AuthResult {
    pub fn allow(privileges: PrivilegeSet, source: DecisionSource, reason: DecisionReason) -> Self {
        Self {
            allowed: true,
            reason,
            token: None,
            privileges,
            source: Some(source),
        }
    }

    pub fn deny(reason: DecisionReason) -> Self {
        Self {
            allowed: false,
            reason,
            token: None,
            privileges: PrivilegeSet::new(),
            source: None,
        }
    }

    pub fn with_token(mut self, token: Arc<AuthorizationToken>) -> Self {
        self.token = Some(token);
        self
    }

    /// Blocking error equivalent of a deny decision
    pub fn denial_error(&self) -> AuthzError {
        match &self.reason {
            DecisionReason::InvalidOrExpiredToken { detail } => {
                AuthzError::InvalidOrExpiredToken(detail.clone())
            }
            DecisionReason::BackendTimeout | DecisionReason::BackendError { .. } => {
                AuthzError::TransientBackend(self.reason.describe())
            }
            other => AuthzError::PermissionDenied(other.describe()),
        }
    }
}
