//! Integrity-bound idempotency tokens and their store

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::{AuthzError, Result};
use crate::types::{Privilege, PrivilegeSet, Resource, Subject};

type HmacSha256 = Hmac<Sha256>;

/// Minimum secret length accepted by [`TokenSigner`]
pub const MIN_SECRET_LEN: usize = 32;

/// One authorization decision, reused across every retry of a chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub id: String,
    pub subject: String,
    pub resource: String,
    pub operation: Privilege,
    pub privileges: PrivilegeSet,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    /// Hex HMAC-SHA256 over the canonical claims
    pub integrity_tag: String,
}

impl AuthorizationToken {
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.granted_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether the token was issued for this exact request
    pub fn binds(&self, subject: &Subject, resource: &Resource, operation: Privilege) -> bool {
        self.subject == subject.id && self.resource == resource.id && self.operation == operation
    }

    fn claims(&self) -> CanonicalClaims<'_> {
        CanonicalClaims {
            id: &self.id,
            subject: &self.subject,
            resource: &self.resource,
            operation: self.operation,
            privileges: &self.privileges,
            granted_at: self.granted_at.timestamp_micros(),
            expires_at: self.expires_at.timestamp_micros(),
        }
    }
}

/// Fields covered by the integrity tag, in a fixed order
#[derive(Serialize)]
struct CanonicalClaims<'a> {
    id: &'a str,
    subject: &'a str,
    resource: &'a str,
    operation: Privilege,
    privileges: &'a PrivilegeSet,
    granted_at: i64,
    expires_at: i64,
}

/// Mints and verifies tokens with a process-held secret
#[derive(Clone)]
pub struct TokenSigner {
    secret: Vec<u8>,
}

impl fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSigner").field("secret", &"<redacted>").finish()
    }
}

impl TokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Result<Self> {
        let secret = secret.into();
        if secret.len() < MIN_SECRET_LEN {
            return Err(AuthzError::Config(format!(
                "Token secret must be at least {} bytes, got {}",
                MIN_SECRET_LEN,
                secret.len()
            )));
        }
        Ok(Self { secret })
    }

    /// Signer with a fresh random secret
    pub fn generate() -> Self {
        let mut secret = vec![0u8; MIN_SECRET_LEN];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    fn mac(&self, token: &AuthorizationToken) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|e| AuthzError::Internal(format!("HMAC key rejected: {}", e)))?;
        mac.update(&serde_json::to_vec(&token.claims())?);
        Ok(mac)
    }

    pub fn sign(&self, token: &AuthorizationToken) -> Result<String> {
        Ok(hex::encode(self.mac(token)?.finalize().into_bytes()))
    }

    /// Constant-time integrity check
    pub fn verify(&self, token: &AuthorizationToken) -> bool {
        let Ok(tag) = hex::decode(&token.integrity_tag) else {
            return false;
        };
        match self.mac(token) {
            Ok(mac) => mac.verify_slice(&tag).is_ok(),
            Err(_) => false,
        }
    }

    /// Mint a signed token for one attempt-0 grant
    pub fn issue(
        &self,
        subject: &Subject,
        resource: &Resource,
        operation: Privilege,
        privileges: PrivilegeSet,
        ttl: Duration,
    ) -> Result<AuthorizationToken> {
        let ttl = ChronoDuration::from_std(ttl)
            .map_err(|e| AuthzError::InvalidInput(format!("Token TTL out of range: {}", e)))?;
        let granted_at = Utc::now();

        let mut token = AuthorizationToken {
            id: uuid::Uuid::new_v4().to_string(),
            subject: subject.id.clone(),
            resource: resource.id.clone(),
            operation,
            privileges,
            granted_at,
            expires_at: granted_at + ttl,
            integrity_tag: String::new(),
        };
        token.integrity_tag = self.sign(&token)?;
        Ok(token)
    }
}

struct StoredToken {
    token: Arc<AuthorizationToken>,

    /// Privileges the chain may still use; only ever narrows
    ceiling: PrivilegeSet,
}

/// Outcome of narrowing a chain's ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct Narrowing {
    pub effective: PrivilegeSet,

    /// Privileges dropped by this narrowing
    pub removed: PrivilegeSet,
}

/// Token store keyed by token id.
///
/// Per-key operations run under the owning shard lock, so concurrent retries
/// of the same chain observe a linearizable ceiling.
#[derive(Default)]
pub struct TokenStore {
    tokens: DashMap<String, StoredToken>,
}

impl TokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: Arc<AuthorizationToken>) -> Result<()> {
        match self.tokens.entry(token.id.clone()) {
            Entry::Occupied(_) => Err(AuthzError::Internal(format!(
                "Token id collision: {}",
                token.id
            ))),
            Entry::Vacant(slot) => {
                let ceiling = token.privileges.clone();
                slot.insert(StoredToken { token, ceiling });
                Ok(())
            }
        }
    }

    /// Stored token, evicting it if expired
    pub fn get(&self, id: &str) -> Option<Arc<AuthorizationToken>> {
        let token = self.tokens.get(id).map(|entry| entry.token.clone())?;
        if token.is_expired() {
            self.tokens.remove_if(id, |_, entry| entry.token.is_expired());
            debug!(token_id = id, "Evicted expired token on lookup");
            return None;
        }
        Some(token)
    }

    pub fn ceiling(&self, id: &str) -> Option<PrivilegeSet> {
        self.tokens.get(id).map(|entry| entry.ceiling.clone())
    }

    /// Atomically narrow the chain ceiling to `ceiling ∩ current`
    pub fn narrow(&self, id: &str, current: &PrivilegeSet) -> Option<Narrowing> {
        let mut entry = self.tokens.get_mut(id)?;
        let effective = entry.ceiling.intersection(current);
        let removed = entry.ceiling.difference(&effective);
        entry.ceiling = effective.clone();
        Some(Narrowing { effective, removed })
    }

    pub fn remove(&self, id: &str) -> Option<Arc<AuthorizationToken>> {
        self.tokens.remove(id).map(|(_, entry)| entry.token)
    }

    /// Drop every expired token; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        self.tokens.retain(|_, entry| {
            let keep = !entry.token.is_expired_at(now);
            if !keep {
                purged += 1;
            }
            keep
        });
        purged
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
