//! Configuration loading and validation

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::cache::GrantCacheConfig;
use crate::engine::EngineConfig;
use crate::error::{AuthzError, Result};
use crate::invariants::FreshnessLimits;
use crate::retry::RetryPolicy;
use crate::trust::{LevelThreshold, TrustMonitorConfig, TrustThresholds};
use crate::types::{Privilege, PrivilegeSet};

/// Complete authorization core configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AuthzConfig {
    #[serde(default)]
    pub trust: TrustSection,

    #[serde(default)]
    pub tokens: TokenSection,

    #[serde(default)]
    pub engine: EngineSection,

    #[serde(default)]
    pub freshness: FreshnessSection,

    #[serde(default)]
    pub audit: AuditSection,

    #[serde(default)]
    pub retry: RetrySection,

    #[serde(default)]
    pub validation: ValidationSection,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrustSection {
    #[serde(default)]
    pub thresholds: TrustThresholds,
    #[serde(default = "default_min_dwell")]
    pub min_dwell_secs: u64,
    #[serde(default = "default_confirmations")]
    pub downgrade_confirmations: u32,
    #[serde(default = "default_evaluation_interval")]
    pub evaluation_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TokenSection {
    #[serde(default = "default_token_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineSection {
    #[serde(default = "default_normal_timeout")]
    pub normal_timeout_ms: u64,
    #[serde(default = "default_degraded_timeout")]
    pub degraded_timeout_ms: u64,
    #[serde(default = "default_degraded_cache_age")]
    pub degraded_cache_max_age_secs: u64,
    #[serde(default = "default_constrained_cache_age")]
    pub constrained_cache_max_age_secs: u64,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FreshnessSection {
    #[serde(default = "default_normal_age")]
    pub normal_secs: u64,
    #[serde(default = "default_degraded_age")]
    pub degraded_secs: u64,
    #[serde(default = "default_constrained_age")]
    pub constrained_secs: u64,
    #[serde(default)]
    pub no_trust_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditSection {
    #[serde(default = "default_required_operations")]
    pub required_operations: Vec<Privilege>,
    #[serde(default = "default_audit_buffer")]
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrySection {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_factor")]
    pub factor: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidationSection {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,
}

fn default_min_dwell() -> u64 { 30 }
fn default_confirmations() -> u32 { 3 }
fn default_evaluation_interval() -> u64 { 10 }
fn default_token_ttl() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 60 }
fn default_normal_timeout() -> u64 { 1000 }
fn default_degraded_timeout() -> u64 { 500 }
fn default_degraded_cache_age() -> u64 { 300 }
fn default_constrained_cache_age() -> u64 { 60 }
fn default_cache_ttl() -> u64 { 300 }
fn default_cache_capacity() -> usize { 10_000 }
fn default_normal_age() -> u64 { 3600 }
fn default_degraded_age() -> u64 { 1800 }
fn default_constrained_age() -> u64 { 300 }
fn default_required_operations() -> Vec<Privilege> {
    vec![Privilege::Admin, Privilege::Delete, Privilege::Share]
}
fn default_audit_buffer() -> usize { 10_000 }
fn default_base_delay() -> u64 { 1000 }
fn default_factor() -> f64 { 2.0 }
fn default_max_attempts() -> u32 { 3 }
fn default_sample_rate() -> f64 { 0.01 }

impl Default for TrustSection {
    fn default() -> Self {
        Self {
            thresholds: TrustThresholds::default(),
            min_dwell_secs: default_min_dwell(),
            downgrade_confirmations: default_confirmations(),
            evaluation_interval_secs: default_evaluation_interval(),
        }
    }
}

impl Default for TokenSection {
    fn default() -> Self {
        Self {
            ttl_secs: default_token_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            normal_timeout_ms: default_normal_timeout(),
            degraded_timeout_ms: default_degraded_timeout(),
            degraded_cache_max_age_secs: default_degraded_cache_age(),
            constrained_cache_max_age_secs: default_constrained_cache_age(),
            cache_ttl_secs: default_cache_ttl(),
            cache_capacity: default_cache_capacity(),
        }
    }
}

impl Default for FreshnessSection {
    fn default() -> Self {
        Self {
            normal_secs: default_normal_age(),
            degraded_secs: default_degraded_age(),
            constrained_secs: default_constrained_age(),
            no_trust_secs: 0,
        }
    }
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            required_operations: default_required_operations(),
            buffer_size: default_audit_buffer(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            factor: default_factor(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Default for ValidationSection {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
        }
    }
}

impl AuthzConfig {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: AuthzConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.trust.downgrade_confirmations == 0 {
            return Err(AuthzError::Config(
                "downgrade_confirmations must be at least 1".to_string(),
            ));
        }
        if self.trust.evaluation_interval_secs == 0 {
            return Err(AuthzError::Config(
                "evaluation_interval_secs must be positive".to_string(),
            ));
        }
        if self.tokens.ttl_secs == 0 || self.tokens.sweep_interval_secs == 0 {
            return Err(AuthzError::Config(
                "token ttl and sweep interval must be positive".to_string(),
            ));
        }

        let thresholds = &self.trust.thresholds;
        check_ordered("degraded", &thresholds.degraded, "constrained", &thresholds.constrained)?;
        check_ordered("constrained", &thresholds.constrained, "no_trust", &thresholds.no_trust)?;

        if self.engine.normal_timeout_ms == 0 || self.engine.degraded_timeout_ms == 0 {
            return Err(AuthzError::Config("engine timeouts must be positive".to_string()));
        }
        if self.engine.degraded_timeout_ms > self.engine.normal_timeout_ms {
            return Err(AuthzError::Config(
                "degraded_timeout_ms must not exceed normal_timeout_ms".to_string(),
            ));
        }
        if self.engine.cache_capacity == 0 {
            return Err(AuthzError::Config("cache_capacity must be positive".to_string()));
        }

        let freshness = &self.freshness;
        if !(freshness.normal_secs >= freshness.degraded_secs
            && freshness.degraded_secs >= freshness.constrained_secs
            && freshness.constrained_secs >= freshness.no_trust_secs)
        {
            return Err(AuthzError::Config(
                "freshness limits must not grow as trust drops".to_string(),
            ));
        }

        if self.retry.factor < 1.0 || !self.retry.factor.is_finite() {
            return Err(AuthzError::Config("retry factor must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(AuthzError::Config("max_attempts must be at least 1".to_string()));
        }

        if !(0.0..=1.0).contains(&self.validation.sample_rate) {
            return Err(AuthzError::Config(
                "validation sample_rate must be between 0.0 and 1.0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn monitor_config(&self) -> TrustMonitorConfig {
        TrustMonitorConfig {
            thresholds: self.trust.thresholds,
            min_dwell: Duration::from_secs(self.trust.min_dwell_secs),
            downgrade_confirmations: self.trust.downgrade_confirmations,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            normal_timeout: Duration::from_millis(self.engine.normal_timeout_ms),
            degraded_timeout: Duration::from_millis(self.engine.degraded_timeout_ms),
            degraded_cache_max_age: Duration::from_secs(self.engine.degraded_cache_max_age_secs),
            constrained_cache_max_age: Duration::from_secs(
                self.engine.constrained_cache_max_age_secs,
            ),
            cache: GrantCacheConfig {
                capacity: self.engine.cache_capacity,
                ttl: Duration::from_secs(self.engine.cache_ttl_secs),
            },
            token_ttl: Duration::from_secs(self.tokens.ttl_secs),
            freshness: FreshnessLimits {
                normal: Duration::from_secs(self.freshness.normal_secs),
                degraded: Duration::from_secs(self.freshness.degraded_secs),
                constrained: Duration::from_secs(self.freshness.constrained_secs),
                no_trust: Duration::from_secs(self.freshness.no_trust_secs),
            },
            monitor: self.monitor_config(),
            required_operations: self.audit.required_operations.iter().copied().collect::<PrivilegeSet>(),
            validation_sample_rate: self.validation.sample_rate,
            audit_buffer_size: self.audit.buffer_size,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            factor: self.retry.factor,
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.trust.evaluation_interval_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.tokens.sweep_interval_secs)
    }
}

/// A milder level's limits must not exceed those of the next harsher level
fn check_ordered(
    milder_name: &str,
    milder: &LevelThreshold,
    harsher_name: &str,
    harsher: &LevelThreshold,
) -> Result<()> {
    let staleness_ordered = match (milder.cache_staleness_secs, harsher.cache_staleness_secs) {
        (Some(m), Some(h)) => m <= h,
        _ => true,
    };

    if milder.error_rate > harsher.error_rate
        || milder.latency_p99_ms > harsher.latency_p99_ms
        || !staleness_ordered
    {
        return Err(AuthzError::Config(format!(
            "{} thresholds must not exceed {} thresholds",
            milder_name, harsher_name
        )));
    }
    Ok(())
}
