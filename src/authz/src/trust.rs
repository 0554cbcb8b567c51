//! Trust Monitor
//!
//! Classifies backend health into an ordered [`TrustLevel`] and applies level
//! changes with hysteresis: a minimum dwell at every level, plus a streak of
//! confirming evaluations before any downgrade.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::telemetry::SecurityTelemetry;
use crate::types::{OperationRisk, Privilege, PrivilegeSet};

/// Ordered health classification: NORMAL > DEGRADED > CONSTRAINED > NO_TRUST
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    NoTrust = 1,
    Constrained = 2,
    Degraded = 3,
    Normal = 4,
}

impl TrustLevel {
    pub fn rank(&self) -> u8 {
        *self as u8
    }

    pub fn from_rank(rank: u8) -> Option<Self> {
        match rank {
            1 => Some(TrustLevel::NoTrust),
            2 => Some(TrustLevel::Constrained),
            3 => Some(TrustLevel::Degraded),
            4 => Some(TrustLevel::Normal),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TrustLevel::Normal => "NORMAL",
            TrustLevel::Degraded => "DEGRADED",
            TrustLevel::Constrained => "CONSTRAINED",
            TrustLevel::NoTrust => "NO_TRUST",
        }
    }

    /// Highest operation risk tier this level allows
    pub fn max_risk(&self) -> OperationRisk {
        match self {
            TrustLevel::Normal => OperationRisk::Critical,
            TrustLevel::Degraded => OperationRisk::High,
            TrustLevel::Constrained => OperationRisk::Low,
            TrustLevel::NoTrust => OperationRisk::Public,
        }
    }

    pub fn permits(&self, risk: OperationRisk) -> bool {
        risk <= self.max_risk()
    }

    /// Privileges whose intrinsic risk tier is allowed at this level
    pub fn allowed_privileges(&self) -> PrivilegeSet {
        Privilege::ALL
            .into_iter()
            .filter(|privilege| self.permits(privilege.risk()))
            .collect()
    }
}

impl fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend health snapshot
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustMetrics {
    pub latency_p99_ms: f64,

    /// Percentage of failed backend calls (0-100)
    pub error_rate: f64,

    pub cache_staleness_secs: f64,
}

impl TrustMetrics {
    pub fn new(error_rate: f64, latency_p99_ms: f64, cache_staleness_secs: f64) -> Self {
        Self {
            latency_p99_ms,
            error_rate,
            cache_staleness_secs,
        }
    }

    pub fn healthy() -> Self {
        Self::default()
    }
}

/// Limits above which a level is entered
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelThreshold {
    pub error_rate: f64,
    pub latency_p99_ms: f64,

    /// Staleness is not considered when unset
    #[serde(default)]
    pub cache_staleness_secs: Option<f64>,
}

impl LevelThreshold {
    fn exceeded_by(&self, metrics: &TrustMetrics) -> bool {
        metrics.error_rate > self.error_rate
            || metrics.latency_p99_ms > self.latency_p99_ms
            || self
                .cache_staleness_secs
                .is_some_and(|limit| metrics.cache_staleness_secs > limit)
    }
}

/// Classification thresholds, checked from the most severe level down
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustThresholds {
    pub no_trust: LevelThreshold,
    pub constrained: LevelThreshold,
    pub degraded: LevelThreshold,
}

impl Default for TrustThresholds {
    fn default() -> Self {
        Self {
            no_trust: LevelThreshold {
                error_rate: 50.0,
                latency_p99_ms: 10_000.0,
                cache_staleness_secs: Some(1800.0),
            },
            constrained: LevelThreshold {
                error_rate: 20.0,
                latency_p99_ms: 2_000.0,
                cache_staleness_secs: Some(300.0),
            },
            degraded: LevelThreshold {
                error_rate: 1.0,
                latency_p99_ms: 200.0,
                cache_staleness_secs: None,
            },
        }
    }
}

impl TrustThresholds {
    /// Stateless classification of one snapshot
    pub fn classify(&self, metrics: &TrustMetrics) -> TrustLevel {
        if self.no_trust.exceeded_by(metrics) {
            TrustLevel::NoTrust
        } else if self.constrained.exceeded_by(metrics) {
            TrustLevel::Constrained
        } else if self.degraded.exceeded_by(metrics) {
            TrustLevel::Degraded
        } else {
            TrustLevel::Normal
        }
    }
}

/// Trust Monitor configuration
#[derive(Debug, Clone)]
pub struct TrustMonitorConfig {
    pub thresholds: TrustThresholds,

    /// Minimum time at a level before another transition may apply
    pub min_dwell: Duration,

    /// Consecutive below-current evaluations required for a downgrade
    pub downgrade_confirmations: u32,
}

impl Default for TrustMonitorConfig {
    fn default() -> Self {
        Self {
            thresholds: TrustThresholds::default(),
            min_dwell: Duration::from_secs(30),
            downgrade_confirmations: 3,
        }
    }
}

/// Applied trust level change
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrustTransition {
    pub from: TrustLevel,
    pub to: TrustLevel,
    pub at: DateTime<Utc>,

    /// How long the previous level was held
    #[serde(with = "duration_secs")]
    pub time_at_previous: Duration,

    /// Snapshot that triggered the transition
    pub metrics: TrustMetrics,
}

impl TrustTransition {
    pub fn is_downgrade(&self) -> bool {
        self.to < self.from
    }
}

mod duration_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }
}

#[derive(Debug)]
struct MonitorState {
    entered_at: Instant,

    /// Consecutive below-current evaluations
    streak: u32,

    /// Mildest level seen during the current streak
    streak_level: Option<TrustLevel>,
}

/// Periodically fed health classifier with hysteresis.
///
/// The level is published through an atomic so readers never take the state
/// lock. Only the evaluation path writes it.
pub struct TrustMonitor {
    config: TrustMonitorConfig,
    level: AtomicU8,
    state: Mutex<MonitorState>,
    events: broadcast::Sender<TrustTransition>,
    telemetry: Arc<SecurityTelemetry>,
}

impl TrustMonitor {
    /// Create a monitor starting at NORMAL
    pub fn new(config: TrustMonitorConfig, telemetry: Arc<SecurityTelemetry>) -> Self {
        let (events, _) = broadcast::channel(64);

        Self {
            config,
            level: AtomicU8::new(TrustLevel::Normal.rank()),
            state: Mutex::new(MonitorState {
                entered_at: Instant::now(),
                streak: 0,
                streak_level: None,
            }),
            events,
            telemetry,
        }
    }

    pub fn config(&self) -> &TrustMonitorConfig {
        &self.config
    }

    pub fn current(&self) -> TrustLevel {
        // Only valid ranks are ever stored
        TrustLevel::from_rank(self.level.load(Ordering::Acquire)).unwrap_or(TrustLevel::NoTrust)
    }

    pub fn time_at_level(&self) -> Duration {
        self.state.lock().entered_at.elapsed()
    }

    pub fn allowed_privileges(&self, level: TrustLevel) -> PrivilegeSet {
        level.allowed_privileges()
    }

    /// Receive every applied transition
    pub fn subscribe(&self) -> broadcast::Receiver<TrustTransition> {
        self.events.subscribe()
    }

    /// Evaluate a snapshot against the monotonic clock
    pub fn evaluate(&self, metrics: TrustMetrics) -> TrustLevel {
        self.evaluate_at(metrics, Instant::now())
    }

    /// Evaluate a snapshot observed at `now` and return the level in effect
    /// afterwards.
    pub fn evaluate_at(&self, metrics: TrustMetrics, now: Instant) -> TrustLevel {
        let observed = self.config.thresholds.classify(&metrics);

        let transition = {
            let mut state = self.state.lock();
            let current = self.current();
            let dwelled = now.saturating_duration_since(state.entered_at);
            let dwell_elapsed = dwelled >= self.config.min_dwell;

            let target = if observed < current {
                state.streak += 1;
                let mildest = state.streak_level.map_or(observed, |level| level.max(observed));
                state.streak_level = Some(mildest);

                debug!(
                    current = %current,
                    observed = %observed,
                    streak = state.streak,
                    required = self.config.downgrade_confirmations,
                    "Downgrade candidate observed"
                );

                (state.streak >= self.config.downgrade_confirmations && dwell_elapsed)
                    .then_some(mildest)
            } else {
                state.streak = 0;
                state.streak_level = None;
                (observed > current && dwell_elapsed).then_some(observed)
            };

            match target {
                Some(to) => {
                    state.entered_at = now;
                    state.streak = 0;
                    state.streak_level = None;
                    self.level.store(to.rank(), Ordering::Release);

                    Some(TrustTransition {
                        from: current,
                        to,
                        at: Utc::now(),
                        time_at_previous: dwelled,
                        metrics,
                    })
                }
                None => None,
            }
        };

        match transition {
            Some(transition) => {
                info!(
                    from = %transition.from,
                    to = %transition.to,
                    "Trust level transition applied"
                );
                self.telemetry.record_transition(&transition);
                let level = transition.to;
                // No subscribers is fine
                let _ = self.events.send(transition);
                level
            }
            None => self.current(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(min_dwell: Duration, confirmations: u32) -> TrustMonitor {
        let telemetry = Arc::new(SecurityTelemetry::with_tracing_alerts().unwrap());
        TrustMonitor::new(
            TrustMonitorConfig {
                thresholds: TrustThresholds::default(),
                min_dwell,
                downgrade_confirmations: confirmations,
            },
            telemetry,
        )
    }

    #[test]
    fn test_classification_thresholds() {
        let thresholds = TrustThresholds::default();

        assert_eq!(thresholds.classify(&TrustMetrics::new(0.0, 50.0, 0.0)), TrustLevel::Normal);
        assert_eq!(thresholds.classify(&TrustMetrics::new(1.5, 50.0, 0.0)), TrustLevel::Degraded);
        assert_eq!(thresholds.classify(&TrustMetrics::new(0.0, 250.0, 0.0)), TrustLevel::Degraded);
        assert_eq!(
            thresholds.classify(&TrustMetrics::new(0.0, 50.0, 400.0)),
            TrustLevel::Constrained
        );
        assert_eq!(
            thresholds.classify(&TrustMetrics::new(25.0, 50.0, 0.0)),
            TrustLevel::Constrained
        );
        assert_eq!(thresholds.classify(&TrustMetrics::new(60.0, 50.0, 0.0)), TrustLevel::NoTrust);
        assert_eq!(
            thresholds.classify(&TrustMetrics::new(0.0, 50.0, 2000.0)),
            TrustLevel::NoTrust
        );

        // Boundaries are exclusive
        assert_eq!(thresholds.classify(&TrustMetrics::new(1.0, 200.0, 0.0)), TrustLevel::Normal);
    }

    #[test]
    fn test_allowed_privileges_strictly_nested() {
        let levels = [
            TrustLevel::NoTrust,
            TrustLevel::Constrained,
            TrustLevel::Degraded,
            TrustLevel::Normal,
        ];

        for pair in levels.windows(2) {
            let lower = pair[0].allowed_privileges();
            let higher = pair[1].allowed_privileges();
            assert!(lower.is_subset(&higher));
            assert!(lower.len() < higher.len());
        }

        assert!(TrustLevel::NoTrust.allowed_privileges().is_empty());
        assert_eq!(
            TrustLevel::Constrained.allowed_privileges(),
            PrivilegeSet::from([Privilege::Read])
        );
        assert_eq!(TrustLevel::Normal.allowed_privileges(), PrivilegeSet::all());
    }

    #[test]
    fn test_rank_round_trip() {
        for level in [
            TrustLevel::Normal,
            TrustLevel::Degraded,
            TrustLevel::Constrained,
            TrustLevel::NoTrust,
        ] {
            assert_eq!(TrustLevel::from_rank(level.rank()), Some(level));
        }
        assert_eq!(TrustLevel::from_rank(0), None);
        assert!(TrustLevel::Normal > TrustLevel::NoTrust);
    }

    #[tokio::test]
    async fn test_healthy_metrics_stay_normal() {
        let monitor = monitor(Duration::ZERO, 3);
        assert_eq!(monitor.evaluate(TrustMetrics::new(0.0, 50.0, 0.0)), TrustLevel::Normal);
        assert_eq!(monitor.current(), TrustLevel::Normal);
    }

    #[tokio::test]
    async fn test_downgrade_requires_confirmation_streak() {
        let monitor = monitor(Duration::ZERO, 3);
        let failing = TrustMetrics::new(60.0, 50.0, 0.0);

        assert_eq!(monitor.evaluate(failing), TrustLevel::Normal);
        assert_eq!(monitor.evaluate(failing), TrustLevel::Normal);
        assert_eq!(monitor.evaluate(failing), TrustLevel::NoTrust);
    }

    #[tokio::test]
    async fn test_streak_applies_mildest_confirmed_level() {
        let monitor = monitor(Duration::ZERO, 3);

        monitor.evaluate(TrustMetrics::new(60.0, 50.0, 0.0));
        monitor.evaluate(TrustMetrics::new(5.0, 50.0, 0.0));
        let level = monitor.evaluate(TrustMetrics::new(60.0, 50.0, 0.0));

        assert_eq!(level, TrustLevel::Degraded);
    }

    #[tokio::test]
    async fn test_single_spike_resets_streak() {
        let monitor = monitor(Duration::ZERO, 3);
        let failing = TrustMetrics::new(60.0, 50.0, 0.0);

        monitor.evaluate(failing);
        monitor.evaluate(failing);
        monitor.evaluate(TrustMetrics::healthy());
        assert_eq!(monitor.evaluate(failing), TrustLevel::Normal);
        assert_eq!(monitor.evaluate(failing), TrustLevel::Normal);
        assert_eq!(monitor.evaluate(failing), TrustLevel::NoTrust);
    }

    #[tokio::test]
    async fn test_dwell_floor_blocks_upgrade() {
        let monitor = monitor(Duration::from_secs(30), 1);
        let start = Instant::now();

        let level = monitor.evaluate_at(TrustMetrics::new(60.0, 0.0, 0.0), start + Duration::from_secs(31));
        assert_eq!(level, TrustLevel::NoTrust);

        let level = monitor.evaluate_at(TrustMetrics::healthy(), start + Duration::from_secs(40));
        assert_eq!(level, TrustLevel::NoTrust);

        let level = monitor.evaluate_at(TrustMetrics::healthy(), start + Duration::from_secs(62));
        assert_eq!(level, TrustLevel::Normal);
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let monitor = monitor(Duration::ZERO, 1);
        let mut events = monitor.subscribe();

        monitor.evaluate(TrustMetrics::new(25.0, 0.0, 0.0));

        let transition = events.try_recv().unwrap();
        assert_eq!(transition.from, TrustLevel::Normal);
        assert_eq!(transition.to, TrustLevel::Constrained);
        assert!(transition.is_downgrade());
    }
}
