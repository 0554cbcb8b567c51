//! Background tasks: periodic trust evaluation and token sweeping

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::TrustMetricsSource;
use crate::engine::TrustAwareEngine;
use crate::token::TokenStore;
use crate::trust::TrustMonitor;

/// Evaluate `source` every `interval` until `cancel` fires.
///
/// Collection failures are logged and never change the trust level.
pub fn spawn_trust_monitor(
    monitor: Arc<TrustMonitor>,
    source: Arc<dyn TrustMetricsSource>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Trust monitor task stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match source.collect().await {
                        Ok(metrics) => {
                            monitor.evaluate(metrics);
                        }
                        Err(e) => warn!(error = %e, "Trust metrics collection failed"),
                    }
                }
            }
        }
    })
}

/// Purge expired tokens every `interval` until `cancel` fires
pub fn spawn_token_sweeper(
    store: Arc<TokenStore>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let purged = store.purge_expired();
                    if purged > 0 {
                        debug!(purged, remaining = store.len(), "Purged expired tokens");
                    }
                }
            }
        }
    })
}

/// Handles of the engine's background tasks
pub struct BackgroundTasks {
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundTasks {
    pub fn start(
        engine: &TrustAwareEngine,
        metrics_source: Arc<dyn TrustMetricsSource>,
        evaluation_interval: Duration,
        sweep_interval: Duration,
    ) -> Self {
        let cancel = CancellationToken::new();

        let handles = vec![
            spawn_trust_monitor(
                engine.trust_monitor().clone(),
                metrics_source,
                evaluation_interval,
                cancel.child_token(),
            ),
            spawn_token_sweeper(
                engine.token_store().clone(),
                sweep_interval,
                cancel.child_token(),
            ),
        ];

        info!(
            evaluation_interval_secs = evaluation_interval.as_secs_f64(),
            sweep_interval_secs = sweep_interval.as_secs_f64(),
            "Background tasks started"
        );

        Self {
            cancel,
            handles: Mutex::new(handles),
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every task and wait for it to finish
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Background tasks stopped");
    }
}

impl Drop for BackgroundTasks {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
