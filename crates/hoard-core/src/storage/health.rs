//! Storage health monitor
//!
//! Keeps a shared [`StorageHealth`] snapshot computed from the host's
//! usage estimate. Writers consult the snapshot; nothing ever waits on
//! it. The monitor never fails: an estimate error is logged and the
//! previous snapshot kept.
//!
//! ## States
//!
//! `Uninitialized -> Initializing -> Healthy | Degraded`
//!
//! Degraded is advisory. The key-value façade applies its own, higher
//! refusal threshold; the batch writer does not refuse at all.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::host::StorageHost;

/// Lifecycle of the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Uninitialized,
    Initializing,
    Healthy,
    Degraded,
}

/// Point-in-time view of storage capacity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageHealth {
    pub state: HealthState,
    pub is_healthy: bool,
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percent_used: f64,
    pub persistent: bool,
    pub last_error: Option<String>,
}

impl Default for StorageHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Uninitialized,
            is_healthy: true,
            used_bytes: 0,
            quota_bytes: 0,
            percent_used: 0.0,
            persistent: false,
            last_error: None,
        }
    }
}

/// Shared handle to the health snapshot
///
/// Clones share state.
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

struct MonitorInner {
    host: Arc<dyn StorageHost>,
    healthy_below_percent: f64,
    snapshot: RwLock<StorageHealth>,
}

impl HealthMonitor {
    pub fn new(host: Arc<dyn StorageHost>, healthy_below_percent: f64) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                host,
                healthy_below_percent,
                snapshot: RwLock::new(StorageHealth::default()),
            }),
        }
    }

    /// Current snapshot (plain read, never blocks on a check)
    pub fn snapshot(&self) -> StorageHealth {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut StorageHealth)) {
        let mut snapshot = self
            .inner
            .snapshot
            .write()
            .unwrap_or_else(|e| e.into_inner());
        f(&mut snapshot);
    }

    /// Request persistent storage once if not yet granted, then estimate usage
    pub fn initialize(&self) -> StorageHealth {
        self.update(|s| s.state = HealthState::Initializing);

        let host = &self.inner.host;
        let persistent = match host.persisted() {
            Ok(true) => true,
            Ok(false) => match host.persist() {
                Ok(granted) => {
                    info!(granted, "requested persistent storage");
                    granted
                }
                Err(e) => {
                    warn!("persistent storage request failed: {}", e);
                    false
                }
            },
            Err(e) => {
                warn!("could not query persistent storage status: {}", e);
                false
            }
        };
        self.update(|s| s.persistent = persistent);

        self.check_now()
    }

    /// Re-query the host and recompute the snapshot
    pub fn check_now(&self) -> StorageHealth {
        match self.inner.host.estimate() {
            Ok(estimate) => {
                let percent_used = estimate.percent_used();
                let is_healthy = percent_used < self.inner.healthy_below_percent;
                self.update(|s| {
                    s.used_bytes = estimate.usage;
                    s.quota_bytes = estimate.quota;
                    s.percent_used = percent_used;
                    s.is_healthy = is_healthy;
                    s.state = if is_healthy {
                        HealthState::Healthy
                    } else {
                        HealthState::Degraded
                    };
                });
                if !is_healthy {
                    warn!(percent_used, "storage nearly full");
                } else {
                    debug!(percent_used, "storage estimate refreshed");
                }
            }
            Err(e) => {
                warn!("storage estimate failed, keeping previous snapshot: {}", e);
                // An estimate that never succeeded still leaves Initializing
                self.update(|s| {
                    if s.state == HealthState::Initializing {
                        s.state = if s.is_healthy {
                            HealthState::Healthy
                        } else {
                            HealthState::Degraded
                        };
                    }
                });
            }
        }
        self.snapshot()
    }

    /// Record that the host rejected a write for lack of space
    pub fn mark_quota_exceeded(&self, message: impl Into<String>) {
        let message = message.into();
        warn!("quota exceeded: {}", message);
        self.update(|s| {
            s.state = HealthState::Degraded;
            s.is_healthy = false;
            s.last_error = Some(message);
        });
    }

    /// Record a failure without changing the health state
    pub fn record_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.update(|s| s.last_error = Some(message));
    }

    /// Spawn the periodic check on the current tokio runtime
    ///
    /// The first check runs one `period` after the call.
    pub fn start(&self, period: Duration) -> MonitorHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = self.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.check_now();
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("health monitor stopped");
        });

        MonitorHandle {
            shutdown_tx,
            task: Some(task),
        }
    }
}

/// Running periodic health check
///
/// Dropping the handle aborts the task.
pub struct MonitorHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the periodic check and wait for the task to exit
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
