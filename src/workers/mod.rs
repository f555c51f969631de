//! Background maintenance workers.
//!
//! An owning supervisor spawns the periodic loops (proxy health checks,
//! model retraining, pattern analysis, optional snapshots) and shuts them
//! down gracefully: a shutdown signal lets the current iteration finish
//! before the loop exits. Maintenance failures are logged and skipped; they
//! never reach request-time callers.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::proxy::ProxySelector;
use crate::response::ResponseEngine;
use crate::scheduler::AdaptiveScheduler;
use crate::snapshot::EngineSnapshot;

/// Lightweight connectivity probe delegated to the collaborator that owns
/// the network stack. Returns whether the proxy answered.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, address: &str) -> bool;
}

/// Owns the background loops and their shutdown channel.
pub struct Supervisor {
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Supervisor {
    pub fn new() -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            shutdown_tx,
            shutdown_rx,
            handles: Vec::new(),
        }
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    fn spawn<F, Fut>(&mut self, name: &'static str, every: Duration, mut work: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown_rx.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                // Work runs outside the select so a shutdown signal lets the
                // iteration complete.
                work().await;
                if *shutdown.borrow() {
                    break;
                }
            }
            log::debug!("{} worker stopped", name);
        });
        self.handles.push(handle);
    }

    /// Periodically probe a random pool subset and penalize non-responders.
    pub fn spawn_health_check(
        &mut self,
        selector: ProxySelector,
        probe: Arc<dyn HealthProbe>,
        every: Duration,
        sample: usize,
    ) {
        self.spawn("health-check", every, move || {
            let selector = selector.clone();
            let probe = Arc::clone(&probe);
            async move {
                for address in selector.sample_addresses(sample) {
                    if !probe.probe(&address).await {
                        selector.penalize(&address);
                    }
                }
            }
        });
    }

    /// Periodically refit the proxy outcome model.
    pub fn spawn_retrain(&mut self, selector: ProxySelector, every: Duration) {
        self.spawn("retrain", every, move || {
            let selector = selector.clone();
            async move {
                selector.retrain();
            }
        });
    }

    /// Periodically refresh learned detection/strategy maps and scheduler
    /// peak patterns, and prune expired burst windows.
    pub fn spawn_analysis(
        &mut self,
        response: ResponseEngine,
        scheduler: AdaptiveScheduler,
        every: Duration,
    ) {
        self.spawn("analysis", every, move || {
            let response = response.clone();
            let scheduler = scheduler.clone();
            async move {
                response.analyze_patterns();
                scheduler.analyze_patterns();
            }
        });
    }

    /// Periodic best-effort snapshot export.
    pub fn spawn_snapshot(
        &mut self,
        scheduler: AdaptiveScheduler,
        selector: ProxySelector,
        path: String,
        every: Duration,
    ) {
        self.spawn("snapshot", every, move || {
            let scheduler = scheduler.clone();
            let selector = selector.clone();
            let path = path.clone();
            async move {
                let snapshot = EngineSnapshot::capture(&scheduler, &selector);
                if let Err(error) = snapshot.write_to(&path) {
                    log::warn!("snapshot export to {} failed: {}", path, error);
                }
            }
        });
    }

    /// Signal all workers and wait for their current iteration to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}
