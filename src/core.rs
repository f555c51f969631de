//! High level engine orchestration.
//!
//! Wires the response engine, proxy selector, scheduler, and coordinator
//! into one handle the probe driver talks to. Engines are constructed once
//! here and shared by cloning; there is no module-level state. Every
//! request-time method returns a value, never an error: "no proxy" and
//! "escalation" responses are the back-off signals.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::config::{EngineConfig, ProxyDefinition};
use crate::detection::{DetectionType, Observation, SessionContext};
use crate::events::{
    BurstNotice, DetectionNotice, EngineEvent, EventDispatcher, EventHandler, LoggingHandler,
    ProxyOutcomeNotice, ResponseNotice, SnapshotNotice,
};
use crate::proxy::{scorer::SuccessModel, PoolReport, Priority, ProxySelector, RequestContext};
use crate::response::{AdaptiveResponse, ResponseEngine, RiskSnapshot};
use crate::scheduler::{coordinator::AgentCoordinator, AdaptiveScheduler, PatternSnapshot};
use crate::snapshot::{EngineSnapshot, SnapshotError};
use crate::workers::{HealthProbe, Supervisor};

/// Builder for [`DropScout`].
pub struct DropScoutBuilder {
    config: EngineConfig,
    handlers: Vec<Arc<dyn EventHandler>>,
    model: Option<Box<dyn SuccessModel>>,
    logging: bool,
}

impl DropScoutBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            handlers: Vec::new(),
            model: None,
            logging: true,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_proxy(mut self, definition: ProxyDefinition) -> Self {
        self.config.proxy.pool.push(definition);
        self
    }

    pub fn register_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Replace the default learned proxy model.
    pub fn with_model(mut self, model: Box<dyn SuccessModel>) -> Self {
        self.model = Some(model);
        self
    }

    pub fn without_logging_handler(mut self) -> Self {
        self.logging = false;
        self
    }

    pub fn build(self) -> DropScout {
        let config = Arc::new(self.config);
        let proxies = match self.model {
            Some(model) => ProxySelector::with_model(config.proxy.clone(), model),
            None => ProxySelector::new(config.proxy.clone()),
        };
        let mut events = EventDispatcher::new();
        if self.logging {
            events.register_handler(Arc::new(LoggingHandler));
        }
        for handler in self.handlers {
            events.register_handler(handler);
        }
        DropScout {
            response: ResponseEngine::new(Arc::clone(&config)),
            scheduler: AdaptiveScheduler::new(config.scheduler.clone()),
            coordinator: AgentCoordinator::new(config.coordinator.clone()),
            proxies,
            events: Arc::new(events),
            config,
        }
    }
}

impl Default for DropScoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The adaptive decision core handed to every monitoring task.
#[derive(Clone)]
pub struct DropScout {
    config: Arc<EngineConfig>,
    response: ResponseEngine,
    proxies: ProxySelector,
    scheduler: AdaptiveScheduler,
    coordinator: AgentCoordinator,
    events: Arc<EventDispatcher>,
}

impl DropScout {
    pub fn builder() -> DropScoutBuilder {
        DropScoutBuilder::new()
    }

    pub fn new(config: EngineConfig) -> Self {
        DropScoutBuilder::new().with_config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Classify a detection signal and return the mitigation plan.
    pub fn report_detection(
        &self,
        target: &str,
        observation: &Observation,
        session: &SessionContext,
    ) -> AdaptiveResponse {
        self.report_detection_at(target, observation, session, Utc::now())
    }

    pub fn report_detection_at(
        &self,
        target: &str,
        observation: &Observation,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> AdaptiveResponse {
        let (event, response) =
            self.response
                .report_detection_at(target, observation, session, now);
        self.events.dispatch(EngineEvent::Detection(DetectionNotice {
            target: target.to_string(),
            detection_type: event.detection_type,
            severity: event.severity,
            risk: self.response.risk_at(target, now),
            timestamp: now,
        }));
        self.events.dispatch(EngineEvent::Response(ResponseNotice {
            target: target.to_string(),
            strategies: response.strategies.clone(),
            escalation: response.escalation,
            wait: response.wait,
            timestamp: now,
        }));
        response
    }

    /// Report whether the most recently issued response for the target and
    /// detection type restored normal operation.
    pub fn report_response_outcome(
        &self,
        target: &str,
        detection_type: DetectionType,
        success: bool,
    ) {
        self.response.record_outcome(target, detection_type, success);
    }

    /// Record one probe result; positive signals open the burst window.
    pub fn report_check_result(
        &self,
        target: &str,
        success: bool,
        positive_signals: u32,
        response_time_ms: f64,
    ) {
        self.report_check_result_at(target, success, positive_signals, response_time_ms, Utc::now());
    }

    pub fn report_check_result_at(
        &self,
        target: &str,
        success: bool,
        positive_signals: u32,
        response_time_ms: f64,
        now: DateTime<Utc>,
    ) {
        log::trace!(
            "check result {}: success={} positives={} {:.0}ms",
            target,
            success,
            positive_signals,
            response_time_ms
        );
        self.scheduler
            .record_check_at(target, success, positive_signals, now);
        if positive_signals > 0 {
            self.events.dispatch(EngineEvent::BurstOpened(BurstNotice {
                target: target.to_string(),
                timestamp: now,
            }));
        }
    }

    /// Pick a proxy for the request, or `None` when the pool has no
    /// candidates and the caller should retry later.
    pub fn get_proxy(
        &self,
        ctx: &RequestContext,
        session_id: Option<&str>,
    ) -> Option<ProxyDefinition> {
        self.proxies.select(ctx, session_id)
    }

    pub fn report_proxy_outcome(
        &self,
        address: &str,
        ctx: &RequestContext,
        success: bool,
        response_time_ms: f64,
        detected: bool,
        error: Option<&str>,
    ) {
        self.proxies
            .record_outcome(address, ctx, success, response_time_ms, detected, error);
        self.events
            .dispatch(EngineEvent::ProxyOutcome(ProxyOutcomeNotice {
                address: address.to_string(),
                target: ctx.target.clone(),
                success,
                detected,
                timestamp: Utc::now(),
            }));
    }

    /// Drop a sticky binding so the session's next request reselects.
    pub fn rotate_session(&self, session_id: &str) {
        self.proxies.rotate_session(session_id);
    }

    pub fn next_interval(&self, target: &str, priority: Priority) -> Duration {
        self.scheduler.next_interval(target, priority)
    }

    pub fn should_check_now(&self, target: &str, last_check: DateTime<Utc>) -> bool {
        self.scheduler.should_check_now(target, last_check)
    }

    /// Register a logical identity with the coordinator.
    pub fn register_identity(&self, identity: &str) {
        self.coordinator.register(identity);
    }

    pub fn deregister_identity(&self, identity: &str) {
        self.coordinator.deregister(identity);
    }

    /// Phase offset for an identity relative to the fleet.
    pub fn identity_offset(&self, identity: &str, base_interval: Duration) -> Duration {
        self.coordinator.offset_for(identity, base_interval)
    }

    /// Admission gate; a granted admission claims the check slot.
    pub fn try_admit(&self, identity: &str) -> bool {
        self.coordinator.try_admit(identity)
    }

    pub fn risk(&self, target: &str) -> f64 {
        self.response.risk(target)
    }

    pub fn risk_snapshot(&self, target: &str) -> Option<RiskSnapshot> {
        self.response.snapshot(target)
    }

    pub fn pattern_snapshot(&self, target: &str) -> Option<PatternSnapshot> {
        self.scheduler.snapshot(target)
    }

    pub fn pool_report(&self) -> PoolReport {
        self.proxies.report()
    }

    /// Export learned state to a JSON snapshot file.
    pub fn export_snapshot(&self, path: &str) -> Result<(), SnapshotError> {
        let snapshot = EngineSnapshot::capture(&self.scheduler, &self.proxies);
        snapshot.write_to(path)?;
        self.events
            .dispatch(EngineEvent::SnapshotWritten(SnapshotNotice {
                path: path.to_string(),
                timestamp: Utc::now(),
            }));
        Ok(())
    }

    /// Restore learned state from a JSON snapshot file.
    pub fn import_snapshot(&self, path: &str) -> Result<(), SnapshotError> {
        let snapshot = EngineSnapshot::read_from(path)?;
        snapshot.restore(&self.scheduler, &self.proxies);
        Ok(())
    }

    /// Spawn the background maintenance loops. The returned supervisor owns
    /// them; dropping it detaches, `shutdown().await` stops them gracefully.
    pub fn start_workers(&self, probe: Option<Arc<dyn HealthProbe>>) -> Supervisor {
        let workers = &self.config.workers;
        let mut supervisor = Supervisor::new();
        if let Some(probe) = probe {
            supervisor.spawn_health_check(
                self.proxies.clone(),
                probe,
                Duration::from_secs(workers.health_check_secs),
                workers.health_check_sample,
            );
        }
        supervisor.spawn_retrain(
            self.proxies.clone(),
            Duration::from_secs(workers.retrain_secs),
        );
        supervisor.spawn_analysis(
            self.response.clone(),
            self.scheduler.clone(),
            Duration::from_secs(workers.analysis_secs),
        );
        if let Some(path) = &workers.snapshot_path {
            supervisor.spawn_snapshot(
                self.scheduler.clone(),
                self.proxies.clone(),
                path.clone(),
                Duration::from_secs(workers.snapshot_secs),
            );
        }
        supervisor
    }

    /// Direct handles for advanced callers and tests.
    pub fn response_engine(&self) -> &ResponseEngine {
        &self.response
    }

    pub fn proxy_selector(&self) -> &ProxySelector {
        &self.proxies
    }

    pub fn scheduler(&self) -> &AdaptiveScheduler {
        &self.scheduler
    }

    pub fn coordinator(&self) -> &AgentCoordinator {
        &self.coordinator
    }
}
