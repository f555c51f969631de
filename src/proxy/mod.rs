//! Proxy health tracking and selection.
//!
//! Scores the configured pool per request, keeps sticky per-session bindings,
//! and learns from recorded outcomes. Selection is weighted-random over the
//! top candidates rather than pure argmax so load never concentrates on a
//! single endpoint.

pub mod scorer;

use chrono::{DateTime, Timelike, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::f64::consts::TAU;
use std::sync::{Arc, Mutex, RwLock};

use crate::config::{ProxyConfig, ProxyDefinition, ProxyKind};
use crate::history::BoundedHistory;
use scorer::{LogisticModel, SuccessModel, TrainingSample, TrainingSet};

/// Request urgency, shared with the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

/// What the probe driver intends to do with the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    /// Availability poll.
    Check,
    /// Warm-up browsing traffic.
    Browse,
    /// Checkout-critical request.
    Checkout,
}

/// Context for one proxy selection.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub target: String,
    pub kind: ProbeKind,
    pub priority: Priority,
    pub locale: Option<String>,
}

impl RequestContext {
    pub fn new(target: impl Into<String>, kind: ProbeKind, priority: Priority) -> Self {
        Self {
            target: target.into(),
            kind,
            priority,
            locale: None,
        }
    }

    pub fn with_locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = Some(locale.into());
        self
    }
}

/// Per-target EMA rates carried by each proxy record.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRates {
    pub success: f64,
    pub detection: f64,
    pub observations: u32,
}

impl Default for TargetRates {
    fn default() -> Self {
        Self {
            success: 1.0,
            detection: 0.0,
            observations: 0,
        }
    }
}

#[derive(Debug)]
struct ProxyRecord {
    endpoint: ProxyDefinition,
    total: u64,
    successes: u64,
    failures: u64,
    detections: u64,
    response_times: BoundedHistory<f64>,
    target_rates: HashMap<String, TargetRates>,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
    last_failure: Option<DateTime<Utc>>,
    last_error: Option<String>,
    health: f64,
    cost_accrued: f64,
}

/// Feature vector width produced by [`ProxyRecord::features`].
pub const FEATURE_LEN: usize = 20;

impl ProxyRecord {
    fn new(endpoint: ProxyDefinition, latency_window: usize) -> Self {
        Self {
            endpoint,
            total: 0,
            successes: 0,
            failures: 0,
            detections: 0,
            response_times: BoundedHistory::new(latency_window),
            target_rates: HashMap::new(),
            consecutive_failures: 0,
            last_success: None,
            last_failure: None,
            last_error: None,
            health: 1.0,
            cost_accrued: 0.0,
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }

    fn detection_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.detections as f64 / self.total as f64
        }
    }

    fn avg_response_ms(&self) -> Option<f64> {
        if self.response_times.is_empty() {
            return None;
        }
        Some(self.response_times.iter().sum::<f64>() / self.response_times.len() as f64)
    }

    fn latency_factor(&self) -> f64 {
        match self.avg_response_ms() {
            None => 1.0,
            Some(ms) => 1.0 / (1.0 + ms / 1000.0),
        }
    }

    fn recompute_health(&mut self) {
        let health = self.success_rate()
            * (1.0 - self.detection_rate())
            * 0.9f64.powi(self.consecutive_failures as i32)
            * self.latency_factor();
        self.health = health.clamp(0.0, 1.0);
    }

    /// Fixed-layout feature vector describing this record for a request:
    /// scaled totals, global and per-target rates, latency, failure streak,
    /// health, one-hot proxy kind / priority / probe kind, and a cyclic
    /// encoding of the hour of day.
    fn features(&self, ctx: &RequestContext, now: DateTime<Utc>) -> Vec<f64> {
        let rates = self
            .target_rates
            .get(&ctx.target)
            .copied()
            .unwrap_or_default();
        let hour = now.hour() as f64 / 24.0 * TAU;

        let mut features = Vec::with_capacity(FEATURE_LEN);
        features.push((self.total as f64 / 100.0).min(10.0));
        features.push(self.success_rate());
        features.push(self.detection_rate());
        features.push(self.avg_response_ms().unwrap_or(0.0) / 1000.0);
        features.push(self.consecutive_failures as f64);
        features.push(self.health);
        features.push(rates.success);
        features.push(rates.detection);
        for kind in [ProxyKind::Residential, ProxyKind::Datacenter, ProxyKind::Mobile] {
            features.push(if self.endpoint.kind == kind { 1.0 } else { 0.0 });
        }
        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            features.push(if ctx.priority == priority { 1.0 } else { 0.0 });
        }
        for kind in [ProbeKind::Check, ProbeKind::Browse, ProbeKind::Checkout] {
            features.push(if ctx.kind == kind { 1.0 } else { 0.0 });
        }
        features.push(hour.sin());
        features.push(hour.cos());
        features
    }
}

/// Public stats view for one pool member.
#[derive(Debug, Clone)]
pub struct ProxyStats {
    pub address: String,
    pub provider: String,
    pub kind: ProxyKind,
    pub health: f64,
    pub total: u64,
    pub success_rate: f64,
    pub detection_rate: f64,
    pub avg_response_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub cost_accrued: f64,
}

/// Pool-wide report for dashboards.
#[derive(Debug, Clone)]
pub struct PoolReport {
    pub total: usize,
    pub candidates: usize,
    pub sticky_sessions: usize,
    pub details: Vec<ProxyStats>,
}

/// Serializable per-proxy state for snapshot export/import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyExport {
    pub address: String,
    pub provider: String,
    #[serde(default)]
    pub location: Option<String>,
    pub kind: ProxyKind,
    pub health: f64,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub detections: u64,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_failure: Option<DateTime<Utc>>,
    pub cost_accrued: f64,
    pub response_times_ms: Vec<f64>,
    pub per_target: HashMap<String, TargetRates>,
}

struct SelectorInner {
    config: ProxyConfig,
    records: RwLock<HashMap<String, Arc<Mutex<ProxyRecord>>>>,
    sticky: Mutex<HashMap<String, String>>,
    model: Mutex<Box<dyn SuccessModel>>,
    training: Mutex<TrainingSet>,
}

/// Thread-safe proxy scoring and selection engine.
#[derive(Clone)]
pub struct ProxySelector {
    inner: Arc<SelectorInner>,
}

impl ProxySelector {
    pub fn new(config: ProxyConfig) -> Self {
        let model = Box::new(LogisticModel::new(config.min_training_samples));
        Self::with_model(config, model)
    }

    pub fn with_model(config: ProxyConfig, model: Box<dyn SuccessModel>) -> Self {
        let mut records = HashMap::new();
        for definition in &config.pool {
            records.insert(
                definition.address.clone(),
                Arc::new(Mutex::new(ProxyRecord::new(
                    definition.clone(),
                    config.latency_window,
                ))),
            );
        }
        let training = TrainingSet::new(config.training_capacity);
        Self {
            inner: Arc::new(SelectorInner {
                config,
                records: RwLock::new(records),
                sticky: Mutex::new(HashMap::new()),
                model: Mutex::new(model),
                training: Mutex::new(training),
            }),
        }
    }

    /// Add a pool member at runtime. Existing addresses are left untouched.
    pub fn add_proxy(&self, definition: ProxyDefinition) {
        let mut records = self.inner.records.write().expect("proxy lock poisoned");
        let latency_window = self.inner.config.latency_window;
        records
            .entry(definition.address.clone())
            .or_insert_with(|| Arc::new(Mutex::new(ProxyRecord::new(definition, latency_window))));
    }

    pub fn len(&self) -> usize {
        self.inner.records.read().expect("proxy lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn record(&self, address: &str) -> Option<Arc<Mutex<ProxyRecord>>> {
        self.inner
            .records
            .read()
            .expect("proxy lock poisoned")
            .get(address)
            .cloned()
    }

    fn is_candidate(&self, record: &ProxyRecord, target: &str, now: DateTime<Utc>) -> bool {
        let cfg = &self.inner.config;
        if record.consecutive_failures > cfg.max_consecutive_failures {
            return false;
        }
        if record.health < cfg.min_health {
            return false;
        }
        if let Some(last_failure) = record.last_failure {
            let recently = (now - last_failure).num_seconds() < cfg.failure_window_secs as i64;
            if recently && record.consecutive_failures > cfg.failure_window_threshold {
                return false;
            }
        }
        if let Some(rates) = record.target_rates.get(target) {
            if rates.observations >= cfg.target_rate_min_observations
                && rates.detection > cfg.max_target_detection_rate
            {
                return false;
            }
        }
        true
    }

    fn heuristic_score(&self, record: &ProxyRecord, ctx: &RequestContext, now: DateTime<Utc>) -> f64 {
        let cfg = &self.inner.config;
        let rates = record
            .target_rates
            .get(&ctx.target)
            .copied()
            .unwrap_or_default();

        let mut score = record.health;
        score *= record.success_rate();
        score *= 0.5 + 0.5 * rates.success;
        score *= record.latency_factor();

        if let (Some(wanted), Some(location)) = (&ctx.locale, &record.endpoint.location) {
            if wanted.eq_ignore_ascii_case(location) {
                score *= cfg.locale_bonus;
            }
        }

        match ctx.priority {
            Priority::Critical | Priority::High => {
                if record.endpoint.kind == ProxyKind::Residential {
                    score *= cfg.residential_bonus;
                }
            }
            Priority::Low => {
                if record.endpoint.kind == ProxyKind::Datacenter {
                    score *= cfg.datacenter_bonus;
                }
                score *= 1.0 / (1.0 + record.endpoint.cost_per_request * 100.0);
            }
            Priority::Normal => {}
        }

        score *= match record.last_success {
            None => 1.0,
            Some(at) => {
                let since = (now - at).num_seconds().max(0) as f64;
                0.8 + 0.2 / (1.0 + since / 3600.0)
            }
        };

        score
    }

    /// Pick a proxy for the request, honoring a sticky session binding when
    /// one exists and is still usable. Returns `None` when no candidate
    /// survives filtering; callers treat that as "retry later".
    pub fn select(&self, ctx: &RequestContext, session_id: Option<&str>) -> Option<ProxyDefinition> {
        self.select_at(ctx, session_id, Utc::now())
    }

    pub fn select_at(
        &self,
        ctx: &RequestContext,
        session_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Option<ProxyDefinition> {
        if let Some(session) = session_id {
            let bound = self
                .inner
                .sticky
                .lock()
                .expect("sticky lock poisoned")
                .get(session)
                .cloned();
            if let Some(address) = bound {
                if let Some(cell) = self.record(&address) {
                    let record = cell.lock().expect("proxy lock poisoned");
                    if self.is_candidate(&record, &ctx.target, now) {
                        return Some(record.endpoint.clone());
                    }
                }
                // Binding went unhealthy; fall through to a fresh pick.
                self.inner
                    .sticky
                    .lock()
                    .expect("sticky lock poisoned")
                    .remove(session);
            }
        }

        let mut scored: Vec<(String, f64)> = Vec::new();
        {
            let records = self.inner.records.read().expect("proxy lock poisoned");
            let model = self.inner.model.lock().expect("model lock poisoned");
            for (address, cell) in records.iter() {
                let record = cell.lock().expect("proxy lock poisoned");
                if !self.is_candidate(&record, &ctx.target, now) {
                    continue;
                }
                let mut score = self.heuristic_score(&record, ctx, now);
                if let Some(predicted) = model.predict(&record.features(ctx, now)) {
                    let blend = self.inner.config.heuristic_blend;
                    score = blend * score + (1.0 - blend) * predicted;
                }
                scored.push((address.clone(), score));
            }
        }

        if scored.is_empty() {
            log::warn!("proxy pool has no candidates for target {}", ctx.target);
            return None;
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        scored.truncate(self.inner.config.selection_pool);

        let chosen = weighted_choice(&scored).unwrap_or_else(|| scored[0].0.clone());
        let endpoint = self
            .record(&chosen)
            .map(|cell| cell.lock().expect("proxy lock poisoned").endpoint.clone())?;

        if let Some(session) = session_id {
            self.inner
                .sticky
                .lock()
                .expect("sticky lock poisoned")
                .insert(session.to_string(), chosen);
        }
        Some(endpoint)
    }

    /// Drop a sticky binding so the session's next request reselects.
    pub fn rotate_session(&self, session_id: &str) {
        self.inner
            .sticky
            .lock()
            .expect("sticky lock poisoned")
            .remove(session_id);
    }

    /// Record the outcome of a request issued through `address`.
    pub fn record_outcome(
        &self,
        address: &str,
        ctx: &RequestContext,
        success: bool,
        response_time_ms: f64,
        detected: bool,
        error: Option<&str>,
    ) {
        self.record_outcome_at(address, ctx, success, response_time_ms, detected, error, Utc::now());
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_outcome_at(
        &self,
        address: &str,
        ctx: &RequestContext,
        success: bool,
        response_time_ms: f64,
        detected: bool,
        error: Option<&str>,
        now: DateTime<Utc>,
    ) {
        let Some(cell) = self.record(address) else {
            log::warn!("outcome reported for unknown proxy {}", address);
            return;
        };
        let mut record = cell.lock().expect("proxy lock poisoned");

        // Features describe the state the selection saw, so capture them
        // before the outcome mutates the record.
        let features = record.features(ctx, now);

        record.total += 1;
        if success {
            record.successes += 1;
            record.consecutive_failures = 0;
            record.last_success = Some(now);
            record.last_error = None;
        } else {
            record.failures += 1;
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_failure = Some(now);
            record.last_error = error.map(str::to_string);
            if let Some(message) = error {
                log::debug!("proxy {} failed: {}", address, message);
            }
        }
        if detected {
            record.detections += 1;
        }
        record.response_times.push(response_time_ms.max(0.0));
        record.cost_accrued += record.endpoint.cost_per_request;

        let alpha = self.inner.config.target_rate_alpha;
        let rates = record.target_rates.entry(ctx.target.clone()).or_default();
        rates.success = (1.0 - alpha) * rates.success + alpha * if success { 1.0 } else { 0.0 };
        rates.detection = (1.0 - alpha) * rates.detection + alpha * if detected { 1.0 } else { 0.0 };
        rates.observations = rates.observations.saturating_add(1);

        record.recompute_health();

        self.inner
            .training
            .lock()
            .expect("training lock poisoned")
            .push(TrainingSample {
                features,
                success: success && !detected,
            });
    }

    /// Health-check penalty for a proxy that failed a connectivity probe.
    pub fn penalize(&self, address: &str) {
        self.penalize_at(address, Utc::now());
    }

    pub fn penalize_at(&self, address: &str, now: DateTime<Utc>) {
        if let Some(cell) = self.record(address) {
            let mut record = cell.lock().expect("proxy lock poisoned");
            record.consecutive_failures = record.consecutive_failures.saturating_add(1);
            record.last_failure = Some(now);
            record.recompute_health();
            log::debug!(
                "proxy {} failed health probe, streak {}",
                address,
                record.consecutive_failures
            );
        }
    }

    /// Random subset of addresses for a health-check round.
    pub fn sample_addresses(&self, count: usize) -> Vec<String> {
        let records = self.inner.records.read().expect("proxy lock poisoned");
        let mut addresses: Vec<String> = records.keys().cloned().collect();
        addresses.shuffle(&mut rand::thread_rng());
        addresses.truncate(count);
        addresses
    }

    /// Refit the learned model from the sample buffer. Returns whether the
    /// model is usable afterwards.
    pub fn retrain(&self) -> bool {
        // Lock order (model before training) matches the selection path so
        // concurrent retrain/select/record calls cannot cycle.
        let mut model = self.inner.model.lock().expect("model lock poisoned");
        let training = self.inner.training.lock().expect("training lock poisoned");
        let usable = model.fit(&training);
        log::debug!(
            "proxy model retrain: {} samples, usable={}",
            training.len(),
            usable
        );
        usable
    }

    pub fn training_samples(&self) -> usize {
        self.inner.training.lock().expect("training lock poisoned").len()
    }

    pub fn model_trained(&self) -> bool {
        self.inner.model.lock().expect("model lock poisoned").is_trained()
    }

    pub fn report(&self) -> PoolReport {
        self.report_at(Utc::now())
    }

    pub fn report_at(&self, now: DateTime<Utc>) -> PoolReport {
        let records = self.inner.records.read().expect("proxy lock poisoned");
        let mut details = Vec::with_capacity(records.len());
        let mut candidates = 0;
        for cell in records.values() {
            let record = cell.lock().expect("proxy lock poisoned");
            // Candidate counting uses a target-agnostic view.
            if self.is_candidate(&record, "", now) {
                candidates += 1;
            }
            details.push(ProxyStats {
                address: record.endpoint.address.clone(),
                provider: record.endpoint.provider.clone(),
                kind: record.endpoint.kind,
                health: record.health,
                total: record.total,
                success_rate: record.success_rate(),
                detection_rate: record.detection_rate(),
                avg_response_ms: record.avg_response_ms(),
                consecutive_failures: record.consecutive_failures,
                cost_accrued: record.cost_accrued,
            });
        }
        details.sort_by(|a, b| a.address.cmp(&b.address));
        PoolReport {
            total: records.len(),
            candidates,
            sticky_sessions: self.inner.sticky.lock().expect("sticky lock poisoned").len(),
            details,
        }
    }

    /// Serializable state for snapshot export.
    pub fn export(&self) -> Vec<ProxyExport> {
        let records = self.inner.records.read().expect("proxy lock poisoned");
        let mut exports: Vec<ProxyExport> = records
            .values()
            .map(|cell| {
                let record = cell.lock().expect("proxy lock poisoned");
                ProxyExport {
                    address: record.endpoint.address.clone(),
                    provider: record.endpoint.provider.clone(),
                    location: record.endpoint.location.clone(),
                    kind: record.endpoint.kind,
                    health: record.health,
                    total: record.total,
                    successes: record.successes,
                    failures: record.failures,
                    detections: record.detections,
                    consecutive_failures: record.consecutive_failures,
                    last_success: record.last_success,
                    last_failure: record.last_failure,
                    cost_accrued: record.cost_accrued,
                    response_times_ms: record.response_times.to_vec(),
                    per_target: record.target_rates.clone(),
                }
            })
            .collect();
        exports.sort_by(|a, b| a.address.cmp(&b.address));
        exports
    }

    /// Restore exported state onto matching pool members. Unknown addresses
    /// are skipped; bounded histories are rebuilt from the raw samples.
    pub fn import(&self, exports: &[ProxyExport]) {
        let records = self.inner.records.read().expect("proxy lock poisoned");
        for export in exports {
            let Some(cell) = records.get(&export.address) else {
                log::warn!("snapshot references unknown proxy {}", export.address);
                continue;
            };
            let mut record = cell.lock().expect("proxy lock poisoned");
            record.total = export.total;
            record.successes = export.successes;
            record.failures = export.failures;
            record.detections = export.detections;
            record.consecutive_failures = export.consecutive_failures;
            record.last_success = export.last_success;
            record.last_failure = export.last_failure;
            record.cost_accrued = export.cost_accrued;
            record.response_times = BoundedHistory::new(self.inner.config.latency_window);
            record
                .response_times
                .extend(export.response_times_ms.iter().copied());
            record.target_rates = export.per_target.clone();
            record.recompute_health();
        }
    }
}

fn weighted_choice(scored: &[(String, f64)]) -> Option<String> {
    if scored.is_empty() {
        return None;
    }
    let weights: Vec<f64> = scored.iter().map(|(_, score)| score.max(0.01)).collect();
    let total: f64 = weights.iter().sum();
    let mut rng = rand::thread_rng();
    if total <= f64::EPSILON {
        return scored.choose(&mut rng).map(|(address, _)| address.clone());
    }
    let mut remaining = rng.gen_range(0.0..total);
    for ((address, _), weight) in scored.iter().zip(&weights) {
        if remaining <= *weight {
            return Some(address.clone());
        }
        remaining -= weight;
    }
    scored.last().map(|(address, _)| address.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn definition(address: &str, kind: ProxyKind) -> ProxyDefinition {
        ProxyDefinition {
            address: address.into(),
            username: None,
            password: None,
            provider: "testprov".into(),
            location: Some("us".into()),
            kind,
            cost_per_request: 0.001,
        }
    }

    fn selector_with(pool: Vec<ProxyDefinition>) -> ProxySelector {
        let config = ProxyConfig {
            pool,
            ..Default::default()
        };
        ProxySelector::new(config)
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
    }

    fn ctx(target: &str) -> RequestContext {
        RequestContext::new(target, ProbeKind::Check, Priority::High)
    }

    #[test]
    fn empty_pool_selects_nothing() {
        let selector = selector_with(Vec::new());
        assert!(selector.select_at(&ctx("x"), None, base_time()).is_none());
    }

    #[test]
    fn reliable_proxy_dominates_selection() {
        let selector = selector_with(vec![
            definition("p1:8080", ProxyKind::Residential),
            definition("p2:8080", ProxyKind::Residential),
            definition("p3:8080", ProxyKind::Datacenter),
        ]);
        let now = base_time();
        let context = ctx("x");

        for _ in 0..100 {
            selector.record_outcome_at("p1:8080", &context, true, 150.0, false, None, now);
        }
        for i in 0..100 {
            let success = i < 10;
            selector.record_outcome_at("p2:8080", &context, success, 900.0, false, None, now);
        }
        for i in 0..40 {
            // Slow and half-failing: health drops below the candidacy floor.
            selector.record_outcome_at("p3:8080", &context, i % 2 == 0, 2500.0, i % 3 == 0, None, now);
        }

        let later = now + chrono::Duration::seconds(400);
        for _ in 0..50 {
            let picked = selector.select_at(&context, None, later).expect("candidate");
            assert_eq!(picked.address, "p1:8080");
        }
    }

    #[test]
    fn exhausted_failure_streak_excludes_proxy() {
        let selector = selector_with(vec![definition("p1:8080", ProxyKind::Residential)]);
        let now = base_time();
        let context = ctx("x");
        for _ in 0..6 {
            selector.record_outcome_at("p1:8080", &context, false, 500.0, false, Some("timeout"), now);
        }
        assert!(selector.select_at(&context, None, now).is_none());
    }

    #[test]
    fn detected_target_is_avoided_per_target() {
        let selector = selector_with(vec![
            definition("p1:8080", ProxyKind::Residential),
            definition("p2:8080", ProxyKind::Residential),
        ]);
        let now = base_time();
        let hot = ctx("hot-target");
        let warm = ctx("warm-target");
        // p1 is fine in general but consistently detected on one target.
        for _ in 0..40 {
            selector.record_outcome_at("p1:8080", &warm, true, 150.0, false, None, now);
        }
        for _ in 0..20 {
            selector.record_outcome_at("p1:8080", &hot, true, 150.0, true, None, now);
        }
        for _ in 0..30 {
            selector.record_outcome_at("p2:8080", &hot, true, 150.0, false, None, now);
        }
        let later = now + chrono::Duration::seconds(60);
        for _ in 0..20 {
            let picked = selector.select_at(&hot, None, later).expect("candidate");
            assert_eq!(picked.address, "p2:8080");
        }
        // The same proxy is still eligible for other targets.
        let cold = ctx("cold-target");
        let addresses: Vec<_> = (0..40)
            .filter_map(|_| selector.select_at(&cold, None, later))
            .map(|p| p.address)
            .collect();
        assert!(addresses.iter().any(|a| a == "p1:8080"));
    }

    #[test]
    fn sticky_sessions_pin_until_unhealthy() {
        let selector = selector_with(vec![
            definition("p1:8080", ProxyKind::Residential),
            definition("p2:8080", ProxyKind::Residential),
        ]);
        let now = base_time();
        let context = ctx("x");

        let first = selector.select_at(&context, Some("sess-1"), now).unwrap();
        for _ in 0..20 {
            let again = selector.select_at(&context, Some("sess-1"), now).unwrap();
            assert_eq!(again.address, first.address);
        }

        // Break the bound proxy; the session must move on.
        for _ in 0..6 {
            selector.record_outcome_at(&first.address, &context, false, 500.0, false, None, now);
        }
        let moved = selector.select_at(&context, Some("sess-1"), now).unwrap();
        assert_ne!(moved.address, first.address);
    }

    #[test]
    fn health_stays_in_unit_range() {
        let selector = selector_with(vec![definition("p1:8080", ProxyKind::Datacenter)]);
        let now = base_time();
        let context = ctx("x");
        for i in 0..200 {
            selector.record_outcome_at(
                "p1:8080",
                &context,
                i % 4 != 0,
                5000.0,
                i % 7 == 0,
                None,
                now,
            );
            let report = selector.report_at(now);
            let health = report.details[0].health;
            assert!((0.0..=1.0).contains(&health), "health {}", health);
        }
    }

    #[test]
    fn outcomes_accumulate_training_samples() {
        let selector = selector_with(vec![definition("p1:8080", ProxyKind::Residential)]);
        let now = base_time();
        let context = ctx("x");
        for i in 0..150 {
            selector.record_outcome_at("p1:8080", &context, i % 2 == 0, 200.0, false, None, now);
        }
        assert_eq!(selector.training_samples(), 150);
        assert!(!selector.model_trained());
        assert!(selector.retrain());
        assert!(selector.model_trained());
        // With a trained model selection still returns a healthy proxy.
        assert!(selector.select_at(&context, None, now).is_some());
    }

    #[test]
    fn export_import_round_trips_ranking() {
        let pool = vec![
            definition("p1:8080", ProxyKind::Residential),
            definition("p2:8080", ProxyKind::Datacenter),
        ];
        let selector = selector_with(pool.clone());
        let now = base_time();
        let context = ctx("x");
        for i in 0..50 {
            selector.record_outcome_at("p1:8080", &context, true, 120.0, false, None, now);
            selector.record_outcome_at("p2:8080", &context, i % 3 == 0, 800.0, false, None, now);
        }

        let exported = selector.export();
        let restored = selector_with(pool);
        restored.import(&exported);
        assert_eq!(selector.export(), restored.export());
    }
}
