//! Adaptive detection response engine.
//!
//! Maintains per-target risk profiles, picks mitigation strategies for
//! classified detection events, and learns which strategies actually work
//! from recorded outcomes. Selection is a total function: every event gets a
//! response, with escalation to a full reset when the engine is repeating
//! itself.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::detection::{
    DetectionClassifier, DetectionEvent, DetectionType, Observation, SessionContext,
};
use crate::history::BoundedHistory;

/// Closed set of mitigations the probe driver knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStrategy {
    EnhanceBehavior,
    SlowDown,
    ChangeProxy,
    RotateFingerprint,
    PauseSession,
    SwitchProfile,
    FullReset,
}

/// Fallback strategies when nothing has been learned for a detection type.
fn generic_strategies(detection_type: DetectionType) -> Vec<ResponseStrategy> {
    use ResponseStrategy::*;
    match detection_type {
        DetectionType::Captcha => vec![EnhanceBehavior, PauseSession],
        DetectionType::RateLimit => vec![SlowDown, ChangeProxy],
        DetectionType::IpBlock => vec![ChangeProxy, PauseSession],
        DetectionType::SessionInvalid => vec![PauseSession, FullReset],
        DetectionType::Fingerprint => vec![RotateFingerprint, SwitchProfile],
        DetectionType::Behavior => vec![EnhanceBehavior, SlowDown],
        DetectionType::Unknown => vec![SlowDown, ChangeProxy],
    }
}

/// Mitigation plan returned to the probe driver.
#[derive(Debug, Clone)]
pub struct AdaptiveResponse {
    pub strategies: Vec<ResponseStrategy>,
    /// Pause the driver should observe before the next probe.
    pub wait: Duration,
    /// Pacing factor for the driver's action cadence, when slowing down.
    pub speed_factor: Option<f64>,
    /// Trust in the chosen strategies, from historical outcomes.
    pub confidence: f64,
    /// Estimated chance this response restores normal operation.
    pub estimated_success: f64,
    /// Set when the engine collapsed to a full reset because every proposed
    /// strategy was already active.
    pub escalation: bool,
}

#[derive(Debug, Clone, Copy)]
struct EventSample {
    at: DateTime<Utc>,
    detection_type: DetectionType,
    severity: f64,
}

/// Mutable per-target record guarded by its own mutex.
#[derive(Debug)]
struct TargetRiskProfile {
    sensitivity: f64,
    common_types: Vec<DetectionType>,
    effective: HashMap<DetectionType, Vec<ResponseStrategy>>,
    risk: f64,
    last_event: Option<DateTime<Utc>>,
    active_mitigations: HashSet<ResponseStrategy>,
    /// Strategies most recently issued per detection type, for outcome
    /// attribution.
    pending: HashMap<DetectionType, Vec<ResponseStrategy>>,
    events: BoundedHistory<EventSample>,
}

impl TargetRiskProfile {
    fn new(sensitivity: f64, priors: HashMap<DetectionType, Vec<ResponseStrategy>>) -> Self {
        Self {
            sensitivity,
            common_types: Vec::new(),
            effective: priors,
            risk: 0.0,
            last_event: None,
            active_mitigations: HashSet::new(),
            pending: HashMap::new(),
            events: BoundedHistory::new(1000),
        }
    }

    fn events_since(&self, cutoff: DateTime<Utc>) -> impl Iterator<Item = &EventSample> {
        self.events.iter().filter(move |e| e.at >= cutoff)
    }

    fn decayed_risk(&self, decay_per_minute: f64, now: DateTime<Utc>) -> f64 {
        match self.last_event {
            None => self.risk,
            Some(last) => {
                let minutes = (now - last).num_milliseconds().max(0) as f64 / 60_000.0;
                self.risk * decay_per_minute.powf(minutes)
            }
        }
    }
}

/// Read-only view of a target's risk state.
#[derive(Debug, Clone)]
pub struct RiskSnapshot {
    pub target: String,
    pub risk: f64,
    pub active_mitigations: Vec<ResponseStrategy>,
    pub common_types: Vec<DetectionType>,
    pub last_event: Option<DateTime<Utc>>,
    pub event_count: usize,
}

struct EngineInner {
    config: Arc<EngineConfig>,
    classifier: DetectionClassifier,
    profiles: RwLock<HashMap<String, Arc<Mutex<TargetRiskProfile>>>>,
    events: Mutex<BoundedHistory<DetectionEvent>>,
    outcomes: Mutex<HashMap<(DetectionType, ResponseStrategy), BoundedHistory<bool>>>,
}

/// Detection classification, risk scoring, and strategy selection.
#[derive(Clone)]
pub struct ResponseEngine {
    inner: Arc<EngineInner>,
}

impl ResponseEngine {
    pub fn new(config: Arc<EngineConfig>) -> Self {
        let classifier = DetectionClassifier::new(config.detection.clone());
        let capacity = config.detection.event_history_capacity;
        Self {
            inner: Arc::new(EngineInner {
                config,
                classifier,
                profiles: RwLock::new(HashMap::new()),
                events: Mutex::new(BoundedHistory::new(capacity)),
                outcomes: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn profile(&self, target: &str) -> Arc<Mutex<TargetRiskProfile>> {
        if let Some(profile) = self
            .inner
            .profiles
            .read()
            .expect("profile lock poisoned")
            .get(target)
        {
            return Arc::clone(profile);
        }
        let mut guard = self.inner.profiles.write().expect("profile lock poisoned");
        Arc::clone(guard.entry(target.to_string()).or_insert_with(|| {
            let sensitivity = self.inner.config.sensitivity(target);
            let priors = self
                .inner
                .config
                .strategy_priors(target)
                .cloned()
                .unwrap_or_default();
            Arc::new(Mutex::new(TargetRiskProfile::new(sensitivity, priors)))
        }))
    }

    /// Classify an observation bundle and return the mitigation plan.
    pub fn report_detection(
        &self,
        target: &str,
        observation: &Observation,
        session: &SessionContext,
    ) -> (DetectionEvent, AdaptiveResponse) {
        self.report_detection_at(target, observation, session, Utc::now())
    }

    pub fn report_detection_at(
        &self,
        target: &str,
        observation: &Observation,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> (DetectionEvent, AdaptiveResponse) {
        let detection_cfg = &self.inner.config.detection;
        let profile_cell = self.profile(target);
        let mut profile = profile_cell.lock().expect("profile lock poisoned");

        let recent_cutoff = now - ChronoDuration::seconds(detection_cfg.recent_window_secs as i64);
        let recent = profile.events_since(recent_cutoff).count();

        let event = self.inner.classifier.classify(
            target,
            observation,
            profile.sensitivity,
            recent,
            session,
            now,
        );

        // Risk update: EMA toward the new severity, then minute-granularity
        // decay for the gap since the previous event.
        let alpha = detection_cfg.risk_alpha;
        let mut risk = (1.0 - alpha) * profile.risk + alpha * event.severity;
        if let Some(last) = profile.last_event {
            let minutes = (now - last).num_milliseconds().max(0) as f64 / 60_000.0;
            risk *= detection_cfg.risk_decay_per_minute.powf(minutes);
        }
        profile.risk = risk.clamp(0.0, 1.0);
        profile.last_event = Some(now);
        profile.events.push(EventSample {
            at: now,
            detection_type: event.detection_type,
            severity: event.severity,
        });

        let response = self.select_response(&mut profile, &event, now);

        self.inner
            .events
            .lock()
            .expect("event lock poisoned")
            .push(event.clone());

        log::debug!(
            "detection {}: {:?} severity {:.2} risk {:.2} -> {:?}{}",
            target,
            event.detection_type,
            event.severity,
            profile.risk,
            response.strategies,
            if response.escalation { " (escalation)" } else { "" },
        );

        (event, response)
    }

    fn select_response(
        &self,
        profile: &mut TargetRiskProfile,
        event: &DetectionEvent,
        now: DateTime<Utc>,
    ) -> AdaptiveResponse {
        let cfg = &self.inner.config.response;
        let detection_type = event.detection_type;

        let mut strategies = profile
            .effective
            .get(&detection_type)
            .filter(|list| !list.is_empty())
            .cloned()
            .unwrap_or_else(|| generic_strategies(detection_type));

        let mut wait = Duration::ZERO;
        let mut speed_factor = None;
        if event.severity > cfg.reset_threshold {
            if !strategies.contains(&ResponseStrategy::FullReset) {
                strategies.push(ResponseStrategy::FullReset);
            }
            wait = Duration::from_secs(cfg.reset_wait_secs);
        } else if event.severity > cfg.pause_threshold {
            if !strategies.contains(&ResponseStrategy::PauseSession) {
                strategies.push(ResponseStrategy::PauseSession);
            }
            wait = Duration::from_secs(cfg.pause_wait_secs);
        } else {
            if !strategies.contains(&ResponseStrategy::SlowDown) {
                strategies.push(ResponseStrategy::SlowDown);
            }
            speed_factor = Some(cfg.slow_down_factor);
        }

        // When everything we would propose is already running, re-applying it
        // cannot help; collapse to a single reset instead.
        let escalation = strategies
            .iter()
            .all(|s| profile.active_mitigations.contains(s));
        if escalation {
            strategies = vec![ResponseStrategy::FullReset];
            wait = Duration::from_secs(cfg.reset_wait_secs);
            speed_factor = None;
        }

        let confidence = self.confidence_for(detection_type, &strategies);
        let estimated_success = self.estimate_success(profile, event, strategies.len(), now);

        for strategy in &strategies {
            profile.active_mitigations.insert(*strategy);
        }
        profile.pending.insert(detection_type, strategies.clone());

        AdaptiveResponse {
            strategies,
            wait,
            speed_factor,
            confidence,
            estimated_success,
            escalation,
        }
    }

    fn confidence_for(
        &self,
        detection_type: DetectionType,
        strategies: &[ResponseStrategy],
    ) -> f64 {
        if strategies.is_empty() {
            return 0.5;
        }
        let saturation = self.inner.config.response.confidence_saturation.max(1) as f64;
        let outcomes = self.inner.outcomes.lock().expect("outcome lock poisoned");
        let total: f64 = strategies
            .iter()
            .map(|strategy| {
                match outcomes.get(&(detection_type, *strategy)) {
                    None => 0.5,
                    Some(history) if history.is_empty() => 0.5,
                    Some(history) => {
                        let samples = history.len() as f64;
                        let successes =
                            history.iter().filter(|&&outcome| outcome).count() as f64;
                        let weight = (samples / saturation).min(1.0);
                        weight * (successes / samples) + (1.0 - weight) * 0.5
                    }
                }
            })
            .sum();
        total / strategies.len() as f64
    }

    fn estimate_success(
        &self,
        profile: &TargetRiskProfile,
        event: &DetectionEvent,
        strategy_count: usize,
        now: DateTime<Utc>,
    ) -> f64 {
        let cfg = &self.inner.config.response;
        let base = 0.7 * (1.0 - event.severity * 0.5);

        let cutoff = now - ChronoDuration::seconds(cfg.recent_window_secs as i64);
        let recent: Vec<f64> = profile.events_since(cutoff).map(|e| e.severity).collect();
        let mut estimate = if recent.is_empty() {
            base
        } else {
            let mean_severity = recent.iter().sum::<f64>() / recent.len() as f64;
            cfg.estimate_base_weight * base
                + (1.0 - cfg.estimate_base_weight) * (1.0 - mean_severity)
        };

        if strategy_count > 1 {
            estimate *= cfg.multi_strategy_boost;
        }
        estimate.clamp(0.0, 1.0)
    }

    /// Record whether the most recently issued response for this (target,
    /// detection type) worked. Success is the only path back to a calmer
    /// state: it clears active mitigations and halves the risk score.
    pub fn record_outcome(&self, target: &str, detection_type: DetectionType, success: bool) {
        let profile_cell = self.profile(target);
        let mut profile = profile_cell.lock().expect("profile lock poisoned");

        let strategies = profile.pending.get(&detection_type).cloned().unwrap_or_default();
        if !strategies.is_empty() {
            let cfg = &self.inner.config.response;
            let mut outcomes = self.inner.outcomes.lock().expect("outcome lock poisoned");
            for strategy in &strategies {
                outcomes
                    .entry((detection_type, *strategy))
                    .or_insert_with(|| {
                        BoundedHistory::with_low_water(cfg.outcome_capacity, cfg.outcome_keep)
                    })
                    .push(success);
            }
        }

        if success {
            profile.active_mitigations.clear();
            profile.pending.remove(&detection_type);
            profile.risk *= 0.5;
            log::debug!("target {}: mitigation succeeded, risk now {:.2}", target, profile.risk);
        }
    }

    /// Historical success rate for a (detection type, strategy) pair.
    pub fn strategy_success_rate(
        &self,
        detection_type: DetectionType,
        strategy: ResponseStrategy,
    ) -> Option<f64> {
        let outcomes = self.inner.outcomes.lock().expect("outcome lock poisoned");
        let history = outcomes.get(&(detection_type, strategy))?;
        if history.is_empty() {
            return None;
        }
        let successes = history.iter().filter(|&&outcome| outcome).count();
        Some(successes as f64 / history.len() as f64)
    }

    /// Risk score with passive decay applied at read time.
    pub fn risk(&self, target: &str) -> f64 {
        self.risk_at(target, Utc::now())
    }

    pub fn risk_at(&self, target: &str, now: DateTime<Utc>) -> f64 {
        let profiles = self.inner.profiles.read().expect("profile lock poisoned");
        match profiles.get(target) {
            None => 0.0,
            Some(cell) => cell
                .lock()
                .expect("profile lock poisoned")
                .decayed_risk(self.inner.config.detection.risk_decay_per_minute, now),
        }
    }

    pub fn snapshot(&self, target: &str) -> Option<RiskSnapshot> {
        let profiles = self.inner.profiles.read().expect("profile lock poisoned");
        let profile = profiles.get(target)?.lock().expect("profile lock poisoned");
        Some(RiskSnapshot {
            target: target.to_string(),
            risk: profile.risk,
            active_mitigations: profile.active_mitigations.iter().copied().collect(),
            common_types: profile.common_types.clone(),
            last_event: profile.last_event,
            event_count: profile.events.len(),
        })
    }

    /// Recent events across all targets (oldest -> newest).
    pub fn recent_events(&self, limit: usize) -> Vec<DetectionEvent> {
        let events = self.inner.events.lock().expect("event lock poisoned");
        let skip = events.len().saturating_sub(limit);
        events.iter().skip(skip).cloned().collect()
    }

    /// Periodic maintenance: recompute per-target commonly-seen detection
    /// types and refresh learned effective-strategy maps from the global
    /// outcome histories. Invoked by the pattern-analysis worker.
    pub fn analyze_patterns(&self) {
        self.analyze_patterns_at(Utc::now());
    }

    pub fn analyze_patterns_at(&self, now: DateTime<Utc>) {
        let learned = self.learned_strategy_map();
        let cutoff = now - ChronoDuration::hours(24);
        let profiles = self.inner.profiles.read().expect("profile lock poisoned");
        for cell in profiles.values() {
            let mut profile = cell.lock().expect("profile lock poisoned");

            let mut counts: HashMap<DetectionType, usize> = HashMap::new();
            for sample in profile.events_since(cutoff) {
                *counts.entry(sample.detection_type).or_default() += 1;
            }
            let mut common: Vec<(DetectionType, usize)> = counts.into_iter().collect();
            common.sort_by(|a, b| b.1.cmp(&a.1));
            profile.common_types = common
                .into_iter()
                .filter(|(_, count)| *count >= 2)
                .take(3)
                .map(|(detection_type, _)| detection_type)
                .collect();

            for (detection_type, strategies) in &learned {
                profile.effective.insert(*detection_type, strategies.clone());
            }
        }
    }

    /// Strategies with a proven track record, ordered best-first per type.
    fn learned_strategy_map(&self) -> HashMap<DetectionType, Vec<ResponseStrategy>> {
        let outcomes = self.inner.outcomes.lock().expect("outcome lock poisoned");
        let mut ranked: HashMap<DetectionType, Vec<(ResponseStrategy, f64)>> = HashMap::new();
        for ((detection_type, strategy), history) in outcomes.iter() {
            if history.len() < 5 {
                continue;
            }
            let rate = history.iter().filter(|&&outcome| outcome).count() as f64
                / history.len() as f64;
            if rate >= 0.5 {
                ranked.entry(*detection_type).or_default().push((*strategy, rate));
            }
        }
        ranked
            .into_iter()
            .map(|(detection_type, mut list)| {
                list.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                (
                    detection_type,
                    list.into_iter().map(|(strategy, _)| strategy).collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn engine() -> ResponseEngine {
        ResponseEngine::new(Arc::new(EngineConfig::default()))
    }

    fn captcha_observation() -> Observation {
        Observation::new().with("page_text", "please solve the captcha")
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 12, 0, 0).unwrap()
    }

    #[test]
    fn low_severity_gets_slow_down() {
        let engine = engine();
        let (event, response) = engine.report_detection_at(
            "ticketek",
            &captcha_observation(),
            &SessionContext::default(),
            base_time(),
        );
        assert_eq!(event.detection_type, DetectionType::Captcha);
        assert!(event.severity <= 0.6);
        assert!(response.strategies.contains(&ResponseStrategy::SlowDown));
        assert_eq!(response.speed_factor, Some(0.5));
        assert!(!response.escalation);
    }

    #[test]
    fn hard_block_forces_full_reset_and_wait() {
        let engine = engine();
        let observation = captcha_observation().with("hard_block", true);
        let (event, response) = engine.report_detection_at(
            "ticketek",
            &observation,
            &SessionContext::default(),
            base_time(),
        );
        assert!(event.severity > 0.8);
        assert!(response.strategies.contains(&ResponseStrategy::FullReset));
        assert_eq!(response.wait, Duration::from_secs(300));
    }

    #[test]
    fn repeated_events_collapse_to_escalation() {
        let engine = engine();
        let session = SessionContext::default();
        let mut escalated = false;
        for i in 0..5 {
            let now = base_time() + ChronoDuration::seconds(i * 10);
            let (_, response) =
                engine.report_detection_at("ticketek", &captcha_observation(), &session, now);
            if response.escalation {
                assert_eq!(response.strategies, vec![ResponseStrategy::FullReset]);
                escalated = true;
                break;
            }
        }
        assert!(escalated, "strategy accumulation never collapsed to a reset");
    }

    #[test]
    fn success_clears_mitigations_and_halves_risk() {
        let engine = engine();
        let session = SessionContext::default();
        let now = base_time();
        engine.report_detection_at("ticketek", &captcha_observation(), &session, now);
        let risk_before = engine.risk_at("ticketek", now);
        assert!(risk_before > 0.0);

        engine.record_outcome("ticketek", DetectionType::Captcha, true);
        let snapshot = engine.snapshot("ticketek").unwrap();
        assert!(snapshot.active_mitigations.is_empty());
        assert!((snapshot.risk - risk_before * 0.5).abs() < 1e-9);
    }

    #[test]
    fn risk_decays_monotonically_without_events() {
        let engine = engine();
        let now = base_time();
        engine.report_detection_at(
            "ticketek",
            &captcha_observation().with("hard_block", true),
            &SessionContext::default(),
            now,
        );
        let mut previous = f64::MAX;
        for minutes in [1i64, 10, 60, 600] {
            let risk = engine.risk_at("ticketek", now + ChronoDuration::minutes(minutes));
            assert!(risk < previous, "risk should strictly decay");
            assert!(risk > 0.0);
            previous = risk;
        }
    }

    #[test]
    fn ema_risk_matches_three_event_scenario() {
        // Sensitivity 0.7, three captcha events inside 2 minutes. Severities
        // follow the classifier (0.35 base, then recent boosts), and risk is
        // the 0.3-EMA of those severities with sub-2-minute decay.
        let mut config = EngineConfig::default();
        config.targets.insert(
            "target-a".into(),
            crate::config::TargetConfig {
                sensitivity: 0.7,
                ..Default::default()
            },
        );
        let engine = ResponseEngine::new(Arc::new(config));
        let session = SessionContext::default();
        let t0 = base_time();

        let severities: Vec<f64> = (0..3)
            .map(|i| {
                let now = t0 + ChronoDuration::seconds(i * 60);
                let (event, _) = engine.report_detection_at(
                    "target-a",
                    &captcha_observation(),
                    &session,
                    now,
                );
                event.severity
            })
            .collect();
        assert!((severities[0] - 0.35).abs() < 1e-9);
        assert!((severities[1] - 0.45).abs() < 1e-9);
        assert!((severities[2] - 0.55).abs() < 1e-9);

        let mut expected = 0.0;
        for (i, severity) in severities.iter().enumerate() {
            expected = 0.7 * expected + 0.3 * severity;
            if i > 0 {
                expected *= 0.99f64.powf(1.0);
            }
        }
        let risk = engine.risk_at("target-a", t0 + ChronoDuration::seconds(120));
        assert!((risk - expected).abs() < 0.01, "risk {} vs expected {}", risk, expected);
    }

    #[test]
    fn confidence_defaults_to_half_without_history() {
        let engine = engine();
        let (_, response) = engine.report_detection_at(
            "fresh-target",
            &captcha_observation(),
            &SessionContext::default(),
            base_time(),
        );
        assert!((response.confidence - 0.5).abs() < 1e-9);
    }

    #[test]
    fn outcome_history_shapes_confidence_and_learning() {
        let engine = engine();
        let session = SessionContext::default();
        for i in 0..10 {
            let now = base_time() + ChronoDuration::minutes(i * 30);
            engine.report_detection_at("ticketek", &captcha_observation(), &session, now);
            engine.record_outcome("ticketek", DetectionType::Captcha, true);
        }
        let rate = engine
            .strategy_success_rate(DetectionType::Captcha, ResponseStrategy::EnhanceBehavior)
            .unwrap();
        assert!((rate - 1.0).abs() < 1e-9);

        engine.analyze_patterns_at(base_time() + ChronoDuration::hours(5));
        let snapshot = engine.snapshot("ticketek").unwrap();
        assert!(snapshot.common_types.contains(&DetectionType::Captcha));
    }
}
