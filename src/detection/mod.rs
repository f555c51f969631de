//! Detection signal classification.
//!
//! Turns the free-form observation bundles reported by the probe driver into
//! typed detection events with a severity score. Classification is keyword
//! and flag based against the bundle's textual representation, evaluated in a
//! fixed priority order.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::config::DetectionConfig;

/// Closed set of detection signal categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    Captcha,
    RateLimit,
    Fingerprint,
    IpBlock,
    SessionInvalid,
    Behavior,
    Unknown,
}

impl DetectionType {
    pub const ALL: [DetectionType; 7] = [
        DetectionType::Captcha,
        DetectionType::RateLimit,
        DetectionType::Fingerprint,
        DetectionType::IpBlock,
        DetectionType::SessionInvalid,
        DetectionType::Behavior,
        DetectionType::Unknown,
    ];
}

/// Free-form key/value bundle reported by the probe driver.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    values: HashMap<String, Value>,
}

impl Observation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// True when the key is present and truthy.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.values.get(key), Some(Value::Bool(true)))
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    /// Lowercase haystack of keys and scalar values used for keyword
    /// matching. False flags and nulls contribute nothing; nested structures
    /// contribute their JSON rendering.
    pub fn text(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(self.values.len() * 2);
        for (key, value) in &self.values {
            match value {
                Value::Bool(false) | Value::Null => continue,
                Value::Bool(true) => parts.push(key.to_lowercase()),
                Value::String(s) => {
                    parts.push(key.to_lowercase());
                    parts.push(s.to_lowercase());
                }
                other => {
                    parts.push(key.to_lowercase());
                    parts.push(other.to_string().to_lowercase());
                }
            }
        }
        parts.join(" ")
    }
}

/// Session attribution attached to a classified event.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub session_id: Option<String>,
    pub proxy: Option<String>,
    pub identity: Option<String>,
}

/// Immutable record of one classified detection signal.
#[derive(Debug, Clone)]
pub struct DetectionEvent {
    pub at: DateTime<Utc>,
    pub target: String,
    pub detection_type: DetectionType,
    pub severity: f64,
    pub context: HashMap<String, Value>,
    pub session_id: Option<String>,
    pub proxy: Option<String>,
    pub identity: Option<String>,
}

fn build_regex(pattern: &str) -> Regex {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid detection keyword regex `{}`: {}", pattern, err))
}

/// Keyword table in classification priority order. Earlier rows win.
static KEYWORD_TABLE: Lazy<Vec<(DetectionType, Regex)>> = Lazy::new(|| {
    vec![
        (
            DetectionType::Captcha,
            build_regex(r"captcha|recaptcha|hcaptcha|turnstile|challenge|verify.{0,12}human|puzzle"),
        ),
        (
            DetectionType::RateLimit,
            build_regex(r"rate.?limit|too many requests|throttl|slow down|\b429\b"),
        ),
        (
            DetectionType::IpBlock,
            build_regex(r"access denied|forbidden|block(?:ed)?\b|ip.?ban|\b403\b|\b1020\b"),
        ),
        (
            DetectionType::SessionInvalid,
            build_regex(r"session.{0,10}(?:expired|invalid)|logged out|sign in again|invalid.{0,10}cookie|csrf"),
        ),
        (
            DetectionType::Fingerprint,
            build_regex(r"fingerprint|webdriver|headless|automation|device.?check"),
        ),
        (
            DetectionType::Behavior,
            build_regex(r"unusual (?:activity|traffic)|suspicious|behaviou?r|velocity"),
        ),
    ]
});

/// Keyword/flag classifier producing detection events.
#[derive(Debug, Clone)]
pub struct DetectionClassifier {
    config: DetectionConfig,
}

impl DetectionClassifier {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    /// Map an observation bundle onto the detection taxonomy.
    pub fn classify_type(&self, observation: &Observation) -> DetectionType {
        let haystack = observation.text();
        for (detection_type, pattern) in KEYWORD_TABLE.iter() {
            if pattern.is_match(&haystack) {
                return *detection_type;
            }
        }
        DetectionType::Unknown
    }

    /// Severity in [0, 1]: sensitivity-scaled base, floored/ceiled by the
    /// explicit block flags, then boosted by recent pressure on the target.
    pub fn severity(
        &self,
        observation: &Observation,
        sensitivity: f64,
        recent_detections: usize,
    ) -> f64 {
        let mut severity = self.config.base_severity * sensitivity;
        if observation.flag("hard_block") {
            severity = severity.max(self.config.hard_block_floor);
        }
        if observation.flag("soft_challenge") {
            severity = severity.min(self.config.soft_challenge_ceiling);
        }
        severity += self.config.recent_boost * recent_detections as f64;
        severity.clamp(0.0, 1.0)
    }

    /// Build the full event record for a classified signal.
    pub fn classify(
        &self,
        target: &str,
        observation: &Observation,
        sensitivity: f64,
        recent_detections: usize,
        session: &SessionContext,
        now: DateTime<Utc>,
    ) -> DetectionEvent {
        let detection_type = self.classify_type(observation);
        let severity = self.severity(observation, sensitivity, recent_detections);
        DetectionEvent {
            at: now,
            target: target.to_string(),
            detection_type,
            severity,
            context: observation.values().clone(),
            session_id: session.session_id.clone(),
            proxy: session.proxy.clone(),
            identity: session.identity.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> DetectionClassifier {
        DetectionClassifier::new(DetectionConfig::default())
    }

    #[test]
    fn classifies_by_priority_order() {
        let c = classifier();

        let obs = Observation::new().with("page_text", "please solve the reCAPTCHA to continue");
        assert_eq!(c.classify_type(&obs), DetectionType::Captcha);

        // Captcha terms outrank rate-limit terms when both appear.
        let obs = Observation::new().with("page_text", "captcha shown after rate limit");
        assert_eq!(c.classify_type(&obs), DetectionType::Captcha);

        let obs = Observation::new().with("status_text", "429 too many requests");
        assert_eq!(c.classify_type(&obs), DetectionType::RateLimit);

        let obs = Observation::new().with("page_text", "Access denied (error 1020)");
        assert_eq!(c.classify_type(&obs), DetectionType::IpBlock);

        let obs = Observation::new().with("page_text", "your session expired, sign in again");
        assert_eq!(c.classify_type(&obs), DetectionType::SessionInvalid);

        let obs = Observation::new().with("page_text", "webdriver attribute present");
        assert_eq!(c.classify_type(&obs), DetectionType::Fingerprint);

        let obs = Observation::new().with("reason", "unusual activity from your network");
        assert_eq!(c.classify_type(&obs), DetectionType::Behavior);

        let obs = Observation::new().with("page_text", "nothing to see here");
        assert_eq!(c.classify_type(&obs), DetectionType::Unknown);
    }

    #[test]
    fn flag_keys_participate_in_matching() {
        let c = classifier();
        let obs = Observation::new().with("hard_block", true);
        assert_eq!(c.classify_type(&obs), DetectionType::IpBlock);
    }

    #[test]
    fn severity_respects_flags_and_boost() {
        let c = classifier();

        let plain = Observation::new().with("page_text", "captcha");
        assert!((c.severity(&plain, 1.0, 0) - 0.5).abs() < 1e-9);
        assert!((c.severity(&plain, 0.7, 0) - 0.35).abs() < 1e-9);

        let hard = Observation::new().with("page_text", "captcha").with("hard_block", true);
        assert!(c.severity(&hard, 0.7, 0) >= 0.9);

        let soft = Observation::new()
            .with("page_text", "captcha")
            .with("soft_challenge", true);
        assert!(c.severity(&soft, 1.5, 0) <= 0.6);

        // Three recent detections push severity up by 0.3, capped at 1.0.
        assert!((c.severity(&plain, 1.0, 3) - 0.8).abs() < 1e-9);
        assert!((c.severity(&hard, 1.0, 12) - 1.0).abs() < 1e-9);
    }
}
