//! Multi-identity check coordination.
//!
//! Spreads concurrent identities' check times across the base interval so
//! they never synchronize into request bursts, and gates admissions so only
//! a fraction of the fleet hits a target within any spacing window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::Rng;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::CoordinatorConfig;

#[derive(Debug, Default)]
struct AgentState {
    last_check: Option<DateTime<Utc>>,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    agents: Mutex<HashMap<String, AgentState>>,
}

/// Admission control and phase-spreading for a fleet of identities.
#[derive(Clone)]
pub struct AgentCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl AgentCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                config,
                agents: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn register(&self, identity: &str) {
        self.inner
            .agents
            .lock()
            .expect("agent lock poisoned")
            .entry(identity.to_string())
            .or_default();
    }

    pub fn deregister(&self, identity: &str) {
        self.inner
            .agents
            .lock()
            .expect("agent lock poisoned")
            .remove(identity);
    }

    pub fn agent_count(&self) -> usize {
        self.inner.agents.lock().expect("agent lock poisoned").len()
    }

    /// Stable phase offset for an identity within the fleet, plus jitter.
    /// Identity `i` of `n` lands at `(hash(i) mod n)/(n-1)` of the spread,
    /// which is capped at half the base interval or the configured ceiling.
    pub fn offset_for(&self, identity: &str, base_interval: Duration) -> Duration {
        let n = self.agent_count().max(1);
        let spread = (base_interval.as_secs_f64() * 0.5)
            .min(self.inner.config.max_offset_secs as f64);
        let position = if n <= 1 {
            0.0
        } else {
            let mut hasher = DefaultHasher::new();
            identity.hash(&mut hasher);
            (hasher.finish() % n as u64) as f64 / (n - 1) as f64
        };
        let jitter_bound = self.inner.config.offset_jitter_secs;
        let jitter = if jitter_bound > 0.0 {
            rand::thread_rng().gen_range(-jitter_bound..=jitter_bound)
        } else {
            0.0
        };
        Duration::from_secs_f64((position * spread + jitter).max(0.0))
    }

    /// Admission gate: grants the check slot when the identity has waited
    /// out its own spacing and the fleet is not already crowding the window.
    /// A granted admission records the check time.
    pub fn try_admit(&self, identity: &str) -> bool {
        self.try_admit_at(identity, Utc::now())
    }

    pub fn try_admit_at(&self, identity: &str, now: DateTime<Utc>) -> bool {
        let spacing = ChronoDuration::seconds(self.inner.config.minimum_spacing_secs as i64);
        let mut agents = self.inner.agents.lock().expect("agent lock poisoned");
        agents.entry(identity.to_string()).or_default();

        let n = agents.len();
        if let Some(own) = agents.get(identity).and_then(|a| a.last_check) {
            if now - own < spacing {
                return false;
            }
        }

        let concurrent_limit = (n / 3).max(1);
        let recent_others = agents
            .iter()
            .filter(|(name, state)| {
                name.as_str() != identity
                    && state
                        .last_check
                        .map(|at| now - at < spacing)
                        .unwrap_or(false)
            })
            .count();
        if recent_others >= concurrent_limit {
            return false;
        }

        if let Some(state) = agents.get_mut(identity) {
            state.last_check = Some(now);
        }
        true
    }

    /// Record an externally scheduled check without going through the gate.
    pub fn mark_checked_at(&self, identity: &str, at: DateTime<Utc>) {
        let mut agents = self.inner.agents.lock().expect("agent lock poisoned");
        agents.entry(identity.to_string()).or_default().last_check = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
    }

    fn coordinator(jitter: f64) -> AgentCoordinator {
        AgentCoordinator::new(CoordinatorConfig {
            offset_jitter_secs: jitter,
            ..Default::default()
        })
    }

    #[test]
    fn offsets_spread_within_half_interval() {
        let coordinator = coordinator(0.0);
        for i in 0..10 {
            coordinator.register(&format!("agent-{}", i));
        }
        let base = Duration::from_secs(40);
        for i in 0..10 {
            let offset = coordinator.offset_for(&format!("agent-{}", i), base);
            assert!(offset <= Duration::from_secs(20), "{:?}", offset);
        }
    }

    #[test]
    fn offset_capped_at_ceiling_for_long_intervals() {
        let coordinator = coordinator(0.0);
        for i in 0..4 {
            coordinator.register(&format!("agent-{}", i));
        }
        let base = Duration::from_secs(600);
        for i in 0..4 {
            let offset = coordinator.offset_for(&format!("agent-{}", i), base);
            assert!(offset <= Duration::from_secs(30), "{:?}", offset);
        }
    }

    #[test]
    fn own_spacing_is_enforced() {
        let coordinator = coordinator(0.0);
        coordinator.register("a");
        let t0 = base_time();
        assert!(coordinator.try_admit_at("a", t0));
        assert!(!coordinator.try_admit_at("a", t0 + ChronoDuration::seconds(3)));
        assert!(coordinator.try_admit_at("a", t0 + ChronoDuration::seconds(5)));
    }

    #[test]
    fn crowded_window_rejects_admission() {
        let coordinator = coordinator(0.0);
        for name in ["a", "b", "c", "d", "e", "f"] {
            coordinator.register(name);
        }
        let t0 = base_time();
        // 6 agents: at most max(1, 6/3) = 2 peers per spacing window.
        assert!(coordinator.try_admit_at("a", t0));
        assert!(coordinator.try_admit_at("b", t0 + ChronoDuration::seconds(1)));
        assert!(!coordinator.try_admit_at("c", t0 + ChronoDuration::seconds(2)));
        // Once the window drains, admissions resume.
        assert!(coordinator.try_admit_at("c", t0 + ChronoDuration::seconds(7)));
    }

    #[test]
    fn deregistered_agents_stop_counting() {
        let coordinator = coordinator(0.0);
        for name in ["a", "b", "c"] {
            coordinator.register(name);
        }
        assert_eq!(coordinator.agent_count(), 3);
        coordinator.deregister("c");
        assert_eq!(coordinator.agent_count(), 2);
    }
}
