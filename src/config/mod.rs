//! Engine configuration.
//!
//! Every tuning constant the engines consume lives here with a serde-derived
//! struct and a `Default`, so the external config loader can overlay values
//! from TOML/JSON without the engines hard-coding magic numbers. The defaults
//! are operational starting points, not correctness constants.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::detection::DetectionType;
use crate::response::ResponseStrategy;

/// Per-target priors supplied by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Detection sensitivity multiplier applied to base severity.
    pub sensitivity: f64,
    /// Known-effective strategies per detection type, if the operator has
    /// prior experience with this target.
    #[serde(default)]
    pub strategy_priors: HashMap<DetectionType, Vec<ResponseStrategy>>,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            sensitivity: 1.0,
            strategy_priors: HashMap::new(),
        }
    }
}

/// Detection classification and risk scoring knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Base severity before sensitivity scaling.
    pub base_severity: f64,
    /// Severity floor applied when the bundle carries a hard block flag.
    pub hard_block_floor: f64,
    /// Severity ceiling applied when the bundle carries a soft challenge flag.
    pub soft_challenge_ceiling: f64,
    /// Severity boost per recent detection on the same target.
    pub recent_boost: f64,
    /// Window defining "recent" for the boost, in seconds.
    pub recent_window_secs: u64,
    /// EMA weight for new severities entering the risk score.
    pub risk_alpha: f64,
    /// Per-minute multiplicative risk decay base.
    pub risk_decay_per_minute: f64,
    /// Capacity of the global detection event ring.
    pub event_history_capacity: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            base_severity: 0.5,
            hard_block_floor: 0.9,
            soft_challenge_ceiling: 0.6,
            recent_boost: 0.1,
            recent_window_secs: 600,
            risk_alpha: 0.3,
            risk_decay_per_minute: 0.99,
            event_history_capacity: 10_000,
        }
    }
}

/// Response strategy selection knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseConfig {
    /// Severity above which a full reset is forced.
    pub reset_threshold: f64,
    /// Severity above which a session pause is forced.
    pub pause_threshold: f64,
    /// Wait issued alongside a forced full reset, in seconds.
    pub reset_wait_secs: u64,
    /// Wait issued alongside a forced pause, in seconds.
    pub pause_wait_secs: u64,
    /// Speed factor issued with the low-severity slow-down.
    pub slow_down_factor: f64,
    /// Outcome history capacity per (detection type, strategy) pair.
    pub outcome_capacity: usize,
    /// Entries kept when an outcome history overflows.
    pub outcome_keep: usize,
    /// Sample count at which historical confidence is fully trusted.
    pub confidence_saturation: usize,
    /// Weight of the severity-derived base in the estimated success blend.
    pub estimate_base_weight: f64,
    /// Boost applied when more than one strategy is proposed.
    pub multi_strategy_boost: f64,
    /// Window for the recent non-severity average, in seconds.
    pub recent_window_secs: u64,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            reset_threshold: 0.8,
            pause_threshold: 0.6,
            reset_wait_secs: 300,
            pause_wait_secs: 60,
            slow_down_factor: 0.5,
            outcome_capacity: 100,
            outcome_keep: 50,
            confidence_saturation: 10,
            estimate_base_weight: 0.3,
            multi_strategy_boost: 1.1,
            recent_window_secs: 3600,
        }
    }
}

/// Proxy kind as provisioned by the pool supplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyKind {
    Residential,
    Datacenter,
    Mobile,
}

/// One pool member as declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyDefinition {
    pub address: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub provider: String,
    #[serde(default)]
    pub location: Option<String>,
    pub kind: ProxyKind,
    /// Cost per request in the provider's billing unit.
    #[serde(default)]
    pub cost_per_request: f64,
}

/// Proxy filtering, scoring, and learning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Pool definitions loaded at startup.
    #[serde(default)]
    pub pool: Vec<ProxyDefinition>,
    /// Maximum consecutive failures before a proxy leaves the candidate set.
    pub max_consecutive_failures: u32,
    /// Minimum health score for candidacy.
    pub min_health: f64,
    /// Recent-failure exclusion window, in seconds.
    pub failure_window_secs: u64,
    /// Consecutive failures that trigger the recent-failure exclusion.
    pub failure_window_threshold: u32,
    /// Per-target detection rate above which a proxy is excluded for that
    /// target, once enough observations exist.
    pub max_target_detection_rate: f64,
    /// Observations required before the per-target exclusion applies.
    pub target_rate_min_observations: u32,
    /// EMA weight for per-target success/detection rates.
    pub target_rate_alpha: f64,
    /// Rolling response-time window capacity.
    pub latency_window: usize,
    /// Candidates entering the weighted-random draw.
    pub selection_pool: usize,
    /// Locale match score bonus.
    pub locale_bonus: f64,
    /// Residential bonus for high-priority requests.
    pub residential_bonus: f64,
    /// Datacenter bonus for low-priority requests.
    pub datacenter_bonus: f64,
    /// Weight of the heuristic score when blending with the learned model.
    pub heuristic_blend: f64,
    /// Training samples required before the learned model participates.
    pub min_training_samples: usize,
    /// Training sample buffer capacity.
    pub training_capacity: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            pool: Vec::new(),
            max_consecutive_failures: 5,
            min_health: 0.3,
            failure_window_secs: 300,
            failure_window_threshold: 2,
            max_target_detection_rate: 0.7,
            target_rate_min_observations: 10,
            target_rate_alpha: 0.1,
            latency_window: 100,
            selection_pool: 5,
            locale_bonus: 1.2,
            residential_bonus: 1.3,
            datacenter_bonus: 1.1,
            heuristic_blend: 0.6,
            min_training_samples: 100,
            training_capacity: 10_000,
        }
    }
}

/// Scheduler intervals and modifiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Base interval per activity level, in seconds.
    pub dead_interval_secs: u64,
    pub low_interval_secs: u64,
    pub normal_interval_secs: u64,
    pub high_interval_secs: u64,
    pub critical_interval_secs: u64,
    /// Inclusive start / exclusive end of the global quiet window (UTC hour).
    pub quiet_start_hour: u32,
    pub quiet_end_hour: u32,
    /// Multiplier applied inside quiet hours.
    pub quiet_multiplier: f64,
    /// Globally configured peak hours (UTC) and their multiplier.
    #[serde(default)]
    pub peak_hours: Vec<u32>,
    pub peak_multiplier: f64,
    /// Per-target learned peak-hour / peak-day multipliers.
    pub target_peak_hour_multiplier: f64,
    pub target_peak_day_multiplier: f64,
    /// Forecast window for predictive tightening, in seconds.
    pub forecast_window_secs: u64,
    /// Predictive tightening strength and time constant.
    pub tighten_strength: f64,
    pub tighten_tau_secs: f64,
    /// Jitter applied to the drop forecast, as a fraction.
    pub forecast_jitter: f64,
    /// EMA weight for inter-drop interval learning.
    pub interval_alpha: f64,
    /// Inter-drop interval sample capacity.
    pub interval_window: usize,
    /// Check log capacity per target.
    pub check_window: usize,
    /// Hard bounds on computed intervals, in seconds.
    pub min_interval_secs: u64,
    pub max_interval_secs: u64,
    /// Burst window duration after a positive detection, in seconds.
    pub burst_secs: u64,
    /// "Drop imminent" horizon for the check-now override, in seconds.
    pub imminent_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            dead_interval_secs: 300,
            low_interval_secs: 120,
            normal_interval_secs: 60,
            high_interval_secs: 30,
            critical_interval_secs: 10,
            quiet_start_hour: 0,
            quiet_end_hour: 6,
            quiet_multiplier: 3.0,
            peak_hours: Vec::new(),
            peak_multiplier: 0.7,
            target_peak_hour_multiplier: 0.5,
            target_peak_day_multiplier: 0.8,
            forecast_window_secs: 600,
            tighten_strength: 0.8,
            tighten_tau_secs: 300.0,
            forecast_jitter: 0.2,
            interval_alpha: 0.3,
            interval_window: 100,
            check_window: 500,
            min_interval_secs: 10,
            max_interval_secs: 600,
            burst_secs: 300,
            imminent_secs: 300,
        }
    }
}

/// Multi-agent coordination knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Minimum spacing between one identity's own checks, in seconds.
    pub minimum_spacing_secs: u64,
    /// Offset spread ceiling, in seconds.
    pub max_offset_secs: u64,
    /// Jitter added to each offset, in seconds.
    pub offset_jitter_secs: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            minimum_spacing_secs: 5,
            max_offset_secs: 30,
            offset_jitter_secs: 2.0,
        }
    }
}

/// Background worker cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub health_check_secs: u64,
    /// Proxies sampled per health-check round.
    pub health_check_sample: usize,
    pub retrain_secs: u64,
    pub analysis_secs: u64,
    /// Optional periodic snapshot destination; disabled when `None`.
    #[serde(default)]
    pub snapshot_path: Option<String>,
    pub snapshot_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 120,
            health_check_sample: 5,
            retrain_secs: 600,
            analysis_secs: 300,
            snapshot_path: None,
            snapshot_secs: 900,
        }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub targets: HashMap<String, TargetConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub response: ResponseConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub workers: WorkerConfig,
}

impl EngineConfig {
    /// Sensitivity prior for a target, defaulting to neutral.
    pub fn sensitivity(&self, target: &str) -> f64 {
        self.targets
            .get(target)
            .map(|t| t.sensitivity)
            .unwrap_or(1.0)
    }

    pub fn strategy_priors(
        &self,
        target: &str,
    ) -> Option<&HashMap<DetectionType, Vec<ResponseStrategy>>> {
        self.targets.get(target).map(|t| &t.strategy_priors)
    }
}
