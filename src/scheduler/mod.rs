//! Adaptive check-interval scheduling.
//!
//! Learns per-target temporal patterns (peak hours and days, inter-drop
//! intervals) and turns them into the next polling interval. A positive
//! detection opens a burst window during which the target is polled at the
//! critical rate regardless of any other factor.

pub mod coordinator;

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use crate::config::SchedulerConfig;
use crate::history::BoundedHistory;
use crate::proxy::Priority;

/// How alive a target currently looks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityLevel {
    Dead,
    Low,
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy)]
struct CheckSample {
    at: DateTime<Utc>,
    positive: bool,
}

/// Learned temporal state for one target.
#[derive(Debug)]
struct TargetPattern {
    peak_hours: HashSet<u32>,
    peak_days: HashSet<u32>,
    intervals: BoundedHistory<f64>,
    avg_interval: Option<f64>,
    last_drop: Option<DateTime<Utc>>,
    drops: BoundedHistory<DateTime<Utc>>,
    checks: BoundedHistory<CheckSample>,
    total_checks: u64,
    positive_checks: u64,
}

impl TargetPattern {
    fn new(config: &SchedulerConfig) -> Self {
        Self {
            peak_hours: HashSet::new(),
            peak_days: HashSet::new(),
            intervals: BoundedHistory::new(config.interval_window),
            avg_interval: None,
            last_drop: None,
            drops: BoundedHistory::new(config.interval_window),
            checks: BoundedHistory::new(config.check_window),
            total_checks: 0,
            positive_checks: 0,
        }
    }

    /// Record a positive detection and fold the inter-drop gap into the
    /// exponentially weighted average.
    fn update_drop_time(&mut self, alpha: f64, now: DateTime<Utc>) {
        if let Some(previous) = self.last_drop {
            let gap = (now - previous).num_milliseconds().max(0) as f64 / 1000.0;
            if gap > 0.0 {
                self.intervals.push(gap);
                self.avg_interval = Some(match self.avg_interval {
                    None => gap,
                    Some(avg) => (1.0 - alpha) * avg + alpha * gap,
                });
            }
        }
        self.last_drop = Some(now);
        self.drops.push(now);
    }

    fn activity_at(&self, now: DateTime<Utc>) -> ActivityLevel {
        let hour_ago = now - ChronoDuration::hours(1);
        let recent: Vec<&CheckSample> =
            self.checks.iter().filter(|c| c.at >= hour_ago).collect();
        if recent.is_empty() {
            let hours_since_drop = match self.last_drop {
                None => f64::INFINITY,
                Some(at) => (now - at).num_seconds().max(0) as f64 / 3600.0,
            };
            return if hours_since_drop > 24.0 {
                ActivityLevel::Dead
            } else if hours_since_drop > 6.0 {
                ActivityLevel::Low
            } else {
                ActivityLevel::Normal
            };
        }
        let positives = recent.iter().filter(|c| c.positive).count() as f64;
        let ratio = positives / recent.len() as f64;
        if ratio > 0.5 {
            ActivityLevel::High
        } else if ratio > 0.1 {
            ActivityLevel::Normal
        } else {
            ActivityLevel::Low
        }
    }

    fn success_rate(&self) -> f64 {
        if self.total_checks == 0 {
            0.0
        } else {
            self.positive_checks as f64 / self.total_checks as f64
        }
    }
}

/// Read-only pattern view for dashboards.
#[derive(Debug, Clone)]
pub struct PatternSnapshot {
    pub target: String,
    pub activity: ActivityLevel,
    pub peak_hours: Vec<u32>,
    pub peak_days: Vec<u32>,
    pub avg_interval_secs: Option<f64>,
    pub last_drop: Option<DateTime<Utc>>,
    pub total_checks: u64,
    pub positive_checks: u64,
    pub burst_active: bool,
}

/// Serializable per-target state for snapshot export/import.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternExport {
    pub target: String,
    pub peak_hours: Vec<u32>,
    pub peak_days: Vec<u32>,
    #[serde(default)]
    pub avg_interval_secs: Option<f64>,
    #[serde(default)]
    pub last_drop: Option<DateTime<Utc>>,
    pub interval_samples: Vec<f64>,
    pub total_checks: u64,
    pub positive_checks: u64,
    pub success_rate: f64,
}

struct SchedulerInner {
    config: SchedulerConfig,
    patterns: RwLock<HashMap<String, Arc<Mutex<TargetPattern>>>>,
    bursts: Mutex<HashMap<String, DateTime<Utc>>>,
}

/// Thread-safe adaptive interval scheduler.
#[derive(Clone)]
pub struct AdaptiveScheduler {
    inner: Arc<SchedulerInner>,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                patterns: RwLock::new(HashMap::new()),
                bursts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn pattern(&self, target: &str) -> Arc<Mutex<TargetPattern>> {
        if let Some(pattern) = self
            .inner
            .patterns
            .read()
            .expect("pattern lock poisoned")
            .get(target)
        {
            return Arc::clone(pattern);
        }
        let mut guard = self.inner.patterns.write().expect("pattern lock poisoned");
        Arc::clone(
            guard
                .entry(target.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(TargetPattern::new(&self.inner.config)))),
        )
    }

    /// Record one probe result. A positive signal count updates the learned
    /// drop distribution and opens the burst window.
    pub fn record_check(&self, target: &str, success: bool, positive_signals: u32) {
        self.record_check_at(target, success, positive_signals, Utc::now());
    }

    pub fn record_check_at(
        &self,
        target: &str,
        success: bool,
        positive_signals: u32,
        now: DateTime<Utc>,
    ) {
        let positive = positive_signals > 0;
        let pattern_cell = self.pattern(target);
        {
            let mut pattern = pattern_cell.lock().expect("pattern lock poisoned");
            pattern.checks.push(CheckSample { at: now, positive });
            pattern.total_checks += 1;
            if positive {
                pattern.positive_checks += 1;
                pattern.update_drop_time(self.inner.config.interval_alpha, now);
            } else if !success {
                log::trace!("check failed for {}", target);
            }
        }
        if positive {
            self.open_burst(target, now);
        }
    }

    fn open_burst(&self, target: &str, now: DateTime<Utc>) {
        let mut bursts = self.inner.bursts.lock().expect("burst lock poisoned");
        bursts.insert(target.to_string(), now);
        log::info!("burst window opened for {}", target);
    }

    /// Whether the target is inside an active burst window. Expired entries
    /// are removed lazily.
    pub fn burst_active(&self, target: &str, now: DateTime<Utc>) -> bool {
        let mut bursts = self.inner.bursts.lock().expect("burst lock poisoned");
        match bursts.get(target) {
            None => false,
            Some(opened) => {
                let elapsed = (now - *opened).num_seconds();
                if elapsed >= 0 && (elapsed as u64) < self.inner.config.burst_secs {
                    true
                } else {
                    bursts.remove(target);
                    false
                }
            }
        }
    }

    /// Forecast the next drop from the learned inter-drop average, with
    /// jitter so coordinated monitors don't all tighten at the same instant.
    fn forecast_next_drop(&self, pattern: &TargetPattern) -> Option<DateTime<Utc>> {
        let last = pattern.last_drop?;
        let avg = pattern.avg_interval?;
        let jitter = self.inner.config.forecast_jitter;
        let factor = if jitter > 0.0 {
            rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter)
        } else {
            1.0
        };
        let secs = (avg * factor).max(1.0);
        Some(last + ChronoDuration::milliseconds((secs * 1000.0) as i64))
    }

    fn any_recent_drop(&self, now: DateTime<Utc>) -> bool {
        let cutoff = now - ChronoDuration::hours(1);
        let patterns = self.inner.patterns.read().expect("pattern lock poisoned");
        patterns.values().any(|cell| {
            cell.lock()
                .expect("pattern lock poisoned")
                .last_drop
                .map(|at| at >= cutoff)
                .unwrap_or(false)
        })
    }

    fn base_interval(&self, activity: ActivityLevel) -> f64 {
        let cfg = &self.inner.config;
        let secs = match activity {
            ActivityLevel::Dead => cfg.dead_interval_secs,
            ActivityLevel::Low => cfg.low_interval_secs,
            ActivityLevel::Normal => cfg.normal_interval_secs,
            ActivityLevel::High => cfg.high_interval_secs,
            ActivityLevel::Critical => cfg.critical_interval_secs,
        };
        secs as f64
    }

    fn in_quiet_hours(&self, hour: u32) -> bool {
        let cfg = &self.inner.config;
        if cfg.quiet_start_hour <= cfg.quiet_end_hour {
            (cfg.quiet_start_hour..cfg.quiet_end_hour).contains(&hour)
        } else {
            hour >= cfg.quiet_start_hour || hour < cfg.quiet_end_hour
        }
    }

    /// Seconds until the next check for this target.
    pub fn next_interval(&self, target: &str, priority: Priority) -> Duration {
        self.next_interval_at(target, priority, Utc::now())
    }

    pub fn next_interval_at(
        &self,
        target: &str,
        priority: Priority,
        now: DateTime<Utc>,
    ) -> Duration {
        let cfg = &self.inner.config;
        if self.burst_active(target, now) {
            return Duration::from_secs(cfg.critical_interval_secs);
        }

        let hour = now.hour();
        // Resolved before taking the target's pattern lock: the recent-drop
        // scan walks every pattern cell.
        let quiet = self.in_quiet_hours(hour) && !self.any_recent_drop(now);

        let pattern_cell = self.pattern(target);
        let pattern = pattern_cell.lock().expect("pattern lock poisoned");

        let mut interval = self.base_interval(pattern.activity_at(now));

        if quiet {
            interval *= cfg.quiet_multiplier;
        }
        if cfg.peak_hours.contains(&hour) {
            interval *= cfg.peak_multiplier;
        }
        if pattern.peak_hours.contains(&hour) {
            interval *= cfg.target_peak_hour_multiplier;
        }
        if pattern.peak_days.contains(&now.weekday().num_days_from_monday()) {
            interval *= cfg.target_peak_day_multiplier;
        }

        if let Some(predicted) = self.forecast_next_drop(&pattern) {
            let until = (predicted - now).num_seconds();
            if until >= 0 && (until as u64) <= cfg.forecast_window_secs {
                let factor =
                    1.0 - cfg.tighten_strength * (-(until as f64) / cfg.tighten_tau_secs).exp();
                interval *= factor;
            }
        }

        interval *= match priority {
            Priority::Critical => 0.5,
            Priority::Low => 2.0,
            Priority::High | Priority::Normal => 1.0,
        };

        let clamped = interval.clamp(cfg.min_interval_secs as f64, cfg.max_interval_secs as f64);
        Duration::from_secs_f64(clamped)
    }

    /// Whether the target is due for a check right now.
    pub fn should_check_now(&self, target: &str, last_check: DateTime<Utc>) -> bool {
        self.should_check_now_at(target, last_check, Utc::now())
    }

    pub fn should_check_now_at(
        &self,
        target: &str,
        last_check: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        if self.burst_active(target, now) {
            return true;
        }
        {
            let pattern_cell = self.pattern(target);
            let pattern = pattern_cell.lock().expect("pattern lock poisoned");
            if let Some(predicted) = self.forecast_next_drop(&pattern) {
                let until = (predicted - now).num_seconds();
                if until >= 0 && (until as u64) <= self.inner.config.imminent_secs {
                    return true;
                }
            }
        }
        let elapsed = (now - last_check).to_std().unwrap_or(Duration::ZERO);
        elapsed >= self.next_interval_at(target, Priority::Normal, now)
    }

    pub fn snapshot(&self, target: &str) -> Option<PatternSnapshot> {
        self.snapshot_at(target, Utc::now())
    }

    pub fn snapshot_at(&self, target: &str, now: DateTime<Utc>) -> Option<PatternSnapshot> {
        let patterns = self.inner.patterns.read().expect("pattern lock poisoned");
        let pattern = patterns.get(target)?.lock().expect("pattern lock poisoned");
        let mut peak_hours: Vec<u32> = pattern.peak_hours.iter().copied().collect();
        peak_hours.sort_unstable();
        let mut peak_days: Vec<u32> = pattern.peak_days.iter().copied().collect();
        peak_days.sort_unstable();
        Some(PatternSnapshot {
            target: target.to_string(),
            activity: pattern.activity_at(now),
            peak_hours,
            peak_days,
            avg_interval_secs: pattern.avg_interval,
            last_drop: pattern.last_drop,
            total_checks: pattern.total_checks,
            positive_checks: pattern.positive_checks,
            burst_active: self.burst_active(target, now),
        })
    }

    /// Periodic maintenance: relearn peak hours/days from the drop log and
    /// drop expired burst windows. Invoked by the pattern-analysis worker.
    pub fn analyze_patterns(&self) {
        self.analyze_patterns_at(Utc::now());
    }

    pub fn analyze_patterns_at(&self, now: DateTime<Utc>) {
        {
            let patterns = self.inner.patterns.read().expect("pattern lock poisoned");
            for cell in patterns.values() {
                let mut pattern = cell.lock().expect("pattern lock poisoned");
                if pattern.drops.len() < 3 {
                    continue;
                }
                let threshold = ((pattern.drops.len() as f64 * 0.2).ceil() as usize).max(2);

                let mut hour_counts: HashMap<u32, usize> = HashMap::new();
                let mut day_counts: HashMap<u32, usize> = HashMap::new();
                for drop in pattern.drops.iter() {
                    *hour_counts.entry(drop.hour()).or_default() += 1;
                    *day_counts
                        .entry(drop.weekday().num_days_from_monday())
                        .or_default() += 1;
                }
                pattern.peak_hours = hour_counts
                    .into_iter()
                    .filter(|(_, count)| *count >= threshold)
                    .map(|(hour, _)| hour)
                    .collect();
                pattern.peak_days = day_counts
                    .into_iter()
                    .filter(|(_, count)| *count >= threshold)
                    .map(|(day, _)| day)
                    .collect();
            }
        }

        let mut bursts = self.inner.bursts.lock().expect("burst lock poisoned");
        let burst_secs = self.inner.config.burst_secs;
        bursts.retain(|_, opened| {
            let elapsed = (now - *opened).num_seconds();
            elapsed >= 0 && (elapsed as u64) < burst_secs
        });
    }

    /// Serializable per-target state for snapshot export.
    pub fn export(&self) -> Vec<PatternExport> {
        let patterns = self.inner.patterns.read().expect("pattern lock poisoned");
        let mut exports: Vec<PatternExport> = patterns
            .iter()
            .map(|(target, cell)| {
                let pattern = cell.lock().expect("pattern lock poisoned");
                let mut peak_hours: Vec<u32> = pattern.peak_hours.iter().copied().collect();
                peak_hours.sort_unstable();
                let mut peak_days: Vec<u32> = pattern.peak_days.iter().copied().collect();
                peak_days.sort_unstable();
                PatternExport {
                    target: target.clone(),
                    peak_hours,
                    peak_days,
                    avg_interval_secs: pattern.avg_interval,
                    last_drop: pattern.last_drop,
                    interval_samples: pattern.intervals.to_vec(),
                    total_checks: pattern.total_checks,
                    positive_checks: pattern.positive_checks,
                    success_rate: pattern.success_rate(),
                }
            })
            .collect();
        exports.sort_by(|a, b| a.target.cmp(&b.target));
        exports
    }

    /// Restore exported state, rebuilding bounded histories.
    pub fn import(&self, exports: &[PatternExport]) {
        for export in exports {
            let pattern_cell = self.pattern(&export.target);
            let mut pattern = pattern_cell.lock().expect("pattern lock poisoned");
            pattern.peak_hours = export.peak_hours.iter().copied().collect();
            pattern.peak_days = export.peak_days.iter().copied().collect();
            pattern.avg_interval = export.avg_interval_secs;
            pattern.last_drop = export.last_drop;
            pattern.intervals = BoundedHistory::new(self.inner.config.interval_window);
            pattern.intervals.extend(export.interval_samples.iter().copied());
            pattern.total_checks = export.total_checks;
            pattern.positive_checks = export.positive_checks;
            if let Some(last) = export.last_drop {
                pattern.drops.push(last);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn scheduler() -> AdaptiveScheduler {
        AdaptiveScheduler::new(SchedulerConfig::default())
    }

    /// 15:00 UTC on a Monday, outside the default quiet window.
    fn afternoon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 15, 0, 0).unwrap()
    }

    fn quiet_night() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 10, 3, 0, 0).unwrap()
    }

    #[test]
    fn interval_stays_within_bounds() {
        let scheduler = scheduler();
        let now = afternoon();
        for priority in [Priority::Critical, Priority::High, Priority::Normal, Priority::Low] {
            for minutes in [0i64, 30, 300, 3000] {
                let at = now + ChronoDuration::minutes(minutes);
                let interval = scheduler.next_interval_at("t", priority, at);
                assert!(interval >= Duration::from_secs(10), "{:?}", interval);
                assert!(interval <= Duration::from_secs(600), "{:?}", interval);
            }
        }
    }

    #[test]
    fn dead_target_uses_dead_interval() {
        let scheduler = scheduler();
        // Never checked, never dropped: DEAD, 300s outside quiet hours.
        let interval = scheduler.next_interval_at("t", Priority::Normal, afternoon());
        assert_eq!(interval, Duration::from_secs(300));
        // During quiet hours the multiplier applies, saturating at the cap.
        let interval = scheduler.next_interval_at("t", Priority::Normal, quiet_night());
        assert_eq!(interval, Duration::from_secs(600));
    }

    #[test]
    fn recent_drop_suppresses_quiet_multiplier() {
        let scheduler = scheduler();
        let night = quiet_night();
        scheduler.record_check_at("t", true, 2, night - ChronoDuration::minutes(30));
        // Burst has expired by now (opened 30 minutes ago).
        assert!(!scheduler.burst_active("t", night));
        // The positive check 30 minutes ago makes activity HIGH and blocks
        // the quiet-hours multiplier, so the interval stays tight.
        let interval = scheduler.next_interval_at("t", Priority::Normal, night);
        assert!(interval <= Duration::from_secs(60));
    }

    #[test]
    fn burst_forces_critical_interval_until_expiry() {
        let scheduler = scheduler();
        let t0 = afternoon();
        scheduler.record_check_at("t", true, 3, t0);

        for offset in [0i64, 1, 150, 299] {
            let at = t0 + ChronoDuration::seconds(offset);
            assert!(scheduler.burst_active("t", at));
            assert_eq!(
                scheduler.next_interval_at("t", Priority::Low, at),
                Duration::from_secs(10)
            );
            assert!(scheduler.should_check_now_at("t", at, at));
        }

        let expired = t0 + ChronoDuration::seconds(300);
        assert!(!scheduler.burst_active("t", expired));
        assert_ne!(
            scheduler.next_interval_at("t", Priority::Normal, expired),
            Duration::from_secs(10)
        );
    }

    #[test]
    fn activity_follows_positive_ratio() {
        let scheduler = scheduler();
        let now = afternoon();
        for i in 0..10 {
            let at = now - ChronoDuration::minutes(50) + ChronoDuration::minutes(i * 5);
            scheduler.record_check_at("hot", true, if i % 2 == 0 { 1 } else { 0 }, at);
        }
        let snapshot = scheduler.snapshot_at("hot", now + ChronoDuration::seconds(301)).unwrap();
        // 5 positives out of 10 checks in the last hour is a 0.5 ratio,
        // which is NORMAL (HIGH needs strictly more than half).
        assert_eq!(snapshot.activity, ActivityLevel::Normal);
    }

    #[test]
    fn priority_scales_interval() {
        let scheduler = scheduler();
        let now = afternoon();
        // Seed NORMAL activity: drop 2 hours ago, no checks in last hour.
        scheduler.record_check_at("t", true, 1, now - ChronoDuration::hours(2));
        let normal = scheduler.next_interval_at("t", Priority::Normal, now);
        let critical = scheduler.next_interval_at("t", Priority::Critical, now);
        let low = scheduler.next_interval_at("t", Priority::Low, now);
        assert_eq!(normal, Duration::from_secs(60));
        assert_eq!(critical, Duration::from_secs(30));
        assert_eq!(low, Duration::from_secs(120));
    }

    #[test]
    fn forecast_tightens_before_predicted_drop() {
        let mut config = SchedulerConfig::default();
        config.forecast_jitter = 0.0;
        let scheduler = AdaptiveScheduler::new(config);
        let t0 = afternoon() - ChronoDuration::hours(3);
        // Drops every 30 minutes, learned exactly with jitter disabled.
        let mut at = t0;
        for _ in 0..5 {
            scheduler.record_check_at("t", true, 1, at);
            at += ChronoDuration::minutes(30);
        }
        let last_drop = at - ChronoDuration::minutes(30);

        // 5 minutes before the predicted drop the interval shrinks well
        // below the plain NORMAL/HIGH base.
        let close = last_drop + ChronoDuration::minutes(25);
        let tightened = scheduler.next_interval_at("t", Priority::Normal, close);
        let far = last_drop + ChronoDuration::minutes(5);
        let relaxed = scheduler.next_interval_at("t", Priority::Normal, far);
        assert!(tightened < relaxed, "{:?} vs {:?}", tightened, relaxed);
        assert!(scheduler.should_check_now_at("t", close, close));
    }

    #[test]
    fn peak_hours_learned_from_drop_log() {
        let scheduler = scheduler();
        let base = Utc.with_ymd_and_hms(2025, 3, 3, 19, 0, 0).unwrap();
        for day in 0..5 {
            scheduler.record_check_at("t", true, 1, base + ChronoDuration::days(day));
        }
        scheduler.analyze_patterns_at(base + ChronoDuration::days(5));
        let snapshot = scheduler.snapshot("t").unwrap();
        assert!(snapshot.peak_hours.contains(&19));
    }

    #[test]
    fn export_import_reproduces_intervals() {
        let mut config = SchedulerConfig::default();
        config.forecast_jitter = 0.0;
        let scheduler = AdaptiveScheduler::new(config.clone());
        let t0 = afternoon() - ChronoDuration::hours(6);
        let mut at = t0;
        for _ in 0..6 {
            scheduler.record_check_at("t", true, 1, at);
            at += ChronoDuration::minutes(10);
        }

        let exported = scheduler.export();
        let restored = AdaptiveScheduler::new(config);
        restored.import(&exported);
        assert_eq!(restored.export(), exported);

        // Two hours later both instances are on the drop-threshold activity
        // path and produce identical intervals.
        let later = afternoon();
        for priority in [Priority::Normal, Priority::Low, Priority::Critical] {
            assert_eq!(
                scheduler.next_interval_at("t", priority, later),
                restored.next_interval_at("t", priority, later),
            );
        }
    }
}
