//! Best-effort state snapshots.
//!
//! Serializes learned pattern and proxy state to a JSON file and restores it
//! into a fresh process. Failures are reported to the caller and never touch
//! in-memory state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::proxy::{ProxyExport, ProxySelector};
use crate::scheduler::{AdaptiveScheduler, PatternExport};

/// Errors surfaced by snapshot export/import.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// On-disk snapshot layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub generated_at: DateTime<Utc>,
    #[serde(default)]
    pub patterns: Vec<PatternExport>,
    #[serde(default)]
    pub proxies: Vec<ProxyExport>,
}

impl EngineSnapshot {
    /// Capture the current scheduler and proxy state.
    pub fn capture(scheduler: &AdaptiveScheduler, proxies: &ProxySelector) -> Self {
        Self {
            generated_at: Utc::now(),
            patterns: scheduler.export(),
            proxies: proxies.export(),
        }
    }

    /// Restore captured state onto live engines.
    pub fn restore(&self, scheduler: &AdaptiveScheduler, proxies: &ProxySelector) {
        scheduler.import(&self.patterns);
        proxies.import(&self.proxies);
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<(), SnapshotError> {
        let encoded = serde_json::to_string_pretty(self)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self, SnapshotError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, ProxyDefinition, ProxyKind, SchedulerConfig};
    use crate::proxy::{Priority, ProbeKind, RequestContext};
    use chrono::Duration as ChronoDuration;

    fn pool() -> Vec<ProxyDefinition> {
        vec![ProxyDefinition {
            address: "p1:8080".into(),
            username: None,
            password: None,
            provider: "testprov".into(),
            location: Some("us".into()),
            kind: ProxyKind::Residential,
            cost_per_request: 0.001,
        }]
    }

    #[test]
    fn file_round_trip_restores_state() {
        let scheduler = AdaptiveScheduler::new(SchedulerConfig::default());
        let selector = ProxySelector::new(ProxyConfig {
            pool: pool(),
            ..Default::default()
        });

        let t0 = Utc::now() - ChronoDuration::hours(2);
        let ctx = RequestContext::new("ticketek", ProbeKind::Check, Priority::High);
        for i in 0..20 {
            scheduler.record_check_at("ticketek", true, 1, t0 + ChronoDuration::minutes(i * 5));
            selector.record_outcome_at(
                "p1:8080",
                &ctx,
                true,
                180.0,
                false,
                None,
                t0 + ChronoDuration::minutes(i * 5),
            );
        }

        let dir = std::env::temp_dir().join("dropscout-snapshot-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("state.json");

        let snapshot = EngineSnapshot::capture(&scheduler, &selector);
        snapshot.write_to(&path).unwrap();

        let restored_scheduler = AdaptiveScheduler::new(SchedulerConfig::default());
        let restored_selector = ProxySelector::new(ProxyConfig {
            pool: pool(),
            ..Default::default()
        });
        let loaded = EngineSnapshot::read_from(&path).unwrap();
        loaded.restore(&restored_scheduler, &restored_selector);

        assert_eq!(restored_scheduler.export(), scheduler.export());
        assert_eq!(restored_selector.export(), selector.export());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_file_reports_io_error() {
        let result = EngineSnapshot::read_from("/nonexistent/dropscout-state.json");
        assert!(matches!(result, Err(SnapshotError::Io(_))));
    }
}
