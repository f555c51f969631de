//! Engine event hooks.
//!
//! Lets the orchestration layer observe decisions (classified detections,
//! issued responses, proxy outcomes, burst windows, snapshots) without
//! polling. Handlers run synchronously on the calling thread.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use crate::detection::DetectionType;
use crate::response::ResponseStrategy;

#[derive(Debug, Clone)]
pub struct DetectionNotice {
    pub target: String,
    pub detection_type: DetectionType,
    pub severity: f64,
    pub risk: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResponseNotice {
    pub target: String,
    pub strategies: Vec<ResponseStrategy>,
    pub escalation: bool,
    pub wait: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxyOutcomeNotice {
    pub address: String,
    pub target: String,
    pub success: bool,
    pub detected: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BurstNotice {
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SnapshotNotice {
    pub path: String,
    pub timestamp: DateTime<Utc>,
}

/// Engine-level events broadcast to registered handlers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Detection(DetectionNotice),
    Response(ResponseNotice),
    ProxyOutcome(ProxyOutcomeNotice),
    BurstOpened(BurstNotice),
    SnapshotWritten(SnapshotNotice),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::Detection(notice) => {
                log::info!(
                    "detection {} {:?} severity {:.2} risk {:.2}",
                    notice.target,
                    notice.detection_type,
                    notice.severity,
                    notice.risk
                );
            }
            EngineEvent::Response(notice) => {
                log::info!(
                    "response {} -> {:?} wait {:.0}s{}",
                    notice.target,
                    notice.strategies,
                    notice.wait.as_secs_f64(),
                    if notice.escalation { " (escalation)" } else { "" }
                );
            }
            EngineEvent::ProxyOutcome(notice) => {
                log::debug!(
                    "proxy {} on {} success={} detected={}",
                    notice.address,
                    notice.target,
                    notice.success,
                    notice.detected
                );
            }
            EngineEvent::BurstOpened(notice) => {
                log::info!("burst opened for {}", notice.target);
            }
            EngineEvent::SnapshotWritten(notice) => {
                log::debug!("snapshot written to {}", notice.path);
            }
        }
    }
}
