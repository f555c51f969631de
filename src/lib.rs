//! # dropscout
//!
//! Adaptive detection-response and proxy scheduling core for drop/restock
//! monitoring.
//!
//! The crate is the decision-making half of a monitor: it classifies "we got
//! noticed" signals, maintains per-target risk, picks mitigation strategies,
//! scores and selects egress proxies, and computes when each target should
//! be probed next. The browser/session driver that actually issues requests
//! stays outside and talks to [`DropScout`].
//!
//! ## Features
//!
//! - Keyword/flag detection classification with per-target risk decay
//! - Strategy selection that learns from recorded outcomes and escalates
//!   instead of re-applying failing mitigations
//! - Proxy scoring with sticky sessions, health tracking, and an optional
//!   learned success model
//! - Adaptive per-target intervals with peak-hour learning, drop forecasts,
//!   and burst mode
//! - Multi-identity coordination so concurrent monitors never synchronize
//!
//! ## Example
//!
//! ```no_run
//! use dropscout::{DropScout, Observation, Priority, ProbeKind, RequestContext, SessionContext};
//!
//! let core = DropScout::builder().build();
//!
//! let ctx = RequestContext::new("ticketek", ProbeKind::Check, Priority::High);
//! if let Some(proxy) = core.get_proxy(&ctx, Some("session-1")) {
//!     // ... probe through `proxy`, then:
//!     core.report_proxy_outcome(&proxy.address, &ctx, true, 180.0, false, None);
//! }
//!
//! let observation = Observation::new().with("page_text", "please solve the captcha");
//! let response = core.report_detection("ticketek", &observation, &SessionContext::default());
//! println!("mitigations: {:?}", response.strategies);
//! ```

mod core;

pub mod config;
pub mod detection;
pub mod events;
pub mod history;
pub mod proxy;
pub mod response;
pub mod scheduler;
pub mod snapshot;
pub mod workers;

pub use crate::core::{DropScout, DropScoutBuilder};

pub use crate::config::{
    CoordinatorConfig,
    DetectionConfig,
    EngineConfig,
    ProxyConfig,
    ProxyDefinition,
    ProxyKind,
    ResponseConfig,
    SchedulerConfig,
    TargetConfig,
    WorkerConfig,
};

pub use crate::detection::{
    DetectionClassifier,
    DetectionEvent,
    DetectionType,
    Observation,
    SessionContext,
};

pub use crate::events::{
    EngineEvent,
    EventDispatcher,
    EventHandler,
    LoggingHandler,
};

pub use crate::history::BoundedHistory;

pub use crate::proxy::{
    scorer::{LogisticModel, SuccessModel, TrainingSample, TrainingSet},
    PoolReport,
    Priority,
    ProbeKind,
    ProxyExport,
    ProxySelector,
    ProxyStats,
    RequestContext,
    TargetRates,
};

pub use crate::response::{
    AdaptiveResponse,
    ResponseEngine,
    ResponseStrategy,
    RiskSnapshot,
};

pub use crate::scheduler::{
    coordinator::AgentCoordinator,
    ActivityLevel,
    AdaptiveScheduler,
    PatternExport,
    PatternSnapshot,
};

pub use crate::snapshot::{EngineSnapshot, SnapshotError};

pub use crate::workers::{HealthProbe, Supervisor};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
