//! Telemetry pipeline: event model, logger, collections and the manager
//! that exposes recorded events to remote participants.

pub mod collection;
pub mod event;
pub mod logger;
pub mod manager;

pub use collection::{BoundedPerfCollection, PerfCollection, UnboundedPerfCollection};
pub use event::{PerfDomain, PerfEvent, PerfStatus};
pub use logger::{LogMessage, PerfLogger, PerfSpan};
pub use manager::{InstanceEvents, PerfClient, PerfManager};

/// Well-known method every telemetry-enabled participant registers.
/// Invocations of this exact name are never instrumented.
pub const MONITORING_GET_EVENTS: &str = "Tick42.Monitoring.GetEvents";

/// Sentinel key the monitoring result payload carries so that even
/// indirect occurrences of it are kept out of the collection.
pub const SKIP_PERF_LOGGING_KEY: &str = "skipPerfLogging";
