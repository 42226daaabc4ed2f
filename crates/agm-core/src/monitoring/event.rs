//! Performance event model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a recorded operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfStatus {
    Pending,
    Completed,
    Failed,
}

/// Subsystem an event belongs to. The interop core only emits `Interop`;
/// the rest exist for co-hosted subsystems sharing one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerfDomain {
    Ws,
    Interop,
    Metrics,
    Contexts,
}

/// One recorded measurement of an operation's lifecycle and cost.
///
/// Created in `Pending` state when the operation starts and replaced (same
/// id) exactly once with `Completed` or `Failed` when it settles. Ids are
/// unique and strictly increasing in start order per logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerfEvent {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub status: PerfStatus,
    pub domain: PerfDomain,
    /// Whether the operation crossed the process boundary.
    pub ipc: bool,
    /// Free-form operation metadata, pre-serialized.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_size: Option<u64>,
    /// Elapsed wall time in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed: Option<f64>,
}
