//! Perf manager: owns the shared collection, hands out clients over it and
//! wires the well-known retrieval method into an interop facade.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use super::collection::{PerfCollection, UnboundedPerfCollection};
use super::event::PerfEvent;
use super::logger::PerfLogger;
use super::MONITORING_GET_EVENTS;
use crate::error::{AgmError, Result};
use crate::instance::Instance;
use crate::interop::Interop;
use crate::types::{InvocationStatus, InvokeTarget};

/// Read-only view over a shared collection.
pub struct PerfClient {
    collection: Arc<dyn PerfCollection>,
}

impl PerfClient {
    pub fn get_events(&self) -> Vec<PerfEvent> {
        self.collection.get_events()
    }
}

/// Events reported by one participant via the well-known method.
#[derive(Debug)]
pub struct InstanceEvents {
    pub instance: Instance,
    pub events: Vec<PerfEvent>,
}

/// Owns the logger, the collection and the clients reading from it.
pub struct PerfManager {
    collection: Arc<dyn PerfCollection>,
    logger: Arc<PerfLogger>,
    clients: Vec<PerfClient>,
}

impl Default for PerfManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PerfManager {
    /// Manager over an unbounded collection.
    pub fn new() -> Self {
        Self::with_collection(Arc::new(UnboundedPerfCollection::new()))
    }

    /// Manager over a caller-supplied collection (e.g. a bounded one).
    pub fn with_collection(collection: Arc<dyn PerfCollection>) -> Self {
        let logger = Arc::new(PerfLogger::new(collection.clone()));
        let default_client = PerfClient {
            collection: collection.clone(),
        };
        Self {
            collection,
            logger,
            clients: vec![default_client],
        }
    }

    /// The logger to hand to [`InteropConfig::with_perf_logger`].
    ///
    /// [`InteropConfig::with_perf_logger`]: crate::InteropConfig::with_perf_logger
    pub fn logger(&self) -> Arc<PerfLogger> {
        self.logger.clone()
    }

    pub fn clients(&self) -> &[PerfClient] {
        &self.clients
    }

    pub fn default_client(&self) -> &PerfClient {
        &self.clients[0]
    }

    /// Register the well-known retrieval method on `interop` so other
    /// participants can pull this one's events. The result payload carries
    /// the self-exclusion sentinel.
    pub async fn register_methods(&self, interop: &Interop) -> Result<()> {
        let collection = self.collection.clone();
        interop
            .register_async(MONITORING_GET_EVENTS.into(), move |_args, _caller| {
                let collection = collection.clone();
                async move {
                    Ok(json!({
                        "events": collection.get_events(),
                        "skipPerfLogging": true,
                    }))
                }
            })
            .await?;
        debug!("registered {}", MONITORING_GET_EVENTS);
        Ok(())
    }

    /// Pull recorded events from every participant currently exposing the
    /// well-known method, this one included.
    pub async fn get_all(&self, interop: &Interop) -> Result<Vec<InstanceEvents>> {
        let result = interop
            .invoke(
                MONITORING_GET_EVENTS.into(),
                json!({}),
                InvokeTarget::All,
                None,
            )
            .await?;

        let mut all = Vec::new();
        for entry in result.results {
            if entry.status != InvocationStatus::Succeeded {
                continue;
            }
            let events_value = entry
                .returned
                .as_ref()
                .and_then(|r| r.get("events"))
                .cloned()
                .ok_or_else(|| AgmError::Other("malformed GetEvents response".into()))?;
            let events: Vec<PerfEvent> = serde_json::from_value(events_value)?;
            all.push(InstanceEvents {
                instance: entry.executed_by,
                events,
            });
        }
        Ok(all)
    }
}
