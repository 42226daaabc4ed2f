//! Protocol boundary.
//!
//! The core never talks to a wire directly: it resolves a [`Protocol`]
//! from the connection descriptor's version tag and drives everything
//! through that object. Exactly one concrete implementation is live at a
//! time; this build ships version 3 over the in-process [`Gateway`].
//!
//! [`Gateway`]: local::Gateway

pub mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::client::repository::ClientRepository;
use crate::config::{ConnectionConfig, InteropConfig, InteropDefaults};
use crate::error::{AgmError, Result};
use crate::instance::Instance;
use crate::server::repository::ServerRepository;
use crate::server::{StreamSink, SubscriptionRequest};
use crate::types::MethodDefinition;

/// Correlates one live subscription with its server-side roster entry.
#[derive(Debug, Clone)]
pub struct SubscriptionToken {
    pub server: Instance,
    pub method: String,
    pub id: u64,
}

/// Wire capability object the core drives after resolution.
#[async_trait]
pub trait Protocol: Send + Sync {
    /// Announce a local registration to the mesh.
    async fn register(&self, definition: &MethodDefinition) -> Result<()>;

    /// Announce a local removal to the mesh.
    async fn unregister(&self, definition: &MethodDefinition) -> Result<()>;

    /// Execute `method` on `target`, enforcing `timeout`.
    async fn invoke(
        &self,
        target: &Instance,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value>;

    /// Ask `target` to accept a stream subscription; pushed payloads and
    /// the closed notification arrive on `sink`.
    async fn subscribe(
        &self,
        target: &Instance,
        method: &str,
        request: SubscriptionRequest,
        sink: StreamSink,
    ) -> Result<SubscriptionToken>;

    async fn unsubscribe(&self, token: &SubscriptionToken) -> Result<()>;

    /// Best-effort synchronous disconnect, callable from `Drop`.
    fn shutdown(&self) {}
}

/// Resolve the protocol implementation selected by the connection's
/// version tag.
pub(crate) async fn resolve_protocol(
    instance: Instance,
    connection: ConnectionConfig,
    client_repository: Arc<ClientRepository>,
    server_repository: Arc<ServerRepository>,
    _config: &InteropConfig,
) -> Result<Arc<dyn Protocol>> {
    match connection.protocol_version {
        InteropDefaults::SUPPORTED_PROTOCOL_VERSION => {
            let protocol = local::LocalProtocol::resolve(
                instance,
                connection.gateway,
                client_repository,
                server_repository,
            )
            .await?;
            Ok(Arc::new(protocol))
        }
        version => Err(AgmError::UnsupportedProtocolVersion { version }),
    }
}
