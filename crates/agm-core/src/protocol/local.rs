//! Protocol version 3: an in-process gateway.
//!
//! Every participant of one mesh holds a clone of the same [`Gateway`].
//! Joining announces the newcomer to every client repository (its own
//! included) and replays existing registrations to the newcomer; from
//! then on registrations, invocations and stream traffic are routed
//! through the shared participant roster.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::client::repository::ClientRepository;
use crate::error::{AgmError, Result};
use crate::instance::Instance;
use crate::protocol::{Protocol, SubscriptionToken};
use crate::server::repository::{HandlerKind, ServerRepository};
use crate::server::{StreamSink, SubscriptionRequest};
use crate::types::MethodDefinition;

#[derive(Clone)]
struct Participant {
    instance: Instance,
    client_repository: Arc<ClientRepository>,
    server_repository: Arc<ServerRepository>,
}

/// Shared in-process message bus connecting the participants of one mesh.
#[derive(Clone, Default)]
pub struct Gateway {
    participants: Arc<Mutex<Vec<Participant>>>,
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of currently joined participants.
    pub fn participant_count(&self) -> usize {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn snapshot(&self) -> Vec<Participant> {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn find(&self, instance_id: &str) -> Option<Participant> {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|p| p.instance.instance_id == instance_id)
            .cloned()
    }

    fn join(&self, newcomer: Participant) {
        let existing = {
            let mut participants = self
                .participants
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let existing = participants.clone();
            participants.push(newcomer.clone());
            existing
        };

        // Announcements run outside the roster lock: repository callbacks
        // fire synchronously.
        newcomer
            .client_repository
            .add_server(newcomer.instance.clone());
        for peer in &existing {
            newcomer.client_repository.add_server(peer.instance.clone());
            for entry in peer.server_repository.entries() {
                newcomer
                    .client_repository
                    .add_method(peer.instance.clone(), entry.definition.clone());
            }
            peer.client_repository.add_server(newcomer.instance.clone());
        }
        info!(instance = %newcomer.instance, "participant joined");
    }

    fn leave(&self, instance_id: &str) {
        let (leaver, remaining) = {
            let mut participants = self
                .participants
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let leaver = participants
                .iter()
                .position(|p| p.instance.instance_id == instance_id)
                .map(|idx| participants.remove(idx));
            (leaver, participants.clone())
        };
        let Some(leaver) = leaver else { return };

        // Close the leaver's streams so subscribers learn about it.
        for entry in leaver.server_repository.entries() {
            if let HandlerKind::Stream(core) = &entry.handler {
                let _ = core.close();
            }
        }
        for peer in remaining {
            peer.client_repository.remove_server(instance_id);
        }
        info!(instance = %leaver.instance, "participant left");
    }

    fn broadcast_register(&self, owner: &Instance, definition: &MethodDefinition) {
        for peer in self.snapshot() {
            peer.client_repository
                .add_method(owner.clone(), definition.clone());
        }
    }

    fn broadcast_unregister(&self, owner_id: &str, name: &str) {
        for peer in self.snapshot() {
            peer.client_repository.remove_method(owner_id, name);
        }
    }

    async fn invoke(
        &self,
        caller: &Instance,
        target: &Instance,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        let entry = self
            .find(&target.instance_id)
            .ok_or_else(|| AgmError::InvocationFailed {
                method: method.to_string(),
                message: format!("target {} is no longer connected", target),
            })?
            .server_repository
            .lookup(method)
            .ok_or_else(|| AgmError::InvocationFailed {
                method: method.to_string(),
                message: format!("method not registered on {}", target),
            })?;

        debug!(method, target = %target, "invoking");
        match entry.handler {
            HandlerKind::Sync(handler) => handler(args, caller.clone()),
            HandlerKind::Async(handler) => {
                match tokio::time::timeout(timeout, handler(args, caller.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(AgmError::Timeout {
                        method: method.to_string(),
                        timeout,
                    }),
                }
            }
            HandlerKind::Stream(_) => Err(AgmError::InvocationFailed {
                method: method.to_string(),
                message: "method is a stream; subscribe to it instead".to_string(),
            }),
        }
    }

    fn subscribe(
        &self,
        target: &Instance,
        method: &str,
        request: SubscriptionRequest,
        sink: StreamSink,
    ) -> Result<SubscriptionToken> {
        let entry = self
            .find(&target.instance_id)
            .ok_or_else(|| AgmError::SubscribeFailed {
                method: method.to_string(),
                message: format!("target {} is no longer connected", target),
            })?
            .server_repository
            .lookup(method)
            .ok_or_else(|| AgmError::SubscribeFailed {
                method: method.to_string(),
                message: format!("method not registered on {}", target),
            })?;

        match entry.handler {
            HandlerKind::Stream(core) => {
                let id = core.handle_subscribe(request, sink)?;
                Ok(SubscriptionToken {
                    server: target.clone(),
                    method: method.to_string(),
                    id,
                })
            }
            _ => Err(AgmError::SubscribeFailed {
                method: method.to_string(),
                message: "method is not a stream".to_string(),
            }),
        }
    }

    fn unsubscribe(&self, token: &SubscriptionToken) {
        let Some(participant) = self.find(&token.server.instance_id) else {
            return;
        };
        if let Some(entry) = participant.server_repository.lookup(&token.method) {
            if let HandlerKind::Stream(core) = entry.handler {
                core.remove_subscriber(token.id);
            }
        }
    }
}

/// The version-3 protocol object bound to one participant.
pub struct LocalProtocol {
    gateway: Gateway,
    instance: Instance,
}

impl LocalProtocol {
    /// Join the mesh. Resolution is asynchronous to match the boundary
    /// contract even though the local gateway settles immediately.
    pub(crate) async fn resolve(
        instance: Instance,
        gateway: Gateway,
        client_repository: Arc<ClientRepository>,
        server_repository: Arc<ServerRepository>,
    ) -> Result<Self> {
        gateway.join(Participant {
            instance: instance.clone(),
            client_repository,
            server_repository,
        });
        Ok(Self { gateway, instance })
    }
}

#[async_trait]
impl Protocol for LocalProtocol {
    async fn register(&self, definition: &MethodDefinition) -> Result<()> {
        self.gateway.broadcast_register(&self.instance, definition);
        Ok(())
    }

    async fn unregister(&self, definition: &MethodDefinition) -> Result<()> {
        self.gateway
            .broadcast_unregister(&self.instance.instance_id, &definition.name);
        Ok(())
    }

    async fn invoke(
        &self,
        target: &Instance,
        method: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value> {
        self.gateway
            .invoke(&self.instance, target, method, args, timeout)
            .await
    }

    async fn subscribe(
        &self,
        target: &Instance,
        method: &str,
        request: SubscriptionRequest,
        sink: StreamSink,
    ) -> Result<SubscriptionToken> {
        self.gateway.subscribe(target, method, request, sink)
    }

    async fn unsubscribe(&self, token: &SubscriptionToken) -> Result<()> {
        self.gateway.unsubscribe(token);
        Ok(())
    }

    fn shutdown(&self) {
        self.gateway.leave(&self.instance.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::repository::ServerEntry;
    use crate::server::MethodHandler;
    use serde_json::json;

    fn participant(app: &str) -> (Instance, Arc<ClientRepository>, Arc<ServerRepository>) {
        (
            Instance::new(app, None),
            Arc::new(ClientRepository::new()),
            Arc::new(ServerRepository::new()),
        )
    }

    #[tokio::test]
    async fn test_join_replays_existing_registrations() {
        let gateway = Gateway::new();
        let (a_inst, a_client, a_server) = participant("a");
        let proto_a =
            LocalProtocol::resolve(a_inst.clone(), gateway.clone(), a_client, a_server.clone())
                .await
                .unwrap();

        let handler: MethodHandler = Arc::new(|_args, _caller| Ok(json!(42)));
        a_server.add(ServerEntry {
            definition: MethodDefinition::new("answer"),
            handler: HandlerKind::Sync(handler),
        });
        proto_a.register(&MethodDefinition::new("answer")).await.unwrap();

        // b joins later and still sees a's method.
        let (b_inst, b_client, b_server) = participant("b");
        LocalProtocol::resolve(b_inst, gateway.clone(), b_client.clone(), b_server)
            .await
            .unwrap();
        assert_eq!(b_client.methods(Some(&"answer".into())).len(), 1);
        assert_eq!(gateway.participant_count(), 2);
    }

    #[tokio::test]
    async fn test_leave_removes_server_everywhere() {
        let gateway = Gateway::new();
        let (a_inst, a_client, a_server) = participant("a");
        let proto_a = LocalProtocol::resolve(a_inst, gateway.clone(), a_client, a_server)
            .await
            .unwrap();
        let (b_inst, b_client, b_server) = participant("b");
        LocalProtocol::resolve(b_inst, gateway.clone(), b_client.clone(), b_server)
            .await
            .unwrap();

        assert_eq!(b_client.servers(None).len(), 2);
        proto_a.shutdown();
        assert_eq!(b_client.servers(None).len(), 1);
        assert_eq!(gateway.participant_count(), 1);
    }

    #[tokio::test]
    async fn test_async_invocation_times_out() {
        let gateway = Gateway::new();
        let (a_inst, a_client, a_server) = participant("a");
        let proto = LocalProtocol::resolve(a_inst.clone(), gateway, a_client, a_server.clone())
            .await
            .unwrap();

        let handler: crate::server::AsyncMethodHandler = Arc::new(|_args, _caller| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(json!(null))
            })
        });
        a_server.add(ServerEntry {
            definition: MethodDefinition::new("slow"),
            handler: HandlerKind::Async(handler),
        });

        let err = proto
            .invoke(&a_inst, "slow", json!({}), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, AgmError::Timeout { .. }));
    }
}
