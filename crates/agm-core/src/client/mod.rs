//! Caller side: discovery queries, invocation fan-out and stream
//! subscriptions.

pub(crate) mod repository;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{AgmError, Result};
use crate::events::{CallbackRegistry, ListenerHandle};
use crate::instance::Instance;
use crate::protocol::{Protocol, SubscriptionToken};
use crate::server::{StreamMessage, SubscriptionRequest};
use crate::types::{
    InvocationResult, InvocationResultEntry, InvocationStatus, InvokeOptions, InvokeTarget,
    Method, MethodDefinition, ServerMethodEvent, StreamData, SubscriptionParams,
};
use repository::ClientRepository;

/// Caller-facing API over the discovery registry and the protocol.
pub(crate) struct Client {
    protocol: Arc<dyn Protocol>,
    repository: Arc<ClientRepository>,
    instance: Instance,
    method_response_timeout: Duration,
}

impl Client {
    pub(crate) fn new(
        protocol: Arc<dyn Protocol>,
        repository: Arc<ClientRepository>,
        instance: Instance,
        method_response_timeout: Duration,
    ) -> Self {
        Self {
            protocol,
            repository,
            instance,
            method_response_timeout,
        }
    }

    pub(crate) fn methods(&self, filter: Option<&MethodDefinition>) -> Vec<Method> {
        self.repository.methods(filter)
    }

    pub(crate) fn servers(&self, filter: Option<&MethodDefinition>) -> Vec<Instance> {
        self.repository.servers(filter)
    }

    pub(crate) fn methods_for_instance(&self, server: &Instance) -> Vec<Method> {
        self.repository.methods_for_instance(&server.instance_id)
    }

    pub(crate) fn on_method_added(
        &self,
        callback: impl Fn(&Method) + Send + Sync + 'static,
    ) -> ListenerHandle<Method> {
        self.repository.method_added.add(callback)
    }

    pub(crate) fn on_method_removed(
        &self,
        callback: impl Fn(&Method) + Send + Sync + 'static,
    ) -> ListenerHandle<Method> {
        self.repository.method_removed.add(callback)
    }

    pub(crate) fn on_server_added(
        &self,
        callback: impl Fn(&Instance) + Send + Sync + 'static,
    ) -> ListenerHandle<Instance> {
        self.repository.server_added.add(callback)
    }

    pub(crate) fn on_server_removed(
        &self,
        callback: impl Fn(&Instance) + Send + Sync + 'static,
    ) -> ListenerHandle<Instance> {
        self.repository.server_removed.add(callback)
    }

    pub(crate) fn on_server_method_added(
        &self,
        callback: impl Fn(&ServerMethodEvent) + Send + Sync + 'static,
    ) -> ListenerHandle<ServerMethodEvent> {
        self.repository.server_method_added.add(callback)
    }

    pub(crate) fn on_server_method_removed(
        &self,
        callback: impl Fn(&ServerMethodEvent) + Send + Sync + 'static,
    ) -> ListenerHandle<ServerMethodEvent> {
        self.repository.server_method_removed.add(callback)
    }

    /// Servers the invocation fans out to, per the target selector.
    fn resolve_targets(
        &self,
        filter: &MethodDefinition,
        target: &InvokeTarget,
    ) -> Result<Vec<Instance>> {
        let candidates = self.repository.servers(Some(filter));
        let targets: Vec<Instance> = match target {
            InvokeTarget::Best => candidates.into_iter().take(1).collect(),
            InvokeTarget::All => candidates,
            InvokeTarget::Instance(instance) => candidates
                .into_iter()
                .filter(|s| s.instance_id == instance.instance_id)
                .collect(),
            InvokeTarget::List(list) => candidates
                .into_iter()
                .filter(|s| list.iter().any(|i| i.instance_id == s.instance_id))
                .collect(),
        };
        if targets.is_empty() {
            return Err(AgmError::NoServerFound {
                method: filter.name.clone(),
            });
        }
        Ok(targets)
    }

    /// Fan an invocation out to every resolved target concurrently.
    ///
    /// A failing target contributes a failed entry; the call as a whole
    /// fails only when every target failed.
    pub(crate) async fn invoke(
        &self,
        filter: &MethodDefinition,
        args: Value,
        target: InvokeTarget,
        options: InvokeOptions,
    ) -> Result<InvocationResult> {
        let targets = self.resolve_targets(filter, &target)?;
        let timeout = options
            .method_response_timeout
            .unwrap_or(self.method_response_timeout);

        debug!(method = %filter.name, targets = targets.len(), "invoking");
        let calls = targets.iter().map(|server| {
            let protocol = self.protocol.clone();
            let args = args.clone();
            let name = filter.name.clone();
            async move { protocol.invoke(server, &name, args, timeout).await }
        });
        let outcomes = join_all(calls).await;

        let results: Vec<InvocationResultEntry> = targets
            .into_iter()
            .zip(outcomes)
            .map(|(server, outcome)| match outcome {
                Ok(returned) => InvocationResultEntry {
                    executed_by: server,
                    status: InvocationStatus::Succeeded,
                    returned: Some(returned),
                    message: None,
                },
                Err(err) => InvocationResultEntry {
                    executed_by: server,
                    status: InvocationStatus::Failed,
                    returned: None,
                    message: Some(err.to_string()),
                },
            })
            .collect();

        if results.iter().all(|r| r.status == InvocationStatus::Failed) {
            let message = results
                .iter()
                .find_map(|r| r.message.clone())
                .unwrap_or_else(|| "invocation failed".to_string());
            return Err(AgmError::InvocationFailed {
                method: filter.name.clone(),
                message,
            });
        }

        Ok(InvocationResult {
            method: filter.clone(),
            called_with: args,
            results,
        })
    }

    /// Subscribe to a stream on exactly one server.
    pub(crate) async fn subscribe(
        &self,
        filter: &MethodDefinition,
        params: SubscriptionParams,
    ) -> Result<Subscription> {
        let candidates = self.repository.servers(Some(filter));
        let server = match &params.target {
            InvokeTarget::Best => candidates.into_iter().next(),
            InvokeTarget::Instance(instance) => candidates
                .into_iter()
                .find(|s| s.instance_id == instance.instance_id),
            InvokeTarget::List(list) => candidates
                .into_iter()
                .find(|s| list.iter().any(|i| i.instance_id == s.instance_id)),
            InvokeTarget::All => {
                return Err(AgmError::SubscribeFailed {
                    method: filter.name.clone(),
                    message: "a subscription targets a single server".to_string(),
                })
            }
        };
        let server = server.ok_or_else(|| AgmError::SubscribeFailed {
            method: filter.name.clone(),
            message: "no server offers this stream".to_string(),
        })?;

        let inner = Arc::new(SubscriptionInner {
            method: filter.name.clone(),
            server: server.clone(),
            branch: params.branch.clone(),
            protocol: self.protocol.clone(),
            token: Mutex::new(None),
            closed: AtomicBool::new(false),
            on_data: CallbackRegistry::new(),
            on_closed: CallbackRegistry::new(),
        });

        // The sink holds a weak reference: dropping the last Subscription
        // handle must not keep the delivery path alive.
        let weak: Weak<SubscriptionInner> = Arc::downgrade(&inner);
        let sink: crate::server::StreamSink = Arc::new(move |message| {
            let Some(inner) = weak.upgrade() else { return };
            inner.deliver(message);
        });

        let request = SubscriptionRequest {
            subscriber: self.instance.clone(),
            arguments: params.arguments.clone(),
            branch: params.branch.clone(),
        };
        let token = self
            .protocol
            .subscribe(&server, &filter.name, request, sink)
            .await?;
        *inner.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(token);

        debug!(method = %filter.name, server = %server, "subscribed");
        Ok(Subscription { inner })
    }
}

struct SubscriptionInner {
    method: String,
    server: Instance,
    branch: Option<String>,
    protocol: Arc<dyn Protocol>,
    token: Mutex<Option<SubscriptionToken>>,
    closed: AtomicBool,
    on_data: CallbackRegistry<StreamData>,
    on_closed: CallbackRegistry<()>,
}

impl SubscriptionInner {
    fn deliver(&self, message: StreamMessage) {
        match message {
            StreamMessage::Data(data) => {
                if !self.closed.load(Ordering::SeqCst) {
                    self.on_data.notify(&data);
                }
            }
            StreamMessage::Closed => {
                if !self.closed.swap(true, Ordering::SeqCst) {
                    self.on_closed.notify(&());
                }
            }
        }
    }
}

/// A live subscription to a remote stream.
///
/// Data and closure arrive on the registered callbacks. Closing is
/// idempotent: the second `close` (or a close after the server ended the
/// stream) succeeds without touching the wire.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("method", &self.inner.method)
            .field("server", &self.inner.server)
            .field("branch", &self.inner.branch)
            .finish_non_exhaustive()
    }
}

impl Subscription {
    pub fn method(&self) -> &str {
        &self.inner.method
    }

    pub fn server(&self) -> &Instance {
        &self.inner.server
    }

    /// Branch the subscription asked for, if any.
    pub fn branch(&self) -> Option<&str> {
        self.inner.branch.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn on_data(
        &self,
        callback: impl Fn(&StreamData) + Send + Sync + 'static,
    ) -> ListenerHandle<StreamData> {
        self.inner.on_data.add(callback)
    }

    pub fn on_closed(
        &self,
        callback: impl Fn(&()) + Send + Sync + 'static,
    ) -> ListenerHandle<()> {
        self.inner.on_closed.add(callback)
    }

    /// Detach from the stream.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let token = self
            .inner
            .token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(token) = token {
            if let Err(err) = self.inner.protocol.unsubscribe(&token).await {
                warn!(method = %self.inner.method, "unsubscribe announcement failed: {err}");
            }
        }
        self.inner.on_closed.notify(&());
        Ok(())
    }
}
