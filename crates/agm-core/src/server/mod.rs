//! Provider side: registration of local capabilities and stream lifecycle.

pub(crate) mod repository;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{AgmError, Result};
use crate::instance::Instance;
use crate::protocol::Protocol;
use crate::types::{MethodDefinition, StreamData};
use repository::{HandlerKind, ServerEntry, ServerRepository};

/// Handler for a synchronously registered method.
pub type MethodHandler = Arc<dyn Fn(Value, Instance) -> Result<Value> + Send + Sync>;

/// Handler for an asynchronously registered method. Returning the future's
/// `Err` is the error continuation; `Ok` completes the invocation.
pub type AsyncMethodHandler =
    Arc<dyn Fn(Value, Instance) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

/// A subscriber's request to join a stream.
#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub subscriber: Instance,
    pub arguments: Option<Value>,
    /// Branch the subscriber asked for; the verdict may override it.
    pub branch: Option<String>,
}

/// Decision of a stream's subscription-request handler.
#[derive(Debug, Clone)]
pub enum SubscriptionVerdict {
    /// Accept on the branch the subscriber requested (if any).
    Accept,
    /// Accept, but pin the subscriber to this branch.
    AcceptOnBranch(String),
    Reject(String),
}

/// Decides whether a subscriber may join.
pub type SubscriptionRequestHandler =
    Arc<dyn Fn(&SubscriptionRequest) -> SubscriptionVerdict + Send + Sync>;

/// Notified when a subscriber joins or leaves a stream.
pub type SubscriberCallback = Arc<dyn Fn(&SubscriptionRequest) + Send + Sync>;

/// Server-side callbacks attached to a stream at creation.
#[derive(Default, Clone)]
pub struct StreamOptions {
    /// When absent, every subscription request is accepted.
    pub on_subscription_request: Option<SubscriptionRequestHandler>,
    pub on_subscriber_added: Option<SubscriberCallback>,
    pub on_subscriber_removed: Option<SubscriberCallback>,
}

/// Message delivered to a subscriber's sink.
#[derive(Debug, Clone)]
pub enum StreamMessage {
    Data(StreamData),
    Closed,
}

/// Delivery endpoint for one subscriber, installed by the protocol.
pub type StreamSink = Arc<dyn Fn(StreamMessage) + Send + Sync>;

struct StreamSubscriber {
    id: u64,
    request: SubscriptionRequest,
    branch: Option<String>,
    sink: StreamSink,
}

struct StreamState {
    closed: bool,
    subscribers: Vec<StreamSubscriber>,
}

/// Server-owned state of one stream: subscriber roster and closed flag.
///
/// `close` is idempotent-terminal: the first call wins, every later
/// `push`/`close` fails with a stream-closed error.
pub(crate) struct StreamCore {
    definition: MethodDefinition,
    server: Instance,
    options: StreamOptions,
    state: Mutex<StreamState>,
    next_subscriber_id: AtomicU64,
}

impl StreamCore {
    fn new(definition: MethodDefinition, server: Instance, options: StreamOptions) -> Self {
        Self {
            definition,
            server,
            options,
            state: Mutex::new(StreamState {
                closed: false,
                subscribers: Vec::new(),
            }),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    pub(crate) fn definition(&self) -> &MethodDefinition {
        &self.definition
    }

    fn closed_error(&self) -> AgmError {
        AgmError::StreamClosed {
            name: self.definition.name.clone(),
        }
    }

    /// Run the accept/reject handler and install the subscriber's sink.
    pub(crate) fn handle_subscribe(
        &self,
        request: SubscriptionRequest,
        sink: StreamSink,
    ) -> Result<u64> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(self.closed_error());
            }
        }

        let verdict = match &self.options.on_subscription_request {
            Some(handler) => handler(&request),
            None => SubscriptionVerdict::Accept,
        };
        let branch = match verdict {
            SubscriptionVerdict::Accept => request.branch.clone(),
            SubscriptionVerdict::AcceptOnBranch(branch) => Some(branch),
            SubscriptionVerdict::Reject(reason) => {
                return Err(AgmError::SubscribeFailed {
                    method: self.definition.name.clone(),
                    message: reason,
                })
            }
        };

        let id = self.next_subscriber_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(self.closed_error());
            }
            state.subscribers.push(StreamSubscriber {
                id,
                request: request.clone(),
                branch,
                sink,
            });
        }
        debug!(stream = %self.definition.name, subscriber = %request.subscriber, "subscriber added");
        if let Some(cb) = &self.options.on_subscriber_added {
            cb(&request);
        }
        Ok(id)
    }

    pub(crate) fn remove_subscriber(&self, id: u64) -> bool {
        let removed = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let before = state.subscribers.len();
            let removed = state
                .subscribers
                .iter()
                .position(|s| s.id == id)
                .map(|idx| state.subscribers.remove(idx));
            debug_assert!(state.subscribers.len() <= before);
            removed
        };
        match removed {
            Some(subscriber) => {
                if let Some(cb) = &self.options.on_subscriber_removed {
                    cb(&subscriber.request);
                }
                true
            }
            None => false,
        }
    }

    /// Deliver `data` to current subscribers. With named branches, only
    /// subscribers pinned to one of them receive the payload.
    pub(crate) fn push(&self, data: Value, branches: Option<&[String]>) -> Result<()> {
        let sinks: Vec<StreamSink> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(self.closed_error());
            }
            state
                .subscribers
                .iter()
                .filter(|s| match branches {
                    None => true,
                    Some(named) => s
                        .branch
                        .as_ref()
                        .is_some_and(|b| named.contains(b)),
                })
                .map(|s| s.sink.clone())
                .collect()
        };

        for sink in sinks {
            sink(StreamMessage::Data(StreamData {
                data: data.clone(),
                server: self.server.clone(),
            }));
        }
        Ok(())
    }

    /// First close wins; notifies every subscriber of closure.
    pub(crate) fn close(&self) -> Result<()> {
        let subscribers = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Err(self.closed_error());
            }
            state.closed = true;
            std::mem::take(&mut state.subscribers)
        };
        info!(stream = %self.definition.name, "stream closed");
        for subscriber in subscribers {
            (subscriber.sink)(StreamMessage::Closed);
            if let Some(cb) = &self.options.on_subscriber_removed {
                cb(&subscriber.request);
            }
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }
}

/// Uninstrumented stream handle; the facade wraps it with telemetry.
pub(crate) struct RawStream {
    core: Arc<StreamCore>,
    protocol: Arc<dyn Protocol>,
    repository: Arc<ServerRepository>,
}

impl RawStream {
    pub(crate) fn definition(&self) -> &MethodDefinition {
        self.core.definition()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub(crate) fn push(&self, data: Value, branches: Option<&[String]>) -> Result<()> {
        self.core.push(data, branches)
    }

    /// Close the stream, drop its registration and announce the removal.
    pub(crate) fn close(&self) -> Result<()> {
        self.core.close()?;
        let definition = self.core.definition().clone();
        self.repository.remove(&definition.name);

        // The removal announcement is a protocol round-trip; close itself
        // stays synchronous.
        let protocol = self.protocol.clone();
        tokio::spawn(async move {
            if let Err(err) = protocol.unregister(&definition).await {
                warn!(method = %definition.name, "failed to announce stream removal: {err}");
            }
        });
        Ok(())
    }
}

/// Provider-facing API: owns the server registry and announces changes
/// over the protocol.
pub(crate) struct Server {
    protocol: Arc<dyn Protocol>,
    repository: Arc<ServerRepository>,
    instance: Instance,
}

impl Server {
    pub(crate) fn new(
        protocol: Arc<dyn Protocol>,
        repository: Arc<ServerRepository>,
        instance: Instance,
    ) -> Self {
        Self {
            protocol,
            repository,
            instance,
        }
    }

    pub(crate) async fn register(
        &self,
        definition: MethodDefinition,
        handler: MethodHandler,
    ) -> Result<()> {
        self.announce(definition, HandlerKind::Sync(handler)).await
    }

    pub(crate) async fn register_async(
        &self,
        definition: MethodDefinition,
        handler: AsyncMethodHandler,
    ) -> Result<()> {
        self.announce(definition, HandlerKind::Async(handler)).await
    }

    async fn announce(&self, definition: MethodDefinition, handler: HandlerKind) -> Result<()> {
        self.repository.add(ServerEntry {
            definition: definition.clone(),
            handler,
        });
        if let Err(err) = self.protocol.register(&definition).await {
            // Do not leave an entry the mesh never learned about.
            self.repository.remove(&definition.name);
            return Err(err);
        }
        info!(method = %definition.name, server = %self.instance, "method registered");
        Ok(())
    }

    /// Remove matching registrations and announce each removal.
    /// Unregistering a method that was never registered is a no-op.
    pub(crate) async fn unregister(&self, filter: &MethodDefinition) -> Result<()> {
        let removed = self.repository.remove_matching(filter);
        for entry in removed {
            if let HandlerKind::Stream(core) = &entry.handler {
                // Unregistering a live stream closes it.
                let _ = core.close();
            }
            self.protocol.unregister(&entry.definition).await?;
            info!(method = %entry.definition.name, "method unregistered");
        }
        Ok(())
    }

    pub(crate) async fn create_stream(
        &self,
        definition: MethodDefinition,
        options: StreamOptions,
    ) -> Result<RawStream> {
        let core = Arc::new(StreamCore::new(
            definition.clone(),
            self.instance.clone(),
            options,
        ));
        self.repository.add(ServerEntry {
            definition: definition.clone(),
            handler: HandlerKind::Stream(core.clone()),
        });
        if let Err(err) = self.protocol.register(&definition).await {
            self.repository.remove(&definition.name);
            return Err(err);
        }
        info!(stream = %definition.name, "stream created");
        Ok(RawStream {
            core,
            protocol: self.protocol.clone(),
            repository: self.repository.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn core() -> StreamCore {
        StreamCore::new(
            MethodDefinition::new("prices"),
            Instance::new("server", None),
            StreamOptions::default(),
        )
    }

    fn collecting_sink() -> (StreamSink, Arc<Mutex<Vec<StreamMessage>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink_store = received.clone();
        let sink: StreamSink = Arc::new(move |msg| sink_store.lock().unwrap().push(msg));
        (sink, received)
    }

    fn request(branch: Option<&str>) -> SubscriptionRequest {
        SubscriptionRequest {
            subscriber: Instance::new("client", None),
            arguments: None,
            branch: branch.map(String::from),
        }
    }

    #[test]
    fn test_push_reaches_subscribers() {
        let core = core();
        let (sink, received) = collecting_sink();
        core.handle_subscribe(request(None), sink).unwrap();

        core.push(json!({"px": 10}), None).unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        match &received[0] {
            StreamMessage::Data(data) => assert_eq!(data.data, json!({"px": 10})),
            StreamMessage::Closed => panic!("expected data"),
        }
    }

    #[test]
    fn test_named_branches_scope_delivery() {
        let core = core();
        let (fast_sink, fast) = collecting_sink();
        let (slow_sink, slow) = collecting_sink();
        let (unbranched_sink, unbranched) = collecting_sink();
        core.handle_subscribe(request(Some("fast")), fast_sink).unwrap();
        core.handle_subscribe(request(Some("slow")), slow_sink).unwrap();
        core.handle_subscribe(request(None), unbranched_sink).unwrap();

        core.push(json!(1), Some(&["fast".to_string()])).unwrap();

        assert_eq!(fast.lock().unwrap().len(), 1);
        assert!(slow.lock().unwrap().is_empty());
        // Subscribers outside every named branch receive nothing.
        assert!(unbranched.lock().unwrap().is_empty());
    }

    #[test]
    fn test_close_is_terminal() {
        let core = core();
        let (sink, received) = collecting_sink();
        core.handle_subscribe(request(None), sink).unwrap();

        core.close().unwrap();
        assert!(matches!(
            core.close(),
            Err(AgmError::StreamClosed { .. })
        ));
        assert!(matches!(
            core.push(json!(1), None),
            Err(AgmError::StreamClosed { .. })
        ));

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert!(matches!(received[0], StreamMessage::Closed));
    }

    #[test]
    fn test_rejected_subscription() {
        let options = StreamOptions {
            on_subscription_request: Some(Arc::new(|_req| {
                SubscriptionVerdict::Reject("not today".into())
            })),
            ..Default::default()
        };
        let core = StreamCore::new(
            MethodDefinition::new("prices"),
            Instance::new("server", None),
            options,
        );
        let (sink, _) = collecting_sink();
        let err = core.handle_subscribe(request(None), sink).unwrap_err();
        assert!(matches!(err, AgmError::SubscribeFailed { .. }));
    }

    #[test]
    fn test_verdict_can_pin_branch() {
        let options = StreamOptions {
            on_subscription_request: Some(Arc::new(|_req| {
                SubscriptionVerdict::AcceptOnBranch("vip".into())
            })),
            ..Default::default()
        };
        let core = StreamCore::new(
            MethodDefinition::new("prices"),
            Instance::new("server", None),
            options,
        );
        let (sink, received) = collecting_sink();
        core.handle_subscribe(request(None), sink).unwrap();

        core.push(json!(1), Some(&["vip".to_string()])).unwrap();
        assert_eq!(received.lock().unwrap().len(), 1);
    }
}
