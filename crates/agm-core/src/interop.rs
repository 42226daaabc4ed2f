//! Interop facade: the single entry point tying configuration, protocol
//! resolution, the caller/provider halves and the telemetry pipeline
//! together.
//!
//! Construction validates the configuration synchronously, then resolves
//! the protocol in the background. Operations called before resolution
//! settles fail fast with a not-ready error rather than queueing.

use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};

use serde_json::{json, Value};
use tokio::sync::{oneshot, watch};
use tracing::{error, info};

use crate::client::repository::ClientRepository;
use crate::client::{Client, Subscription};
use crate::config::{InteropConfig, InteropDefaults};
use crate::error::{AgmError, Result};
use crate::events::ListenerHandle;
use crate::instance::Instance;
use crate::monitoring::collection::UnboundedPerfCollection;
use crate::monitoring::logger::{LogMessage, PerfLogger, PerfSpan};
use crate::monitoring::PerfDomain;
use crate::protocol::resolve_protocol;
use crate::server::repository::ServerRepository;
use crate::server::{
    AsyncMethodHandler, MethodHandler, RawStream, Server, StreamOptions,
};
use crate::types::{
    InvocationResult, InvokeOptions, InvokeTarget, Method, MethodDefinition, ServerMethodEvent,
    SubscriptionParams,
};

/// Resolution progress observed by [`Interop::ready`].
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadyState {
    Pending,
    Ready,
    Failed(String),
}

/// Everything that only exists once the protocol has resolved.
struct Wired {
    protocol: Arc<dyn crate::protocol::Protocol>,
    client: Client,
    server: Server,
}

struct InteropInner {
    instance: Instance,
    config: InteropConfig,
    client_repository: Arc<ClientRepository>,
    perf: Arc<PerfLogger>,
    wired: OnceLock<Wired>,
    ready_rx: watch::Receiver<ReadyState>,
}

/// The interop API of one participant.
///
/// Dropping the facade disconnects it from the mesh.
pub struct Interop {
    inner: Arc<InteropInner>,
}

impl std::fmt::Debug for Interop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interop")
            .field("instance", &self.inner.instance)
            .finish_non_exhaustive()
    }
}

impl Interop {
    /// Validate `config` and start resolving the protocol.
    ///
    /// Fails synchronously on a missing connection or an unsupported
    /// protocol version; transport-level resolution happens in the
    /// background and is awaited via [`ready`]. Must be called within a
    /// Tokio runtime.
    ///
    /// [`ready`]: Interop::ready
    pub fn new(config: InteropConfig) -> Result<Self> {
        let connection = config.connection.clone().ok_or_else(|| AgmError::Config {
            message: "configuration.connection is required".to_string(),
        })?;
        if connection.protocol_version != InteropDefaults::SUPPORTED_PROTOCOL_VERSION {
            return Err(AgmError::UnsupportedProtocolVersion {
                version: connection.protocol_version,
            });
        }

        let application = config
            .application
            .clone()
            .unwrap_or_else(|| "unnamed-application".to_string());
        let instance = Instance::new(application, config.environment.clone());

        let perf = config.perf_logger.clone().unwrap_or_else(|| {
            Arc::new(PerfLogger::new(Arc::new(UnboundedPerfCollection::new())))
        });
        let span = perf.start(
            LogMessage::new(
                PerfDomain::Interop,
                json!({
                    "methodName": "interop constructor",
                    "configuration": {
                        "waitTimeoutMs": config.wait_timeout().as_millis() as u64,
                        "methodResponseTimeoutMs":
                            config.method_response_timeout().as_millis() as u64,
                    },
                }),
            )
            .local(),
        );

        let client_repository = Arc::new(ClientRepository::new());
        let server_repository = Arc::new(ServerRepository::new());
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);

        let inner = Arc::new(InteropInner {
            instance: instance.clone(),
            config: config.clone(),
            client_repository: client_repository.clone(),
            perf,
            wired: OnceLock::new(),
            ready_rx,
        });

        let task_inner = inner.clone();
        tokio::spawn(async move {
            let resolved = resolve_protocol(
                instance.clone(),
                connection,
                client_repository.clone(),
                server_repository.clone(),
                &task_inner.config,
            )
            .await;

            match resolved {
                Ok(protocol) => {
                    let wired = Wired {
                        protocol: protocol.clone(),
                        client: Client::new(
                            protocol.clone(),
                            client_repository,
                            instance.clone(),
                            task_inner.config.method_response_timeout(),
                        ),
                        server: Server::new(protocol, server_repository, instance.clone()),
                    };
                    // set can only fail if this task ran twice, which it does not.
                    let _ = task_inner.wired.set(wired);
                    let _ = ready_tx.send(ReadyState::Ready);
                    info!(instance = %instance, "interop ready");
                    span.success(None);
                }
                Err(err) => {
                    let message = err.to_string();
                    let _ = ready_tx.send(ReadyState::Failed(message.clone()));
                    error!(instance = %instance, "protocol resolution failed: {message}");
                    span.error(message);
                }
            }
        });

        Ok(Self { inner })
    }

    /// Wait until the protocol has resolved. Fails if resolution failed.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.inner.ready_rx.clone();
        loop {
            match rx.borrow().clone() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(message) => return Err(AgmError::Other(message)),
                ReadyState::Pending => {}
            }
            if rx.changed().await.is_err() {
                return Err(AgmError::Other(
                    "protocol resolution task terminated".to_string(),
                ));
            }
        }
    }

    /// Identity this participant announces to the mesh.
    pub fn instance(&self) -> &Instance {
        &self.inner.instance
    }

    /// The telemetry pipeline this facade records into.
    pub fn perf_logger(&self) -> &Arc<PerfLogger> {
        &self.inner.perf
    }

    fn wired(&self) -> Result<&Wired> {
        self.inner.wired.get().ok_or(AgmError::NotReady)
    }

    fn settle<T>(span: PerfSpan, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => span.success(None),
            Err(err) => span.error(err.to_string()),
        }
        result
    }

    /// Register a synchronous method.
    pub async fn register<F>(&self, definition: MethodDefinition, handler: F) -> Result<()>
    where
        F: Fn(Value, Instance) -> Result<Value> + Send + Sync + 'static,
    {
        let span = self.inner.perf.start(LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "register", "methodDefinition": definition.name}),
        ));
        let result = match self.wired() {
            Ok(wired) => {
                let handler: MethodHandler = Arc::new(handler);
                wired.server.register(definition, handler).await
            }
            Err(err) => Err(err),
        };
        Self::settle(span, result)
    }

    /// Register a method executed asynchronously. The handler's future
    /// settles the invocation; pending invocations are bounded by the
    /// caller's response timeout.
    pub async fn register_async<F, Fut>(
        &self,
        definition: MethodDefinition,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Value, Instance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let span = self.inner.perf.start(LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "registerAsync", "methodDefinition": definition.name}),
        ));
        let result = match self.wired() {
            Ok(wired) => {
                let handler: AsyncMethodHandler =
                    Arc::new(move |args, caller| Box::pin(handler(args, caller)));
                wired.server.register_async(definition, handler).await
            }
            Err(err) => Err(err),
        };
        Self::settle(span, result)
    }

    /// Remove registrations matching `filter` and announce each removal.
    pub async fn unregister(&self, filter: MethodDefinition) -> Result<()> {
        let span = self.inner.perf.start(LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "unregister", "methodFilter": filter.name}),
        ));
        let result = match self.wired() {
            Ok(wired) => wired.server.unregister(&filter).await,
            Err(err) => Err(err),
        };
        Self::settle(span, result)
    }

    /// Invoke `filter` on the selected target(s).
    pub async fn invoke(
        &self,
        filter: MethodDefinition,
        args: Value,
        target: InvokeTarget,
        options: Option<InvokeOptions>,
    ) -> Result<InvocationResult> {
        let span = self.inner.perf.start(
            LogMessage::new(
                PerfDomain::Interop,
                json!({
                    "methodName": "invoke",
                    "methodFilter": filter.name,
                    "target": target_tag(&target),
                }),
            )
            .with_args(args.clone()),
        );
        let result = match self.wired() {
            Ok(wired) => {
                wired
                    .client
                    .invoke(&filter, args, target, options.unwrap_or_default())
                    .await
            }
            Err(err) => Err(err),
        };
        match &result {
            Ok(invocation) => span.success(serde_json::to_value(invocation).ok().as_ref()),
            Err(err) => span.error(err.to_string()),
        }
        result
    }

    /// Subscribe to a stream matching `filter`.
    pub async fn subscribe(
        &self,
        filter: MethodDefinition,
        params: SubscriptionParams,
    ) -> Result<Subscription> {
        let mut msg = LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "subscribe", "methodFilter": filter.name}),
        );
        if let Some(arguments) = &params.arguments {
            msg = msg.with_args(arguments.clone());
        }
        let span = self.inner.perf.start(msg);
        let result = match self.wired() {
            Ok(wired) => wired.client.subscribe(&filter, params).await,
            Err(err) => Err(err),
        };
        Self::settle(span, result)
    }

    /// Create a stream this participant serves.
    pub async fn create_stream(
        &self,
        definition: MethodDefinition,
        options: StreamOptions,
    ) -> Result<Stream> {
        let span = self.inner.perf.start(LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "createStream", "methodDefinition": definition.name}),
        ));
        let result = match self.wired() {
            Ok(wired) => wired
                .server
                .create_stream(definition, options)
                .await
                .map(|raw| Stream {
                    name: raw.definition().name.clone(),
                    raw,
                    perf: self.inner.perf.clone(),
                }),
            Err(err) => Err(err),
        };
        Self::settle(span, result)
    }

    /// Methods currently discoverable, optionally narrowed by `filter`.
    pub fn methods(&self, filter: Option<&MethodDefinition>) -> Result<Vec<Method>> {
        let msg = LogMessage::new(PerfDomain::Interop, json!({"methodName": "methods"}))
            .local()
            .with_args(json!({"methodFilter": filter.map(|f| f.name.clone())}));
        let result = self.wired().map(|wired| wired.client.methods(filter));
        self.log_read(msg, &result);
        result
    }

    /// Participants currently discoverable, optionally narrowed to those
    /// offering a method matching `filter`.
    pub fn servers(&self, filter: Option<&MethodDefinition>) -> Result<Vec<Instance>> {
        let msg = LogMessage::new(PerfDomain::Interop, json!({"methodName": "servers"}))
            .local()
            .with_args(json!({"methodFilter": filter.map(|f| f.name.clone())}));
        let result = self.wired().map(|wired| wired.client.servers(filter));
        self.log_read(msg, &result);
        result
    }

    /// Everything one participant currently exposes.
    pub fn methods_for_instance(&self, server: &Instance) -> Result<Vec<Method>> {
        let msg = LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "methodsForInstance"}),
        )
        .local()
        .with_args(json!({"instance": server.instance_id}));
        let result = self
            .wired()
            .map(|wired| wired.client.methods_for_instance(server));
        self.log_read(msg, &result);
        result
    }

    /// One-shot record for a synchronous read, failed or not.
    fn log_read<T>(&self, msg: LogMessage, result: &Result<T>) {
        match result {
            Ok(_) => self.inner.perf.log(msg),
            Err(err) => self.inner.perf.log(msg.with_error(err.to_string())),
        }
    }

    /// Resolve once a method named by `filter` is announced, within the
    /// configured wait timeout. Listens for announcements only; a method
    /// already present does not satisfy the wait.
    pub async fn wait_for_method(&self, filter: MethodDefinition) -> Result<Method> {
        let span = self.inner.perf.start(LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "waitForMethod", "methodFilter": filter.name}),
        ));
        let result = self.wait_for_method_inner(&filter).await;
        Self::settle(span, result)
    }

    async fn wait_for_method_inner(&self, filter: &MethodDefinition) -> Result<Method> {
        self.wired()?;
        let (tx, rx) = oneshot::channel::<Method>();
        let tx = Mutex::new(Some(tx));
        let name = filter.name.clone();
        let handle = self
            .inner
            .client_repository
            .method_added
            .add(move |method: &Method| {
                if method.definition.name != name {
                    return;
                }
                // First announcement wins; later matches find the slot empty.
                if let Some(tx) = tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _ = tx.send(method.clone());
                }
            });

        let timeout = self.inner.config.wait_timeout();
        let outcome = tokio::time::timeout(timeout, rx).await;
        handle.unsubscribe();
        match outcome {
            Ok(Ok(method)) => Ok(method),
            Ok(Err(_)) => Err(AgmError::Other(
                "method announcement listener dropped".to_string(),
            )),
            Err(_) => Err(AgmError::Timeout {
                method: filter.name.clone(),
                timeout,
            }),
        }
    }

    /// A method became discoverable (first provider).
    pub fn on_method_added(
        &self,
        callback: impl Fn(&Method) + Send + Sync + 'static,
    ) -> ListenerHandle<Method> {
        self.log_callback_registration("onMethodAdded");
        self.inner.client_repository.method_added.add(callback)
    }

    /// A method's last provider went away.
    pub fn on_method_removed(
        &self,
        callback: impl Fn(&Method) + Send + Sync + 'static,
    ) -> ListenerHandle<Method> {
        self.log_callback_registration("onMethodRemoved");
        self.inner.client_repository.method_removed.add(callback)
    }

    pub fn on_server_added(
        &self,
        callback: impl Fn(&Instance) + Send + Sync + 'static,
    ) -> ListenerHandle<Instance> {
        self.log_callback_registration("onServerAdded");
        self.inner.client_repository.server_added.add(callback)
    }

    pub fn on_server_removed(
        &self,
        callback: impl Fn(&Instance) + Send + Sync + 'static,
    ) -> ListenerHandle<Instance> {
        self.log_callback_registration("onServerRemoved");
        self.inner.client_repository.server_removed.add(callback)
    }

    /// A specific server announced a method.
    pub fn on_server_method_added(
        &self,
        callback: impl Fn(&ServerMethodEvent) + Send + Sync + 'static,
    ) -> ListenerHandle<ServerMethodEvent> {
        self.log_callback_registration("onServerMethodAdded");
        self.inner
            .client_repository
            .server_method_added
            .add(callback)
    }

    /// A specific server withdrew a method.
    pub fn on_server_method_removed(
        &self,
        callback: impl Fn(&ServerMethodEvent) + Send + Sync + 'static,
    ) -> ListenerHandle<ServerMethodEvent> {
        self.log_callback_registration("onServerMethodRemoved");
        self.inner
            .client_repository
            .server_method_removed
            .add(callback)
    }

    fn log_callback_registration(&self, method_name: &str) {
        self.inner.perf.log(
            LogMessage::new(PerfDomain::Interop, json!({"methodName": method_name})).local(),
        );
    }
}

impl Drop for Interop {
    fn drop(&mut self) {
        if let Some(wired) = self.inner.wired.get() {
            wired.protocol.shutdown();
        }
    }
}

fn target_tag(target: &InvokeTarget) -> &'static str {
    match target {
        InvokeTarget::Best => "best",
        InvokeTarget::All => "all",
        InvokeTarget::Instance(_) => "instance",
        InvokeTarget::List(_) => "list",
    }
}

/// Server-side stream handle with instrumented push/close.
pub struct Stream {
    raw: RawStream,
    perf: Arc<PerfLogger>,
    name: String,
}

impl Stream {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn definition(&self) -> &MethodDefinition {
        self.raw.definition()
    }

    pub fn is_closed(&self) -> bool {
        self.raw.is_closed()
    }

    /// Push `data` to subscribers. With named branches, delivery is scoped
    /// to subscribers pinned to one of them.
    pub fn push(&self, data: Value, branches: Option<&[String]>) -> Result<()> {
        let result = self.raw.push(data.clone(), branches);
        let mut msg = LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "push", "streamDef": self.name}),
        )
        .with_args(data);
        if let Err(err) = &result {
            msg = msg.with_error(err.to_string());
        }
        self.perf.log(msg);
        result
    }

    /// Close the stream. Terminal: the second close fails.
    pub fn close(&self) -> Result<()> {
        let result = self.raw.close();
        let mut msg = LogMessage::new(
            PerfDomain::Interop,
            json!({"methodName": "closeStream", "streamDef": self.name}),
        );
        if let Err(err) = &result {
            msg = msg.with_error(err.to_string());
        }
        self.perf.log(msg);
        result
    }
}
