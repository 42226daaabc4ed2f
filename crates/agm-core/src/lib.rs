//! AGM interop core: method registration, discovery, invocation fan-out,
//! server-pushed streams and a telemetry pipeline recording every
//! operation's lifecycle.
//!
//! The entry point is [`Interop`]: configure it with an [`InteropConfig`]
//! carrying a [`ConnectionConfig`] over a shared [`Gateway`], await
//! [`Interop::ready`], then register methods and invoke them across
//! participants of the same mesh.
//!
//! ```no_run
//! use agm_core::{ConnectionConfig, Gateway, Interop, InteropConfig, InvokeTarget};
//! use serde_json::json;
//!
//! # async fn run() -> agm_core::Result<()> {
//! let gateway = Gateway::new();
//! let provider = Interop::new(InteropConfig::new(
//!     "calculator",
//!     ConnectionConfig::new(gateway.clone()),
//! ))?;
//! provider.ready().await?;
//! provider
//!     .register("sum".into(), |args, _caller| {
//!         let a = args["a"].as_i64().unwrap_or(0);
//!         let b = args["b"].as_i64().unwrap_or(0);
//!         Ok(json!(a + b))
//!     })
//!     .await?;
//!
//! let caller = Interop::new(InteropConfig::new(
//!     "dashboard",
//!     ConnectionConfig::new(gateway),
//! ))?;
//! caller.ready().await?;
//! let result = caller
//!     .invoke("sum".into(), json!({"a": 1, "b": 2}), InvokeTarget::Best, None)
//!     .await?;
//! assert_eq!(result.returned(), Some(&json!(3)));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod instance;
pub mod monitoring;
pub mod protocol;
pub mod types;

mod client;
mod interop;
mod server;

pub use client::Subscription;
pub use config::{ConnectionConfig, InteropConfig, InteropDefaults};
pub use error::{AgmError, Result};
pub use events::{CallbackRegistry, ListenerHandle};
pub use instance::Instance;
pub use interop::{Interop, Stream};
pub use monitoring::{
    InstanceEvents, LogMessage, PerfClient, PerfDomain, PerfEvent, PerfLogger, PerfManager,
    PerfSpan, PerfStatus, MONITORING_GET_EVENTS,
};
pub use protocol::local::Gateway;
pub use protocol::{Protocol, SubscriptionToken};
pub use server::{
    AsyncMethodHandler, MethodHandler, StreamMessage, StreamOptions, StreamSink,
    SubscriberCallback, SubscriptionRequest, SubscriptionRequestHandler, SubscriptionVerdict,
};
pub use types::{
    InvocationResult, InvocationResultEntry, InvocationStatus, InvokeOptions, InvokeTarget,
    Method, MethodDefinition, ServerMethodEvent, StreamData, SubscriptionParams,
};
