//! Configuration for the interop facade.
//!
//! A configuration must carry a connection descriptor; everything else has
//! defaults. Validation happens synchronously in [`Interop::new`], not on
//! first use.
//!
//! [`Interop::new`]: crate::Interop::new

use std::sync::Arc;
use std::time::Duration;

use crate::monitoring::PerfLogger;
use crate::protocol::local::Gateway;

/// Defaults and fixed parameters of the interop core.
pub struct InteropDefaults;

impl InteropDefaults {
    /// Applied when `method_response_timeout` is not set.
    pub const METHOD_RESPONSE_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// Applied when `wait_timeout` is not set.
    pub const WAIT_TIMEOUT: Duration = Duration::from_millis(30_000);
    /// The only protocol version this build can resolve.
    pub const SUPPORTED_PROTOCOL_VERSION: u8 = 3;
}

/// Connection descriptor: which protocol version to resolve and the
/// gateway that carries it.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Protocol version tag; resolution is keyed by this.
    pub protocol_version: u8,
    /// In-process gateway handle shared by all participants of one mesh.
    pub gateway: Gateway,
}

impl ConnectionConfig {
    /// Connection over `gateway` with the supported protocol version.
    pub fn new(gateway: Gateway) -> Self {
        Self {
            protocol_version: InteropDefaults::SUPPORTED_PROTOCOL_VERSION,
            gateway,
        }
    }
}

/// Configuration accepted by [`Interop::new`].
///
/// [`Interop::new`]: crate::Interop::new
#[derive(Clone, Default)]
pub struct InteropConfig {
    /// Required. Construction fails without it.
    pub connection: Option<ConnectionConfig>,
    /// Name this participant announces to the mesh.
    pub application: Option<String>,
    /// Environment tag carried in the instance identity (e.g. "DEV", "PROD").
    pub environment: Option<String>,
    /// Per-invocation response timeout. Defaults to 30 s.
    pub method_response_timeout: Option<Duration>,
    /// Method-discovery wait timeout (`wait_for_method`). Defaults to 30 s.
    pub wait_timeout: Option<Duration>,
    /// Telemetry pipeline to record into. When absent the facade creates
    /// its own over an unbounded collection.
    pub perf_logger: Option<Arc<PerfLogger>>,
}

impl InteropConfig {
    /// Configuration for `application` over `connection`, defaults elsewhere.
    pub fn new(application: impl Into<String>, connection: ConnectionConfig) -> Self {
        Self {
            connection: Some(connection),
            application: Some(application.into()),
            ..Default::default()
        }
    }

    /// Set the per-invocation response timeout.
    pub fn with_method_response_timeout(mut self, timeout: Duration) -> Self {
        self.method_response_timeout = Some(timeout);
        self
    }

    /// Set the method-discovery wait timeout.
    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = Some(timeout);
        self
    }

    /// Set the environment tag.
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Record telemetry into an externally owned pipeline.
    pub fn with_perf_logger(mut self, perf_logger: Arc<PerfLogger>) -> Self {
        self.perf_logger = Some(perf_logger);
        self
    }

    /// Effective response timeout with the default applied.
    pub fn method_response_timeout(&self) -> Duration {
        self.method_response_timeout
            .unwrap_or(InteropDefaults::METHOD_RESPONSE_TIMEOUT)
    }

    /// Effective discovery wait timeout with the default applied.
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout.unwrap_or(InteropDefaults::WAIT_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_defaults() {
        let config = InteropConfig::default();
        assert_eq!(
            config.method_response_timeout(),
            Duration::from_millis(30_000)
        );
        assert_eq!(config.wait_timeout(), Duration::from_millis(30_000));
    }

    #[test]
    fn test_explicit_timeouts_win() {
        let config = InteropConfig::default()
            .with_method_response_timeout(Duration::from_secs(5))
            .with_wait_timeout(Duration::from_secs(1));
        assert_eq!(config.method_response_timeout(), Duration::from_secs(5));
        assert_eq!(config.wait_timeout(), Duration::from_secs(1));
    }
}
