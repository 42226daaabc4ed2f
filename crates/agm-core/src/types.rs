//! Shared data model: method definitions, discovered methods, invocation
//! results and targeting.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::instance::Instance;

/// Names (and optionally types) a remote capability.
///
/// Used both to register a method and as a lookup filter. As a filter,
/// only the supplied optional fields constrain the match; the name always
/// must match exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDefinition {
    pub name: String,
    /// Domain object types this method operates on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub object_types: Vec<String>,
    /// Signature of the accepted arguments, free-form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub accepts: Option<String>,
    /// Signature of the returned value, free-form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returns: Option<String>,
}

impl MethodDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            object_types: Vec::new(),
            accepts: None,
            returns: None,
        }
    }

    /// True when this definition satisfies `filter`: equal name, plus every
    /// filter field that is actually supplied.
    pub fn matches(&self, filter: &MethodDefinition) -> bool {
        if self.name != filter.name {
            return false;
        }
        if !filter.object_types.is_empty()
            && !filter.object_types.iter().all(|t| self.object_types.contains(t))
        {
            return false;
        }
        if let Some(accepts) = &filter.accepts {
            if self.accepts.as_ref() != Some(accepts) {
                return false;
            }
        }
        if let Some(returns) = &filter.returns {
            if self.returns.as_ref() != Some(returns) {
                return false;
            }
        }
        true
    }
}

impl From<&str> for MethodDefinition {
    fn from(name: &str) -> Self {
        MethodDefinition::new(name)
    }
}

impl From<String> for MethodDefinition {
    fn from(name: String) -> Self {
        MethodDefinition::new(name)
    }
}

/// A capability discovered from a remote participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Method {
    pub definition: MethodDefinition,
    /// The participant that registered the method.
    pub server: Instance,
    pub registered_at: DateTime<Utc>,
}

impl Method {
    pub fn new(definition: MethodDefinition, server: Instance) -> Self {
        Self {
            definition,
            server,
            registered_at: Utc::now(),
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Discovery notification pairing a server with one of its methods.
#[derive(Debug, Clone)]
pub struct ServerMethodEvent {
    pub server: Instance,
    pub method: Method,
}

/// Which participant(s) an invocation addresses.
#[derive(Debug, Clone, Default)]
pub enum InvokeTarget {
    /// First matching server (the implicit single target).
    #[default]
    Best,
    /// Every server currently exposing the method.
    All,
    /// Exactly this instance.
    Instance(Instance),
    /// An explicit list of instances.
    List(Vec<Instance>),
}

/// Per-call invocation options.
#[derive(Debug, Clone, Default)]
pub struct InvokeOptions {
    /// Overrides the configured `method_response_timeout` for this call.
    pub method_response_timeout: Option<Duration>,
}

/// Outcome of one target's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationStatus {
    Succeeded,
    Failed,
}

/// One target's slice of an [`InvocationResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResultEntry {
    pub executed_by: Instance,
    pub status: InvocationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub returned: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Aggregated result of one `invoke` call. Immutable once returned;
/// per-target failures live in their entry rather than failing the call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationResult {
    pub method: MethodDefinition,
    pub called_with: Value,
    pub results: Vec<InvocationResultEntry>,
}

impl InvocationResult {
    /// First successful entry, if any.
    pub fn first_success(&self) -> Option<&InvocationResultEntry> {
        self.results
            .iter()
            .find(|e| e.status == InvocationStatus::Succeeded)
    }

    /// Convenience: the value returned by the first successful target.
    pub fn returned(&self) -> Option<&Value> {
        self.first_success().and_then(|e| e.returned.as_ref())
    }

    pub fn succeeded(&self) -> usize {
        self.results
            .iter()
            .filter(|e| e.status == InvocationStatus::Succeeded)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }
}

/// Options for `subscribe`.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionParams {
    /// Arguments handed to the server's subscription-request handler.
    pub arguments: Option<Value>,
    /// Branch the subscriber asks to be placed on.
    pub branch: Option<String>,
    /// Which stream server to subscribe to.
    pub target: InvokeTarget,
}

/// One payload pushed from a stream to a subscriber.
#[derive(Debug, Clone)]
pub struct StreamData {
    pub data: Value,
    /// The participant that owns the stream.
    pub server: Instance,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_matches_by_name() {
        let def = MethodDefinition::new("sum");
        assert!(def.matches(&"sum".into()));
        assert!(!def.matches(&"other".into()));
    }

    #[test]
    fn test_filter_constrains_supplied_fields_only() {
        let mut def = MethodDefinition::new("sum");
        def.object_types = vec!["number".into(), "pair".into()];
        def.accepts = Some("int a, int b".into());

        let mut filter = MethodDefinition::new("sum");
        assert!(def.matches(&filter));

        filter.object_types = vec!["number".into()];
        assert!(def.matches(&filter));

        filter.accepts = Some("string".into());
        assert!(!def.matches(&filter));
    }

    #[test]
    fn test_invocation_result_aggregates() {
        let server = Instance::new("calc", None);
        let result = InvocationResult {
            method: MethodDefinition::new("sum"),
            called_with: serde_json::json!({"a": 1}),
            results: vec![
                InvocationResultEntry {
                    executed_by: server.clone(),
                    status: InvocationStatus::Failed,
                    returned: None,
                    message: Some("boom".into()),
                },
                InvocationResultEntry {
                    executed_by: server,
                    status: InvocationStatus::Succeeded,
                    returned: Some(serde_json::json!(3)),
                    message: None,
                },
            ],
        };
        assert_eq!(result.succeeded(), 1);
        assert_eq!(result.failed(), 1);
        assert_eq!(result.returned(), Some(&serde_json::json!(3)));
    }
}
