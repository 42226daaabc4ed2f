//! Participant identity.
//!
//! One `Instance` is produced per process at facade construction and then
//! shared by reference everywhere an operation needs a caller or callee.
//! It is never mutated after creation; equality is plain field equality.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of one participant in the interop mesh.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Instance {
    /// Application name the participant announces.
    pub application: String,
    /// Unique runtime id, generated once per facade.
    pub instance_id: String,
    /// Environment tag (e.g. "DEV", "PROD").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Machine identifier, when the host supplies one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine: Option<String>,
    /// OS process id of the participant.
    pub process_id: u32,
}

impl Instance {
    /// Create the identity for this process.
    pub fn new(application: impl Into<String>, environment: Option<String>) -> Self {
        Self {
            application: application.into(),
            instance_id: Uuid::new_v4().to_string(),
            environment,
            machine: None,
            process_id: std::process::id(),
        }
    }
}

impl std::fmt::Display for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.application, self.instance_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_ids_are_unique() {
        let a = Instance::new("app", None);
        let b = Instance::new("app", None);
        assert_ne!(a.instance_id, b.instance_id);
        assert_ne!(a, b);
    }

    #[test]
    fn test_field_equality() {
        let a = Instance::new("app", Some("DEV".into()));
        let b = a.clone();
        assert_eq!(a, b);
    }
}
