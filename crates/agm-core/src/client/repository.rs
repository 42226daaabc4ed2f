//! Client-side registry of discovered servers and their methods.
//!
//! Mutations arrive from the protocol (registration notifications,
//! participants joining or leaving) and fire discovery events
//! synchronously, in listener-registration order, outside the state lock.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::events::CallbackRegistry;
use crate::instance::Instance;
use crate::types::{Method, MethodDefinition, ServerMethodEvent};

#[derive(Default)]
struct ClientState {
    servers: HashMap<String, Instance>,
    methods: Vec<Method>,
}

impl ClientState {
    fn providers_of(&self, name: &str) -> usize {
        self.methods
            .iter()
            .filter(|m| m.definition.name == name)
            .count()
    }
}

/// Discovered remote capabilities, plus the discovery event registries.
#[derive(Default)]
pub struct ClientRepository {
    state: Mutex<ClientState>,
    pub(crate) method_added: CallbackRegistry<Method>,
    pub(crate) method_removed: CallbackRegistry<Method>,
    pub(crate) server_added: CallbackRegistry<Instance>,
    pub(crate) server_removed: CallbackRegistry<Instance>,
    pub(crate) server_method_added: CallbackRegistry<ServerMethodEvent>,
    pub(crate) server_method_removed: CallbackRegistry<ServerMethodEvent>,
}

impl ClientRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a participant. Fires `server_added` the first time only.
    pub fn add_server(&self, server: Instance) {
        let is_new = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .servers
                .insert(server.instance_id.clone(), server.clone())
                .is_none()
        };
        if is_new {
            debug!(server = %server, "server added");
            self.server_added.notify(&server);
        }
    }

    /// Record a method registration by `server`. Replaces a previous
    /// registration of the same name by the same server.
    pub fn add_method(&self, server: Instance, definition: MethodDefinition) -> Method {
        self.add_server(server.clone());
        let method = Method::new(definition, server.clone());
        let first_provider = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.methods.retain(|m| {
                !(m.server.instance_id == server.instance_id
                    && m.definition.name == method.definition.name)
            });
            let first = state.providers_of(&method.definition.name) == 0;
            state.methods.push(method.clone());
            first
        };

        self.server_method_added.notify(&ServerMethodEvent {
            server,
            method: method.clone(),
        });
        if first_provider {
            self.method_added.notify(&method);
        }
        method
    }

    /// Remove one method of one server, firing removal events. Removing an
    /// unknown method is a no-op.
    pub fn remove_method(&self, server_id: &str, name: &str) {
        let (removed, last_provider) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let removed = state
                .methods
                .iter()
                .position(|m| m.server.instance_id == server_id && m.definition.name == name)
                .map(|idx| state.methods.remove(idx));
            let last = removed.is_some() && state.providers_of(name) == 0;
            (removed, last)
        };

        if let Some(method) = removed {
            self.server_method_removed.notify(&ServerMethodEvent {
                server: method.server.clone(),
                method: method.clone(),
            });
            if last_provider {
                self.method_removed.notify(&method);
            }
        }
    }

    /// Drop a participant and everything it exposed. Fires per-method
    /// removal events, then `server_removed`.
    pub fn remove_server(&self, server_id: &str) {
        let (server, methods) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let server = state.servers.remove(server_id);
            let methods: Vec<Method> = state
                .methods
                .iter()
                .filter(|m| m.server.instance_id == server_id)
                .cloned()
                .collect();
            state
                .methods
                .retain(|m| m.server.instance_id != server_id);
            (server, methods)
        };

        for method in methods {
            self.server_method_removed.notify(&ServerMethodEvent {
                server: method.server.clone(),
                method: method.clone(),
            });
            let others = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.providers_of(&method.definition.name)
            };
            if others == 0 {
                self.method_removed.notify(&method);
            }
        }
        if let Some(server) = server {
            debug!(server = %server, "server removed");
            self.server_removed.notify(&server);
        }
    }

    /// Methods matching `filter`, one entry per method name.
    pub fn methods(&self, filter: Option<&MethodDefinition>) -> Vec<Method> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut seen = Vec::new();
        let mut result = Vec::new();
        for method in &state.methods {
            if filter.is_some_and(|f| !method.definition.matches(f)) {
                continue;
            }
            if seen.contains(&method.definition.name) {
                continue;
            }
            seen.push(method.definition.name.clone());
            result.push(method.clone());
        }
        result
    }

    /// Participants exposing at least one method matching `filter`; all
    /// known participants when no filter is given.
    pub fn servers(&self, filter: Option<&MethodDefinition>) -> Vec<Instance> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match filter {
            None => state.servers.values().cloned().collect(),
            Some(f) => {
                let mut result: Vec<Instance> = Vec::new();
                for method in &state.methods {
                    if method.definition.matches(f)
                        && !result
                            .iter()
                            .any(|s| s.instance_id == method.server.instance_id)
                    {
                        result.push(method.server.clone());
                    }
                }
                result
            }
        }
    }

    /// Everything one participant currently exposes.
    pub fn methods_for_instance(&self, server_id: &str) -> Vec<Method> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state
            .methods
            .iter()
            .filter(|m| m.server.instance_id == server_id)
            .cloned()
            .collect()
    }
}
