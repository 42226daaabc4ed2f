//! Server-side registry: methods this process exposes for remote
//! invocation, including live streams.

use std::sync::{Arc, Mutex};

use crate::types::MethodDefinition;

use super::{AsyncMethodHandler, MethodHandler, StreamCore};

/// How a registered method executes.
#[derive(Clone)]
pub(crate) enum HandlerKind {
    Sync(MethodHandler),
    Async(AsyncMethodHandler),
    Stream(Arc<StreamCore>),
}

/// One local registration.
#[derive(Clone)]
pub(crate) struct ServerEntry {
    pub(crate) definition: MethodDefinition,
    pub(crate) handler: HandlerKind,
}

/// Local registrations in registration order, keyed by method name.
#[derive(Default)]
pub(crate) struct ServerRepository {
    entries: Mutex<Vec<ServerEntry>>,
}

impl ServerRepository {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Insert or replace by name. Re-registering swaps the handler.
    pub(crate) fn add(&self, entry: ServerEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries
            .iter_mut()
            .find(|e| e.definition.name == entry.definition.name)
        {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<ServerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .find(|e| e.definition.name == name)
            .cloned()
    }

    pub(crate) fn remove(&self, name: &str) -> Option<ServerEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .position(|e| e.definition.name == name)
            .map(|idx| entries.remove(idx))
    }

    /// Remove every entry matching `filter` and return them.
    pub(crate) fn remove_matching(&self, filter: &MethodDefinition) -> Vec<ServerEntry> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let (removed, kept): (Vec<ServerEntry>, Vec<ServerEntry>) = entries
            .drain(..)
            .partition(|e| e.definition.matches(filter));
        *entries = kept;
        removed
    }

    pub(crate) fn entries(&self) -> Vec<ServerEntry> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::instance::Instance;
    use serde_json::{json, Value};
    use std::sync::Arc;

    fn sync_entry(name: &str, value: Value) -> ServerEntry {
        let handler: MethodHandler = Arc::new(move |_args, _caller: Instance| -> Result<Value> {
            Ok(value.clone())
        });
        ServerEntry {
            definition: MethodDefinition::new(name),
            handler: HandlerKind::Sync(handler),
        }
    }

    #[test]
    fn test_add_replaces_same_name() {
        let repo = ServerRepository::new();
        repo.add(sync_entry("sum", json!(1)));
        repo.add(sync_entry("sum", json!(2)));

        assert_eq!(repo.entries().len(), 1);
        let entry = repo.lookup("sum").unwrap();
        match entry.handler {
            HandlerKind::Sync(h) => {
                assert_eq!(h(json!({}), Instance::new("x", None)).unwrap(), json!(2))
            }
            _ => panic!("expected sync handler"),
        }
    }

    #[test]
    fn test_remove_matching_is_noop_for_unknown() {
        let repo = ServerRepository::new();
        repo.add(sync_entry("sum", json!(1)));
        let removed = repo.remove_matching(&MethodDefinition::new("missing"));
        assert!(removed.is_empty());
        assert_eq!(repo.entries().len(), 1);
    }
}
