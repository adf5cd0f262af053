//! Process-wide registries for struct definitions and running servers.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::server::ServerHandle;

/// A struct type: name plus declared field order. Immutable once
/// registered.
#[derive(Debug, Clone, PartialEq)]
pub struct StructDef {
    pub name: String,
    pub fields: Vec<String>,
}

#[derive(Clone, Default)]
pub struct StructRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<StructDef>>>>,
}

impl StructRegistry {
    pub fn new() -> StructRegistry {
        StructRegistry::default()
    }

    pub fn register(&self, def: StructDef) {
        let mut map = self.inner.write();
        if map.contains_key(&def.name) {
            tracing::debug!(name = %def.name, "struct redeclared, replacing definition");
        }
        map.insert(def.name.clone(), Arc::new(def));
    }

    pub fn get(&self, name: &str) -> Option<Arc<StructDef>> {
        self.inner.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().contains_key(name)
    }
}

/// Method metadata exposed for registry listings and named-parameter
/// mapping at the gateway.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodInfo {
    pub name: String,
    pub params: Vec<String>,
}

#[derive(Clone, Default)]
pub struct ServerRegistry {
    inner: Arc<RwLock<HashMap<String, ServerHandle>>>,
}

impl ServerRegistry {
    pub fn new() -> ServerRegistry {
        ServerRegistry::default()
    }

    /// Registers a server under its name. A redeclaration replaces the old
    /// instance, which is shut down.
    pub fn register(&self, handle: ServerHandle) {
        let previous = self
            .inner
            .write()
            .insert(handle.name().to_string(), handle.clone());
        if let Some(old) = previous {
            tracing::info!(server = %old.name(), "server redeclared, stopping previous instance");
            old.stop();
        }
    }

    pub fn get(&self, name: &str) -> Option<ServerHandle> {
        self.inner.read().get(name).cloned()
    }

    /// Removes and stops one server. Returns false when no such server is
    /// registered.
    pub fn remove(&self, name: &str) -> bool {
        match self.inner.write().remove(name) {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn handles(&self) -> Vec<ServerHandle> {
        self.inner.read().values().cloned().collect()
    }

    /// Stops every registered server and clears the table.
    pub fn clear(&self) {
        let drained: Vec<ServerHandle> = {
            let mut map = self.inner.write();
            map.drain().map(|(_, handle)| handle).collect()
        };
        for handle in drained {
            handle.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn struct_definitions_are_looked_up_by_name() {
        let registry = StructRegistry::new();
        registry.register(StructDef {
            name: "Point".into(),
            fields: vec!["x".into(), "y".into()],
        });

        let def = registry.get("Point").unwrap();
        assert_eq!(def.fields, vec!["x".to_string(), "y".to_string()]);
        assert!(registry.get("Missing").is_none());
    }
}
