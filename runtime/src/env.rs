//! Lexically scoped environments.
//!
//! Frames are `Arc`-shared: closures capture the frame they were defined in
//! and may outlive the call that created it, including across server tasks.
//! Reads are concurrent-safe by construction; programs do not mutate one
//! frame from several tasks at once.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{EvalError, Result};
use crate::value::Value;

pub struct Environment {
    bindings: RwLock<HashMap<String, Value>>,
    parent: Option<Arc<Environment>>,
}

impl Environment {
    pub fn root() -> Arc<Environment> {
        Arc::new(Environment {
            bindings: RwLock::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Arc<Environment>) -> Arc<Environment> {
        Arc::new(Environment {
            bindings: RwLock::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    /// Inserts into this frame, shadowing any binding in a parent.
    pub fn define(&self, name: impl Into<String>, value: Value) {
        self.bindings.write().insert(name.into(), value);
    }

    /// Walks the parent chain.
    pub fn get(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.bindings.read().get(name) {
            return Ok(value.clone());
        }
        match &self.parent {
            Some(parent) => parent.get(name),
            None => Err(EvalError::Undefined(name.to_string())),
        }
    }

    /// Updates the nearest existing binding. Returns false when the name is
    /// bound nowhere in the chain.
    pub fn assign(&self, name: &str, value: Value) -> bool {
        {
            let mut bindings = self.bindings.write();
            if bindings.contains_key(name) {
                bindings.insert(name.to_string(), value);
                return true;
            }
        }
        match &self.parent {
            Some(parent) => parent.assign(name, value),
            None => false,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
            || self.parent.as_ref().is_some_and(|p| p.contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_walks_the_parent_chain() {
        let root = Environment::root();
        root.define("x", Value::Number(1.0));
        let child = Environment::child(&root);
        let grandchild = Environment::child(&child);

        assert_eq!(grandchild.get("x").unwrap(), Value::Number(1.0));
        assert!(matches!(
            grandchild.get("missing"),
            Err(EvalError::Undefined(_))
        ));
    }

    #[test]
    fn define_shadows_without_touching_parent() {
        let root = Environment::root();
        root.define("x", Value::Number(1.0));
        let child = Environment::child(&root);
        child.define("x", Value::Number(2.0));

        assert_eq!(child.get("x").unwrap(), Value::Number(2.0));
        assert_eq!(root.get("x").unwrap(), Value::Number(1.0));
    }

    #[test]
    fn assign_updates_the_nearest_binding() {
        let root = Environment::root();
        root.define("x", Value::Number(1.0));
        let child = Environment::child(&root);

        assert!(child.assign("x", Value::Number(5.0)));
        assert_eq!(root.get("x").unwrap(), Value::Number(5.0));
        assert!(!child.contains("x"));

        assert!(!child.assign("missing", Value::Nil));
    }
}
