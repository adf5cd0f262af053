//! Per-type method tables backing `target.method(args)`.
//!
//! The dispatcher is the single mechanism for method calls. Handlers get
//! pre-evaluated arguments; higher-order handlers re-enter function
//! execution through the runtime, which is why they return boxed futures.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::{EvalError, Result};
use crate::eval::Runtime;
use crate::value::{FunctionValue, Value, ValueKind};

pub type MethodHandler =
    for<'a> fn(&'a Runtime, Value, Vec<Value>) -> BoxFuture<'a, Result<Value>>;

pub struct MethodDispatcher {
    table: HashMap<ValueKind, HashMap<String, MethodHandler>>,
}

impl MethodDispatcher {
    pub fn empty() -> MethodDispatcher {
        MethodDispatcher {
            table: HashMap::new(),
        }
    }

    pub fn with_builtins() -> MethodDispatcher {
        let mut dispatcher = MethodDispatcher::empty();

        dispatcher.register(ValueKind::Array, "length", array_length);
        dispatcher.register(ValueKind::Array, "get", array_get);
        dispatcher.register(ValueKind::Array, "set", array_set);
        dispatcher.register(ValueKind::Array, "push", array_push);
        dispatcher.register(ValueKind::Array, "pop", array_pop);
        dispatcher.register(ValueKind::Array, "includes", array_includes);
        dispatcher.register(ValueKind::Array, "map", array_map);
        dispatcher.register(ValueKind::Array, "filter", array_filter);
        dispatcher.register(ValueKind::Array, "reduce", array_reduce);

        dispatcher.register(ValueKind::Object, "get", object_get);
        dispatcher.register(ValueKind::Object, "set", object_set);

        dispatcher.register(ValueKind::Struct, "get", struct_get);

        dispatcher.register(ValueKind::String, "length", string_length);

        dispatcher.register(ValueKind::ServerState, "get", state_get);
        dispatcher.register(ValueKind::ServerState, "set", state_set);

        dispatcher
    }

    /// Startup-time registration; the table is immutable once the runtime
    /// is running.
    pub fn register(&mut self, kind: ValueKind, name: impl Into<String>, handler: MethodHandler) {
        self.table
            .entry(kind)
            .or_default()
            .insert(name.into(), handler);
    }

    pub fn dispatch<'a>(
        &self,
        runtime: &'a Runtime,
        target: Value,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value>> {
        let handler = self
            .table
            .get(&target.kind())
            .and_then(|methods| methods.get(method))
            .copied();
        match handler {
            Some(handler) => handler(runtime, target, args),
            None => {
                let error = EvalError::Undefined(format!(
                    "method {method} on {}",
                    target.type_name()
                ));
                Box::pin(async move { Err(error) })
            }
        }
    }
}

fn want_array(target: Value) -> Vec<Value> {
    match target {
        Value::Array(items) => items,
        _ => unreachable!("dispatched on array kind"),
    }
}

fn arg(args: &[Value], i: usize, expected: usize) -> Result<Value> {
    args.get(i).cloned().ok_or(EvalError::Arity {
        expected,
        got: args.len(),
    })
}

fn want_index(value: &Value, len: usize) -> Result<usize> {
    let n = match value {
        Value::Number(n) => *n,
        other => {
            return Err(EvalError::TypeMismatch(format!(
                "index must be a number, got {}",
                other.type_name()
            )));
        }
    };
    if n.fract() != 0.0 || n < 0.0 || (n as usize) >= len {
        return Err(EvalError::Index {
            index: n as i64,
            len,
        });
    }
    Ok(n as usize)
}

fn want_key(value: &Value, method: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(EvalError::TypeMismatch(format!(
            "{method} key must be a string, got {}",
            other.type_name()
        ))),
    }
}

fn want_function(value: Value, method: &str) -> Result<Arc<FunctionValue>> {
    match value {
        Value::Function(f) => Ok(f),
        other => Err(EvalError::TypeMismatch(format!(
            "{method} expects a function, got {}",
            other.type_name()
        ))),
    }
}

fn array_length<'a>(_rt: &'a Runtime, target: Value, _args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move { Ok(Value::Number(want_array(target).len() as f64)) })
}

fn array_get<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let items = want_array(target);
        let index = want_index(&arg(&args, 0, 1)?, items.len())?;
        Ok(items[index].clone())
    })
}

fn array_set<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let mut items = want_array(target);
        let index = want_index(&arg(&args, 0, 2)?, items.len())?;
        items[index] = arg(&args, 1, 2)?;
        Ok(Value::Array(items))
    })
}

fn array_push<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let mut items = want_array(target);
        items.push(arg(&args, 0, 1)?);
        Ok(Value::Array(items))
    })
}

fn array_pop<'a>(_rt: &'a Runtime, target: Value, _args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let mut items = want_array(target);
        if items.pop().is_none() {
            return Err(EvalError::Index { index: 0, len: 0 });
        }
        Ok(Value::Array(items))
    })
}

fn array_includes<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let items = want_array(target);
        let needle = arg(&args, 0, 1)?;
        Ok(Value::Bool(items.iter().any(|item| *item == needle)))
    })
}

fn array_map<'a>(rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let items = want_array(target);
        let func = want_function(arg(&args, 0, 1)?, "map")?;
        let mut out = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            out.push(
                rt.call_adapted(&func, vec![item, Value::Number(i as f64)])
                    .await?,
            );
        }
        Ok(Value::Array(out))
    })
}

fn array_filter<'a>(rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let items = want_array(target);
        let func = want_function(arg(&args, 0, 1)?, "filter")?;
        let mut out = Vec::new();
        for (i, item) in items.into_iter().enumerate() {
            let keep = rt
                .call_adapted(&func, vec![item.clone(), Value::Number(i as f64)])
                .await?;
            if keep.is_truthy() {
                out.push(item);
            }
        }
        Ok(Value::Array(out))
    })
}

fn array_reduce<'a>(rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let items = want_array(target);
        let func = want_function(arg(&args, 0, 1)?, "reduce")?;

        let mut iter = items.into_iter();
        let mut acc = match args.get(1).cloned() {
            Some(init) => init,
            None => iter.next().ok_or_else(|| {
                EvalError::TypeMismatch(
                    "reduce of an empty array needs an initial value".to_string(),
                )
            })?,
        };
        for item in iter {
            acc = rt.call_adapted(&func, vec![acc, item]).await?;
        }
        Ok(acc)
    })
}

fn object_get<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let Value::Object(map) = target else {
            unreachable!("dispatched on object kind")
        };
        let key = want_key(&arg(&args, 0, 1)?, "get")?;
        Ok(map.get(&key).cloned().unwrap_or(Value::Nil))
    })
}

fn object_set<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let Value::Object(mut map) = target else {
            unreachable!("dispatched on object kind")
        };
        let key = want_key(&arg(&args, 0, 2)?, "set")?;
        map.insert(key, arg(&args, 1, 2)?);
        Ok(Value::Object(map))
    })
}

fn struct_get<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let Value::Struct(s) = target else {
            unreachable!("dispatched on struct kind")
        };
        let field = want_key(&arg(&args, 0, 1)?, "get")?;
        s.fields.get(&field).cloned().ok_or_else(|| {
            EvalError::Undefined(format!("field {field} on struct {}", s.type_name))
        })
    })
}

fn string_length<'a>(_rt: &'a Runtime, target: Value, _args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let Value::String(s) = target else {
            unreachable!("dispatched on string kind")
        };
        // Code points, not bytes.
        Ok(Value::Number(s.chars().count() as f64))
    })
}

fn state_get<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let Value::ServerState(state) = target else {
            unreachable!("dispatched on server-state kind")
        };
        let key = want_key(&arg(&args, 0, 1)?, "get")?;
        Ok(state.get(&key))
    })
}

fn state_set<'a>(_rt: &'a Runtime, target: Value, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let Value::ServerState(state) = target else {
            unreachable!("dispatched on server-state kind")
        };
        let key = want_key(&arg(&args, 0, 2)?, "set")?;
        let value = arg(&args, 1, 2)?;
        state.set(key, value.clone());
        Ok(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    fn nums(ns: &[f64]) -> Value {
        Value::Array(ns.iter().map(|n| Value::Number(*n)).collect())
    }

    async fn call(rt: &Runtime, target: Value, method: &str, args: Vec<Value>) -> Result<Value> {
        rt.dispatch_method(target, method, args).await
    }

    #[tokio::test]
    async fn array_set_is_persistent() {
        let rt = Runtime::new(RuntimeConfig::default());
        let original = nums(&[1.0, 2.0, 3.0]);

        let updated = call(
            &rt,
            original.clone(),
            "set",
            vec![Value::Number(1.0), Value::Number(9.0)],
        )
        .await
        .unwrap();

        assert_eq!(updated, nums(&[1.0, 9.0, 3.0]));
        assert_eq!(original, nums(&[1.0, 2.0, 3.0]));
    }

    #[tokio::test]
    async fn array_get_out_of_range_is_an_index_error() {
        let rt = Runtime::new(RuntimeConfig::default());
        let error = call(&rt, nums(&[1.0]), "get", vec![Value::Number(4.0)])
            .await
            .unwrap_err();
        assert!(matches!(error, EvalError::Index { index: 4, len: 1 }));
    }

    #[tokio::test]
    async fn array_pop_on_empty_fails() {
        let rt = Runtime::new(RuntimeConfig::default());
        assert!(call(&rt, nums(&[]), "pop", vec![]).await.is_err());
        assert_eq!(
            call(&rt, nums(&[1.0, 2.0]), "pop", vec![]).await.unwrap(),
            nums(&[1.0])
        );
    }

    #[tokio::test]
    async fn includes_uses_deep_equality() {
        let rt = Runtime::new(RuntimeConfig::default());
        let haystack = Value::Array(vec![nums(&[1.0, 2.0]), nums(&[3.0])]);
        let found = call(&rt, haystack.clone(), "includes", vec![nums(&[3.0])])
            .await
            .unwrap();
        assert_eq!(found, Value::Bool(true));
        let missing = call(&rt, haystack, "includes", vec![nums(&[4.0])])
            .await
            .unwrap();
        assert_eq!(missing, Value::Bool(false));
    }

    #[tokio::test]
    async fn object_set_is_persistent_and_get_defaults_to_nil() {
        let rt = Runtime::new(RuntimeConfig::default());
        let empty = Value::Object(HashMap::new());

        let updated = call(
            &rt,
            empty.clone(),
            "set",
            vec![Value::String("k".into()), Value::Number(1.0)],
        )
        .await
        .unwrap();

        assert_eq!(
            call(&rt, updated, "get", vec![Value::String("k".into())])
                .await
                .unwrap(),
            Value::Number(1.0)
        );
        assert_eq!(
            call(&rt, empty, "get", vec![Value::String("k".into())])
                .await
                .unwrap(),
            Value::Nil
        );
    }

    #[tokio::test]
    async fn string_length_counts_code_points() {
        let rt = Runtime::new(RuntimeConfig::default());
        let len = call(&rt, Value::String("héllo".into()), "length", vec![])
            .await
            .unwrap();
        assert_eq!(len, Value::Number(5.0));
    }

    #[tokio::test]
    async fn unknown_method_is_undefined() {
        let rt = Runtime::new(RuntimeConfig::default());
        let error = call(&rt, nums(&[]), "frobnicate", vec![]).await.unwrap_err();
        assert!(matches!(error, EvalError::Undefined(_)));
    }
}
