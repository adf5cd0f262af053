//! Native functions available in every program's global scope.
//!
//! `message` and `send` are thin wrappers over the router, so programs
//! cannot tell local targets from remote ones.

use futures::future::BoxFuture;

use crate::error::{EvalError, Result};
use crate::eval::Runtime;
use crate::value::{FunctionValue, Value};

pub(crate) fn install(runtime: &Runtime) {
    let globals = runtime.globals();
    globals.define(
        "print",
        Value::Function(FunctionValue::native("print", native_print)),
    );
    globals.define(
        "len",
        Value::Function(FunctionValue::native("len", native_len)),
    );
    globals.define(
        "message",
        Value::Function(FunctionValue::native("message", native_message)),
    );
    globals.define(
        "send",
        Value::Function(FunctionValue::native("send", native_send)),
    );
}

fn native_print<'a>(_rt: &'a Runtime, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        let rendered: Vec<String> = args.iter().map(|value| value.to_string()).collect();
        tracing::info!(target: "relay_program", "{}", rendered.join(" "));
        Ok(Value::Nil)
    })
}

fn native_len<'a>(_rt: &'a Runtime, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(async move {
        if args.len() != 1 {
            return Err(EvalError::Arity {
                expected: 1,
                got: args.len(),
            });
        }
        match &args[0] {
            Value::Array(items) => Ok(Value::Number(items.len() as f64)),
            Value::String(s) => Ok(Value::Number(s.chars().count() as f64)),
            Value::Object(map) => Ok(Value::Number(map.len() as f64)),
            other => Err(EvalError::TypeMismatch(format!(
                "len is not defined for {}",
                other.type_name()
            ))),
        }
    })
}

fn native_message<'a>(rt: &'a Runtime, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(route_builtin(rt, args, true))
}

fn native_send<'a>(rt: &'a Runtime, args: Vec<Value>) -> BoxFuture<'a, Result<Value>> {
    Box::pin(route_builtin(rt, args, false))
}

async fn route_builtin(rt: &Runtime, mut args: Vec<Value>, wait_for_reply: bool) -> Result<Value> {
    if args.len() < 2 {
        return Err(EvalError::Arity {
            expected: 2,
            got: args.len(),
        });
    }
    let rest = args.split_off(2);
    let method = match args.pop() {
        Some(Value::String(s)) => s,
        other => {
            return Err(EvalError::TypeMismatch(format!(
                "method name must be a string, got {}",
                other.map(|v| v.type_name()).unwrap_or("nothing")
            )));
        }
    };
    let target = match args.pop() {
        Some(Value::String(s)) => s,
        Some(Value::Server(handle)) => handle.name().to_string(),
        other => {
            return Err(EvalError::TypeMismatch(format!(
                "message target must be a server or a name, got {}",
                other.map(|v| v.type_name()).unwrap_or("nothing")
            )));
        }
    };

    rt.router().route(&target, &method, rest, wait_for_reply).await
}
