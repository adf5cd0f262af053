//! Runtime values and deep equality.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::ast::Expr;
use crate::env::Environment;
use crate::error::Result;
use crate::eval::Runtime;
use crate::server::{ServerHandle, StateHandle};

/// A runtime value. Equality is structural for collections and structs,
/// by value for primitives, and by identity for functions and servers.
#[derive(Clone)]
pub enum Value {
    Nil,
    Number(f64),
    String(String),
    Bool(bool),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
    Struct(StructValue),
    Function(Arc<FunctionValue>),
    Server(ServerHandle),
    /// Indirect handle to a live server's state map, bound as `state`
    /// inside receivers.
    ServerState(StateHandle),
}

/// Discriminant used as the method dispatcher's table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Nil,
    Number,
    String,
    Bool,
    Array,
    Object,
    Struct,
    Function,
    Server,
    ServerState,
}

/// A typed record instance. The field set is fixed by the struct
/// definition it was constructed from.
#[derive(Clone)]
pub struct StructValue {
    pub type_name: String,
    pub fields: HashMap<String, Value>,
}

/// Native built-ins take the runtime handle plus pre-evaluated arguments.
pub type NativeFn = for<'a> fn(&'a Runtime, Vec<Value>) -> BoxFuture<'a, Result<Value>>;

pub enum FunctionBody {
    Ast(Arc<Expr>),
    Native(NativeFn),
}

pub struct FunctionValue {
    pub name: Option<String>,
    pub params: Vec<String>,
    pub body: FunctionBody,
    /// The environment the literal was evaluated in. `None` only for
    /// native built-ins.
    pub env: Option<Arc<Environment>>,
}

impl FunctionValue {
    pub fn native(name: &str, f: NativeFn) -> Arc<FunctionValue> {
        Arc::new(FunctionValue {
            name: Some(name.to_string()),
            params: Vec::new(),
            body: FunctionBody::Native(f),
            env: None,
        })
    }
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::String,
            Value::Bool(_) => ValueKind::Bool,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
            Value::Struct(_) => ValueKind::Struct,
            Value::Function(_) => ValueKind::Function,
            Value::Server(_) => ValueKind::Server,
            Value::ServerState(_) => ValueKind::ServerState,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind() {
            ValueKind::Nil => "nil",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Bool => "bool",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
            ValueKind::Struct => "struct",
            ValueKind::Function => "function",
            ValueKind::Server => "server",
            ValueKind::ServerState => "server state",
        }
    }

    /// Nil and empty values are false; functions and servers are always
    /// true.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Nil => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Struct(_)
            | Value::Function(_)
            | Value::Server(_)
            | Value::ServerState(_) => true,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Struct(a), Value::Struct(b)) => {
                a.type_name == b.type_name && a.fields == b.fields
            }
            (Value::Function(a), Value::Function(b)) => Arc::ptr_eq(a, b),
            (Value::Server(a), Value::Server(b)) => a.same_instance(b),
            (Value::ServerState(a), Value::ServerState(b)) => a.same_map(b),
            _ => false,
        }
    }
}

fn fmt_number(f: &mut fmt::Formatter<'_>, n: f64) -> fmt::Result {
    if n.fract() == 0.0 && n.is_finite() && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{n}")
    }
}

/// Rendering used inside containers: strings are quoted so `["a"]` and
/// `[a]` stay distinguishable in logs.
fn fmt_nested(f: &mut fmt::Formatter<'_>, v: &Value) -> fmt::Result {
    match v {
        Value::String(s) => write!(f, "{s:?}"),
        other => write!(f, "{other}"),
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Number(n) => fmt_number(f, *n),
            Value::String(s) => write!(f, "{s}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    fmt_nested(f, item)?;
                }
                write!(f, "]")
            }
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                write!(f, "{{")?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: ")?;
                    fmt_nested(f, &map[*key])?;
                }
                write!(f, "}}")
            }
            Value::Struct(s) => {
                let mut keys: Vec<&String> = s.fields.keys().collect();
                keys.sort();
                write!(f, "{}{{", s.type_name)?;
                for (i, key) in keys.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{key}: ")?;
                    fmt_nested(f, &s.fields[*key])?;
                }
                write!(f, "}}")
            }
            Value::Function(func) => match &func.name {
                Some(name) => write!(f, "<function:{name}>"),
                None => write!(f, "<function>"),
            },
            Value::Server(handle) => write!(f, "<server:{}>", handle.name()),
            Value::ServerState(_) => write!(f, "<server-state>"),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
