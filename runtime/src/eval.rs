//! The tree-walking evaluator and the `Runtime` facade around it.
//!
//! Evaluation is async all the way down: receivers block on router calls
//! mid-expression, so recursion goes through boxed futures. Every
//! recursive step passes the current environment explicitly; no call site
//! may resolve identifiers in a different scope than its caller.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::ast::{BinaryOp, Expr, Program, ReceiverDecl, UnaryOp};
use crate::builtins;
use crate::config::RuntimeConfig;
use crate::env::Environment;
use crate::error::{Eval, EvalError, Result, Signal};
use crate::methods::MethodDispatcher;
use crate::registry::{ServerRegistry, StructDef, StructRegistry};
use crate::router::{RemoteTransport, Router};
use crate::server::{ServerHandle, StateHandle};
use crate::value::{FunctionBody, FunctionValue, StructValue, Value};

struct RuntimeInner {
    config: RuntimeConfig,
    structs: StructRegistry,
    servers: ServerRegistry,
    router: Router,
    dispatcher: MethodDispatcher,
    globals: Arc<Environment>,
}

/// Handle to one runtime instance. Cheap to clone; everything lives behind
/// an `Arc`.
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<RuntimeInner>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Runtime {
        Runtime::with_dispatcher(config, MethodDispatcher::with_builtins())
    }

    /// Constructs a runtime with a custom dispatcher. Handler registration
    /// happens before this point; the table is fixed afterwards.
    pub fn with_dispatcher(config: RuntimeConfig, dispatcher: MethodDispatcher) -> Runtime {
        let servers = ServerRegistry::new();
        let router = Router::new(servers.clone(), config.clone());
        let runtime = Runtime {
            inner: Arc::new(RuntimeInner {
                config,
                structs: StructRegistry::new(),
                servers,
                router,
                dispatcher,
                globals: Environment::root(),
            }),
        };
        builtins::install(&runtime);
        runtime
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn structs(&self) -> &StructRegistry {
        &self.inner.structs
    }

    pub fn servers(&self) -> &ServerRegistry {
        &self.inner.servers
    }

    pub fn router(&self) -> &Router {
        &self.inner.router
    }

    pub fn globals(&self) -> &Arc<Environment> {
        &self.inner.globals
    }

    /// Installs the remote delivery seam; called once the peer overlay is
    /// up.
    pub fn set_transport(&self, transport: Arc<dyn RemoteTransport>) {
        self.inner.router.set_transport(transport);
    }

    /// Evaluates a program's top-level expressions in the global scope and
    /// returns the last value. A top-level `return` stops evaluation early.
    pub async fn evaluate(&self, program: &Program) -> Result<Value> {
        let env = self.inner.globals.clone();
        let mut last = Value::Nil;
        for expr in &program.body {
            match self.eval(expr, &env).await {
                Ok(value) => last = value,
                Err(Signal::Return(value)) => return Ok(value),
                Err(Signal::Fail(error)) => return Err(error),
            }
        }
        Ok(last)
    }

    /// Synchronous request/reply to a server, local or remote, through the
    /// router.
    pub async fn call(&self, server: &str, method: &str, args: Vec<Value>) -> Result<Value> {
        self.inner.router.route(server, method, args, true).await
    }

    /// Stops every server and clears the registry.
    pub fn shutdown(&self) {
        self.inner.servers.clear();
    }

    pub async fn dispatch_method(
        &self,
        target: Value,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.inner
            .dispatcher
            .dispatch(self, target, method, args)
            .await
    }

    /// Calls a function value with exactly the given arguments.
    pub(crate) fn call_function<'a>(
        &'a self,
        func: Arc<FunctionValue>,
        args: Vec<Value>,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match &func.body {
                FunctionBody::Native(native) => native(self, args).await,
                FunctionBody::Ast(body) => {
                    if args.len() != func.params.len() {
                        return Err(EvalError::Arity {
                            expected: func.params.len(),
                            got: args.len(),
                        });
                    }
                    // The frame's parent is the closure environment, never
                    // the caller's.
                    let parent = func
                        .env
                        .clone()
                        .unwrap_or_else(|| self.inner.globals.clone());
                    let frame = Environment::child(&parent);
                    for (param, value) in func.params.iter().zip(args) {
                        frame.define(param.clone(), value);
                    }
                    let body = body.clone();
                    match self.eval(&body, &frame).await {
                        Ok(value) => Ok(value),
                        Err(Signal::Return(value)) => Ok(value),
                        Err(Signal::Fail(error)) => Err(error),
                    }
                }
            }
        })
    }

    /// Higher-order call sites offer the full iteration signature and let
    /// the callee's declared arity decide how much of it to take; extra
    /// arguments are dropped rather than failing.
    pub(crate) async fn call_adapted(
        &self,
        func: &Arc<FunctionValue>,
        mut args: Vec<Value>,
    ) -> Result<Value> {
        if matches!(func.body, FunctionBody::Ast(_)) && args.len() > func.params.len() {
            args.truncate(func.params.len());
        }
        self.call_function(func.clone(), args).await
    }

    /// Runs one receiver inside its server's mailbox loop: fresh frame
    /// under the closure environment, `state` bound to the live map,
    /// positional parameters Nil-padded.
    pub(crate) async fn invoke_receiver(
        &self,
        receiver: &Arc<FunctionValue>,
        state: &StateHandle,
        args: Vec<Value>,
    ) -> Result<Value> {
        let FunctionBody::Ast(body) = &receiver.body else {
            return Err(EvalError::TypeMismatch(
                "receiver must be a program-defined function".to_string(),
            ));
        };
        let parent = receiver
            .env
            .clone()
            .unwrap_or_else(|| self.inner.globals.clone());
        let frame = Environment::child(&parent);
        frame.define("state", Value::ServerState(state.clone()));
        let mut supplied = args.into_iter();
        for param in &receiver.params {
            frame.define(param.clone(), supplied.next().unwrap_or(Value::Nil));
        }
        let body = body.clone();
        match self.eval(&body, &frame).await {
            Ok(value) => Ok(value),
            Err(Signal::Return(value)) => Ok(value),
            Err(Signal::Fail(error)) => Err(error),
        }
    }

    fn eval<'a>(&'a self, expr: &'a Expr, env: &'a Arc<Environment>) -> BoxFuture<'a, Eval<Value>> {
        Box::pin(async move {
            match expr {
                Expr::Nil => Ok(Value::Nil),
                Expr::Number { value } => Ok(Value::Number(*value)),
                Expr::Bool { value } => Ok(Value::Bool(*value)),
                Expr::String { value } | Expr::Symbol { value } => {
                    Ok(Value::String(value.clone()))
                }
                Expr::Array { items } => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item, env).await?);
                    }
                    Ok(Value::Array(out))
                }
                Expr::Object { entries } => {
                    let mut map = HashMap::with_capacity(entries.len());
                    for (key, value) in entries {
                        map.insert(key.clone(), self.eval(value, env).await?);
                    }
                    Ok(Value::Object(map))
                }
                Expr::Identifier { name } => Ok(env.get(name)?),
                Expr::Binary { op, left, right } => self.eval_binary(*op, left, right, env).await,
                Expr::Unary { op, operand } => {
                    let value = self.eval(operand, env).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!value.is_truthy())),
                        UnaryOp::Neg => match value {
                            Value::Number(n) => Ok(Value::Number(-n)),
                            other => Err(EvalError::TypeMismatch(format!(
                                "cannot negate a {}",
                                other.type_name()
                            ))
                            .into()),
                        },
                    }
                }
                Expr::Set { name, value } => {
                    let value = self.eval(value, env).await?;
                    if !env.assign(name, value.clone()) {
                        env.define(name.clone(), value.clone());
                    }
                    Ok(value)
                }
                Expr::If {
                    condition,
                    then_branch,
                    else_branch,
                } => {
                    if self.eval(condition, env).await?.is_truthy() {
                        self.eval(then_branch, env).await
                    } else if let Some(alternative) = else_branch {
                        self.eval(alternative, env).await
                    } else {
                        Ok(Value::Nil)
                    }
                }
                Expr::Block { body } => {
                    let mut last = Value::Nil;
                    for expr in body {
                        last = self.eval(expr, env).await?;
                    }
                    Ok(last)
                }
                Expr::Function { name, params, body } => {
                    let func = Arc::new(FunctionValue {
                        name: name.clone(),
                        params: params.clone(),
                        body: FunctionBody::Ast(Arc::new((**body).clone())),
                        env: Some(env.clone()),
                    });
                    let value = Value::Function(func);
                    if let Some(name) = name {
                        env.define(name.clone(), value.clone());
                    }
                    Ok(value)
                }
                Expr::Call { callee, args } => {
                    let callee = self.eval(callee, env).await?;
                    let mut evaluated = Vec::with_capacity(args.len());
                    for a in args {
                        evaluated.push(self.eval(a, env).await?);
                    }
                    let func = match callee {
                        Value::Function(func) => func,
                        other => {
                            return Err(EvalError::TypeMismatch(format!(
                                "cannot call a {}",
                                other.type_name()
                            ))
                            .into());
                        }
                    };
                    Ok(self.call_function(func, evaluated).await?)
                }
                Expr::MethodCall {
                    target,
                    method,
                    args,
                } => {
                    let target = self.eval(target, env).await?;
                    let mut evaluated = Vec::with_capacity(args.len());
                    for a in args {
                        evaluated.push(self.eval(a, env).await?);
                    }
                    Ok(self.dispatch_method(target, method, evaluated).await?)
                }
                Expr::StructDecl { name, fields } => {
                    self.inner.structs.register(StructDef {
                        name: name.clone(),
                        fields: fields.clone(),
                    });
                    Ok(Value::Nil)
                }
                Expr::StructInit { name, fields } => self.eval_struct_init(name, fields, env).await,
                Expr::ServerDecl {
                    name,
                    state,
                    receivers,
                } => self.eval_server_decl(name, state, receivers, env).await,
                Expr::Dispatch {
                    scrutinee,
                    cases,
                    default,
                } => {
                    let value = self.eval(scrutinee, env).await?;
                    for case in cases {
                        let pattern = self.eval(&case.pattern, env).await?;
                        if pattern == value {
                            return self.eval(&case.body, env).await;
                        }
                    }
                    match default {
                        Some(body) => self.eval(body, env).await,
                        None => Ok(Value::Nil),
                    }
                }
                Expr::Return { value } => {
                    let value = match value {
                        Some(expr) => self.eval(expr, env).await?,
                        None => Value::Nil,
                    };
                    Err(Signal::Return(value))
                }
                Expr::Throw { value } => {
                    let value = self.eval(value, env).await?;
                    Err(Signal::Fail(EvalError::Thrown(value.to_string())))
                }
            }
        })
    }

    async fn eval_binary(
        &self,
        op: BinaryOp,
        left: &Expr,
        right: &Expr,
        env: &Arc<Environment>,
    ) -> Eval<Value> {
        match op {
            BinaryOp::And => {
                let value = self.eval(left, env).await?;
                if !value.is_truthy() {
                    return Ok(value);
                }
                self.eval(right, env).await
            }
            BinaryOp::Or => {
                let value = self.eval(left, env).await?;
                if value.is_truthy() {
                    return Ok(value);
                }
                self.eval(right, env).await
            }
            BinaryOp::Coalesce => {
                let value = self.eval(left, env).await?;
                if matches!(value, Value::Nil) {
                    self.eval(right, env).await
                } else {
                    Ok(value)
                }
            }
            _ => {
                let left = self.eval(left, env).await?;
                let right = self.eval(right, env).await?;
                Ok(apply_binary(op, left, right)?)
            }
        }
    }

    async fn eval_struct_init(
        &self,
        name: &str,
        fields: &[(String, Expr)],
        env: &Arc<Environment>,
    ) -> Eval<Value> {
        let def = self
            .inner
            .structs
            .get(name)
            .ok_or_else(|| EvalError::Undefined(format!("struct {name}")))?;

        let mut provided = HashMap::with_capacity(fields.len());
        for (field, expr) in fields {
            if !def.fields.contains(field) {
                return Err(EvalError::TypeMismatch(format!(
                    "struct {name} has no field {field}"
                ))
                .into());
            }
            provided.insert(field.clone(), self.eval(expr, env).await?);
        }
        for field in &def.fields {
            if !provided.contains_key(field) {
                return Err(EvalError::TypeMismatch(format!(
                    "missing field {field} constructing struct {name}"
                ))
                .into());
            }
        }

        Ok(Value::Struct(StructValue {
            type_name: def.name.clone(),
            fields: provided,
        }))
    }

    /// State defaults are evaluated in the declaring environment, which
    /// becomes the server's closure; the mailbox loop starts immediately.
    async fn eval_server_decl(
        &self,
        name: &str,
        state: &[(String, Expr)],
        receivers: &[ReceiverDecl],
        env: &Arc<Environment>,
    ) -> Eval<Value> {
        let mut initial = HashMap::with_capacity(state.len());
        for (field, expr) in state {
            initial.insert(field.clone(), self.eval(expr, env).await?);
        }

        let mut table = HashMap::with_capacity(receivers.len());
        for receiver in receivers {
            table.insert(
                receiver.name.clone(),
                Arc::new(FunctionValue {
                    name: Some(format!("{name}.{}", receiver.name)),
                    params: receiver.params.clone(),
                    body: FunctionBody::Ast(Arc::new(receiver.body.clone())),
                    env: Some(env.clone()),
                }),
            );
        }

        let handle = ServerHandle::spawn(
            self.clone(),
            name.to_string(),
            initial,
            table,
            self.inner.config.mailbox_capacity,
        );
        self.inner.servers.register(handle.clone());
        tracing::info!(server = %name, "server declared and started");
        Ok(Value::Server(handle))
    }
}

fn op_symbol(op: BinaryOp) -> &'static str {
    match op {
        BinaryOp::Add => "+",
        BinaryOp::Sub => "-",
        BinaryOp::Mul => "*",
        BinaryOp::Div => "/",
        BinaryOp::Eq => "==",
        BinaryOp::Ne => "!=",
        BinaryOp::Lt => "<",
        BinaryOp::Le => "<=",
        BinaryOp::Gt => ">",
        BinaryOp::Ge => ">=",
        BinaryOp::And => "&&",
        BinaryOp::Or => "||",
        BinaryOp::Coalesce => "??",
    }
}

fn apply_binary(op: BinaryOp, left: Value, right: Value) -> Result<Value> {
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(left == right)),
        BinaryOp::Ne => return Ok(Value::Bool(left != right)),
        BinaryOp::Add => {
            if let (Value::String(a), Value::String(b)) = (&left, &right) {
                return Ok(Value::String(format!("{a}{b}")));
            }
        }
        _ => {}
    }

    let (a, b) = match (&left, &right) {
        (Value::Number(a), Value::Number(b)) => (*a, *b),
        _ => {
            return Err(EvalError::TypeMismatch(format!(
                "{} is not defined for {} and {}",
                op_symbol(op),
                left.type_name(),
                right.type_name()
            )));
        }
    };

    let value = match op {
        BinaryOp::Add => Value::Number(a + b),
        BinaryOp::Sub => Value::Number(a - b),
        BinaryOp::Mul => Value::Number(a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(EvalError::Arithmetic("division by zero".to_string()));
            }
            Value::Number(a / b)
        }
        BinaryOp::Lt => Value::Bool(a < b),
        BinaryOp::Le => Value::Bool(a <= b),
        BinaryOp::Gt => Value::Bool(a > b),
        BinaryOp::Ge => Value::Bool(a >= b),
        BinaryOp::Eq | BinaryOp::Ne | BinaryOp::And | BinaryOp::Or | BinaryOp::Coalesce => {
            unreachable!("handled before the numeric path")
        }
    };
    Ok(value)
}
