//! JSON-RPC 2.0 request handling for the gateway.
//!
//! `"server.method"` invokes through the router; `"remote_call"` targets an
//! explicit node through the peer overlay. Both positional and named
//! parameter forms are accepted; named parameters are mapped to positional
//! using the receiver's declared order.

use runtime::error::EvalError;
use runtime::eval::Runtime;
use serde::{Deserialize, Serialize};

use crate::convert::{json_args_to_values, named_to_positional, value_to_json};
use crate::overlay::Overlay;

pub const JSONRPC_VERSION: &str = "2.0";

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> JsonRpcError {
        JsonRpcError {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> JsonRpcError {
        self.data = Some(data);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    pub id: serde_json::Value,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn failure(id: serde_json::Value, error: JsonRpcError) -> JsonRpcResponse {
        JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            result: None,
            error: Some(error),
            id,
        }
    }
}

/// Parameters of the `remote_call` method.
#[derive(Debug, Deserialize)]
pub struct RemoteCallParams {
    pub node_id: String,
    pub server_name: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    /// Reply deadline override, seconds.
    #[serde(default, rename = "timeout")]
    pub timeout_secs: Option<u64>,
}

/// Maps a runtime failure onto the JSON-RPC error space. The failure tag
/// travels in `data` so clients can branch on it machine-readably.
fn eval_error_to_rpc(error: EvalError) -> JsonRpcError {
    let code = match &error {
        EvalError::UnknownTarget(_) => METHOD_NOT_FOUND,
        _ => INTERNAL_ERROR,
    };
    JsonRpcError::new(code, error.to_string()).with_data(serde_json::json!(error.tag()))
}

pub async fn handle_rpc_body(runtime: &Runtime, overlay: &Overlay, body: &[u8]) -> JsonRpcResponse {
    let parsed: serde_json::Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(e) => {
            return JsonRpcResponse::failure(
                serde_json::Value::Null,
                JsonRpcError::new(PARSE_ERROR, format!("parse error: {e}")),
            );
        }
    };

    let id = parsed.get("id").cloned().unwrap_or(serde_json::Value::Null);

    let Some(object) = parsed.as_object() else {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(INVALID_REQUEST, "request must be an object"),
        );
    };
    if object.get("jsonrpc").and_then(|v| v.as_str()) != Some(JSONRPC_VERSION) {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(INVALID_REQUEST, "jsonrpc must be \"2.0\""),
        );
    }
    let Some(method) = object.get("method").and_then(|v| v.as_str()) else {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(INVALID_REQUEST, "method must be a string"),
        );
    };
    let params = object
        .get("params")
        .cloned()
        .unwrap_or(serde_json::Value::Null);

    if method == "remote_call" {
        return handle_remote_call(runtime, overlay, id, params).await;
    }

    let Some((server, server_method)) = method.split_once('.') else {
        return JsonRpcResponse::failure(
            id,
            JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("method {method} is not of the form server.method"),
            ),
        );
    };

    let args = match positional_args(runtime, server, server_method, &params) {
        Ok(args) => args,
        Err(response_error) => return JsonRpcResponse::failure(id, response_error),
    };

    let values = match json_args_to_values(&args, runtime.structs()) {
        Ok(values) => values,
        Err(e) => {
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_PARAMS, e.to_string()),
            );
        }
    };

    match runtime.router().route(server, server_method, values, true).await {
        Ok(value) => JsonRpcResponse::success(id, value_to_json(&value)),
        Err(error) => JsonRpcResponse::failure(id, eval_error_to_rpc(error)),
    }
}

/// Resolves the positional argument list from either parameter form.
fn positional_args(
    runtime: &Runtime,
    server: &str,
    method: &str,
    params: &serde_json::Value,
) -> Result<Vec<serde_json::Value>, JsonRpcError> {
    // Known-local servers are validated here so an unknown method is a
    // -32601 instead of a nil reply from the actor loop.
    let local = runtime.servers().get(server);
    if let Some(handle) = &local {
        if !handle.has_method(method) {
            return Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("server {server} has no method {method}"),
            ));
        }
    }

    match params {
        serde_json::Value::Null => Ok(Vec::new()),
        serde_json::Value::Array(args) => Ok(args.clone()),
        serde_json::Value::Object(named) => {
            let Some(handle) = &local else {
                return Err(JsonRpcError::new(
                    INVALID_PARAMS,
                    "named parameters require a locally registered receiver",
                ));
            };
            let order = handle
                .methods()
                .into_iter()
                .find(|m| m.name == method)
                .map(|m| m.params)
                .unwrap_or_default();
            Ok(named_to_positional(&order, named))
        }
        _ => Err(JsonRpcError::new(
            INVALID_PARAMS,
            "params must be an array or an object",
        )),
    }
}

async fn handle_remote_call(
    runtime: &Runtime,
    overlay: &Overlay,
    id: serde_json::Value,
    params: serde_json::Value,
) -> JsonRpcResponse {
    let call: RemoteCallParams = match serde_json::from_value(params) {
        Ok(call) => call,
        Err(e) => {
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_PARAMS, format!("invalid remote_call params: {e}")),
            );
        }
    };

    let values = match json_args_to_values(&call.args, runtime.structs()) {
        Ok(values) => values,
        Err(e) => {
            return JsonRpcResponse::failure(
                id,
                JsonRpcError::new(INVALID_PARAMS, e.to_string()),
            );
        }
    };

    let timeout = call
        .timeout_secs
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| runtime.config().message_timeout());

    match overlay
        .call_node(
            &call.node_id,
            &call.server_name,
            &call.method,
            values,
            true,
            timeout,
        )
        .await
    {
        Ok(value) => JsonRpcResponse::success(id, value_to_json(&value)),
        Err(error) => JsonRpcResponse::failure(id, eval_error_to_rpc(error)),
    }
}
