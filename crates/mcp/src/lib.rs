#![forbid(unsafe_code)]

//! The method surface: the set of named operations an LLM agent may invoke to
//! read and mutate orchestrator state during a cycle.
//!
//! One dispatch, two transports with identical semantics: a line-delimited
//! JSON-RPC stream (the `cd_mcp` binary, for piping to a child process) and
//! the same line protocol over a local TCP socket hosted by the cycle engine.

mod grant;
mod methods;
mod serve;

pub use grant::AgentGrant;
pub use serve::{SurfaceServer, serve_lines};

use cd_core::select::SelectionPolicy;
use cd_storage::SqliteStore;
use serde::Deserialize;
use serde_json::{Value, json};
use std::path::PathBuf;

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "cadence-mcp";
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;
pub const RESOURCE_NOT_FOUND: i64 = -32001;
pub const FORBIDDEN: i64 = -32002;

/// Every method the surface dispatches, advertised by `initialize`.
pub const METHOD_NAMES: &[&str] = &[
    "tasks.get_next",
    "tasks.get",
    "tasks.update_state",
    "tasks.inspect_transition",
    "tasks.append_note",
    "tasks.list",
    "artifacts.upsert",
    "artifacts.get",
    "artifacts.list",
    "requirements.list",
    "plan.read",
];

#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    #[serde(rename = "jsonrpc")]
    _jsonrpc: Option<String>,
    pub method: String,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub params: Option<Value>,
}

pub fn json_rpc_response(id: Option<Value>, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

pub fn json_rpc_error(id: Option<Value>, code: i64, message: &str) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message } })
}

pub fn json_rpc_error_with_data(id: Option<Value>, code: i64, message: &str, data: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "error": { "code": code, "message": message, "data": data } })
}

/// One bound method surface: a store connection, the acting agent's grant,
/// the selection policy, and the cycle deadline it enforces cooperatively.
pub struct MethodSurface {
    store: SqliteStore,
    grant: AgentGrant,
    policy: SelectionPolicy,
    plan_file: Option<PathBuf>,
    deadline_ms: Option<i64>,
    initialized: bool,
}

impl MethodSurface {
    pub fn new(
        store: SqliteStore,
        grant: AgentGrant,
        policy: SelectionPolicy,
        plan_file: Option<PathBuf>,
        deadline_ms: Option<i64>,
    ) -> Self {
        Self {
            store,
            grant,
            policy,
            plan_file,
            deadline_ms,
            initialized: false,
        }
    }

    /// Parses one wire line and dispatches it. `None` means "send nothing"
    /// (notifications). Shared by both transports so their semantics cannot
    /// drift.
    pub fn handle_line(&mut self, raw: &str) -> Option<Value> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }

        let data: Value = match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => {
                return Some(json_rpc_error(None, PARSE_ERROR, &format!("Parse error: {e}")));
            }
        };
        let (id, has_method) = match data.as_object() {
            Some(obj) => (obj.get("id").cloned(), obj.contains_key("method")),
            None => return Some(json_rpc_error(None, INVALID_REQUEST, "Invalid Request")),
        };
        if !has_method {
            return Some(json_rpc_error(id, INVALID_REQUEST, "Invalid Request"));
        }

        let request: JsonRpcRequest = match serde_json::from_value(data) {
            Ok(v) => v,
            Err(e) => {
                return Some(json_rpc_error(
                    id,
                    INVALID_REQUEST,
                    &format!("Invalid Request: {e}"),
                ));
            }
        };

        self.handle_request(request)
    }

    pub fn handle_request(&mut self, request: JsonRpcRequest) -> Option<Value> {
        let method = request.method.as_str();
        let is_notification = request.id.is_none();

        if method == "initialize" {
            self.initialized = true;
            return Some(json_rpc_response(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
                    "capabilities": { "methods": METHOD_NAMES },
                    "agent": { "role": self.grant.role }
                }),
            ));
        }

        if !self.initialized {
            return Some(json_rpc_error(
                request.id,
                FORBIDDEN,
                "Surface not initialized: call initialize first",
            ));
        }

        if method == "ping" {
            return Some(json_rpc_response(request.id, json!({})));
        }

        let params = request.params.unwrap_or_else(|| json!({}));
        let response = match self.dispatch(method, &params) {
            Ok(result) => json_rpc_response(request.id, result),
            Err(err) => match err.data {
                Some(data) => json_rpc_error_with_data(request.id, err.code, &err.message, data),
                None => json_rpc_error(request.id, err.code, &err.message),
            },
        };

        if is_notification {
            return None;
        }
        Some(response)
    }
}

/// Structured method failure; `data` carries the machine-readable tag the
/// agent branches on (e.g. `{"kind":"missing_handover", ...}`).
#[derive(Debug)]
pub(crate) struct MethodError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl MethodError {
    pub(crate) fn invalid_params(message: impl Into<String>) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: None,
        }
    }

    pub(crate) fn invalid_params_with(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: INVALID_PARAMS,
            message: message.into(),
            data: Some(data),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: RESOURCE_NOT_FOUND,
            message: message.into(),
            data: Some(data),
        }
    }

    pub(crate) fn forbidden(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: FORBIDDEN,
            message: message.into(),
            data: Some(data),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self {
            code: INTERNAL_ERROR,
            message: message.into(),
            data: None,
        }
    }
}
