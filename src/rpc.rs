//! # JSON-RPC 1.0 envelope
//!
//! The wire types the control engine parses and emits: request
//! `{id, method, params}`, reply `{id, result, error}`, notification
//! `{id: null, method, params}`. The "look up a named target, dispatch by
//! path, wrap the result" shape is grounded on
//! `examples/other_examples/a067850b_vt6-vt6.rs__src-server-tokio-dispatch.rs.rs`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Vde3Error;

/// A validated inbound request: `method` is already split into its
/// `<component>.<callable>` halves.
#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: i64,
    pub component: String,
    pub callable: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawRequest {
    id: Value,
    method: String,
    params: Value,
}

impl RpcRequest {
    /// Parse and validate one JSON-RPC 1.0 request object.
    pub fn parse(bytes: &[u8]) -> Result<RpcRequest, Vde3Error> {
        let raw: RawRequest =
            serde_json::from_slice(bytes).map_err(|e| Vde3Error::Protocol(format!("malformed request: {e}")))?;

        let id = raw
            .id
            .as_i64()
            .filter(|id| *id >= 0)
            .ok_or_else(|| Vde3Error::Protocol("request id must be a non-negative integer".into()))?;

        let (component, callable) = raw
            .method
            .split_once('.')
            .ok_or_else(|| Vde3Error::Protocol(format!("method {:?} is missing a '.' separator", raw.method)))?;
        if component.is_empty() || callable.is_empty() {
            return Err(Vde3Error::Protocol(format!("method {:?} has an empty segment", raw.method)));
        }

        let params = match raw.params {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => return Err(Vde3Error::Protocol(format!("params must be an array, got {other}"))),
        };

        Ok(RpcRequest {
            id,
            component: component.to_string(),
            callable: callable.to_string(),
            params,
        })
    }
}

/// A JSON-RPC reply: exactly one of `result`/`error` is non-null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcReply {
    pub id: i64,
    pub result: Value,
    pub error: Value,
}

impl RpcReply {
    pub fn success(id: i64, result: Value) -> RpcReply {
        RpcReply { id, result, error: Value::Null }
    }

    pub fn failure(id: i64, err: &Vde3Error) -> RpcReply {
        RpcReply {
            id,
            result: Value::Null,
            error: serde_json::json!({ "code": err.json_rpc_code(), "message": err.to_string() }),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RpcReply always serializes")
    }
}

/// A server-to-client notification streaming a raised signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcNotification {
    pub id: Option<()>,
    pub method: String,
    pub params: Value,
}

impl RpcNotification {
    pub fn new(full_path: impl Into<String>, params: Value) -> RpcNotification {
        RpcNotification { id: None, method: full_path.into(), params }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("RpcNotification always serializes")
    }
}
