//! JSON-RPC 2.0 编解码
//!
//! 出站只有请求与通知；入站按字段分类为 Response / Request / Notification，兼容批量数组。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::ProtocolError;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 标准错误码：方法不存在
pub const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

pub fn notification(method: &str, params: Option<Value>) -> Value {
    match params {
        Some(p) => json!({ "jsonrpc": JSONRPC_VERSION, "method": method, "params": p }),
        None => json!({ "jsonrpc": JSONRPC_VERSION, "method": method }),
    }
}

/// 对服务端发起的请求作答
pub fn response_to(id: Value, result: Result<Value, RpcError>) -> Value {
    match result {
        Ok(v) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "result": v }),
        Err(e) => json!({ "jsonrpc": JSONRPC_VERSION, "id": id, "error": e }),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<RpcError> for ProtocolError {
    fn from(e: RpcError) -> Self {
        ProtocolError::Rpc {
            code: e.code,
            message: e.message,
        }
    }
}

/// 入站消息
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// 对本端请求的响应（id 为本地生成的关联 id）
    Response {
        id: u64,
        result: Result<Value, RpcError>,
    },
    /// 服务端发起的请求（id 原样回传）
    Request {
        id: Value,
        method: String,
        params: Option<Value>,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

/// 解析一行 / 一帧 / 一个事件的文本；数组按批量处理，无法识别的元素丢弃
pub fn parse_inbound(text: &str) -> Result<Vec<Inbound>, ProtocolError> {
    let value: Value = serde_json::from_str(text.trim())
        .map_err(|e| ProtocolError::Codec(format!("invalid JSON-RPC payload: {e}")))?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    Ok(items.into_iter().filter_map(classify).collect())
}

fn classify(mut value: Value) -> Option<Inbound> {
    let obj = value.as_object_mut()?;
    let id = obj.remove("id");
    let params = obj.remove("params");
    if let Some(method) = obj.get("method").and_then(|m| m.as_str()) {
        let method = method.to_string();
        return Some(match id {
            Some(id) if !id.is_null() => Inbound::Request { id, method, params },
            _ => Inbound::Notification { method, params },
        });
    }
    let id = match id? {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    let result = match obj.remove("error") {
        Some(err) if !err.is_null() => Err(serde_json::from_value(err).unwrap_or(RpcError {
            code: -32603,
            message: "malformed error object".to_string(),
            data: None,
        })),
        _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
    };
    Some(Inbound::Response { id, result })
}
