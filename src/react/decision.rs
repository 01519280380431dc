//! 决策解析：从后端回复中提取能力调用或最终答案
//!
//! 支持三种形态：`{"tool", "args"}` 单调用、`{"actions": [...]}` 并发调用、`{"final_answer"}` 结束。
//! 回复中没有 JSON 时视为直接回答。

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::AgentError;

/// 一次能力调用（`{"tool": "provider.name", "args": {...}}`）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default = "empty_args")]
    pub args: Value,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

/// 后端在一步中的决定
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// 调用一个或多个相互独立的能力
    Invoke {
        thought: Option<String>,
        calls: Vec<ToolCall>,
    },
    Final {
        thought: Option<String>,
        answer: String,
    },
}

/// 提取 JSON 块（```json ... ``` 或首个 `{` 到最后一个 `}`）；没有 JSON 返回 None
fn extract_json(trimmed: &str) -> Option<&str> {
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    match trimmed.rfind('}') {
        Some(end) if end > start => Some(&trimmed[start..=end]),
        _ => Some(&trimmed[start..]),
    }
}

pub fn parse_decision(output: &str) -> Result<Decision, AgentError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(AgentError::JsonParseError("empty reply".to_string()));
    }

    let Some(json_str) = extract_json(trimmed) else {
        return Ok(Decision::Final {
            thought: None,
            answer: trimmed.to_string(),
        });
    };

    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;
    let Some(obj) = value.as_object() else {
        return Err(AgentError::JsonParseError(format!("expected an object: {json_str}")));
    };

    let thought = obj
        .get("thought")
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|t| !t.trim().is_empty());

    if let Some(answer) = obj.get("final_answer") {
        let answer = match answer {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        return Ok(Decision::Final { thought, answer });
    }

    if let Some(actions) = obj.get("actions") {
        let calls: Vec<ToolCall> = serde_json::from_value(actions.clone())
            .map_err(|e| AgentError::JsonParseError(format!("actions: {e}")))?;
        if calls.is_empty() || calls.iter().any(|c| c.tool.trim().is_empty()) {
            return Err(AgentError::JsonParseError(
                "actions must name at least one capability".to_string(),
            ));
        }
        return Ok(Decision::Invoke { thought, calls });
    }

    match obj.get("tool").and_then(Value::as_str).map(str::trim) {
        Some(tool) if !tool.is_empty() => {
            let args = match obj.get("args") {
                None | Some(Value::Null) => empty_args(),
                Some(a) => a.clone(),
            };
            Ok(Decision::Invoke {
                thought,
                calls: vec![ToolCall {
                    tool: tool.to_string(),
                    args,
                }],
            })
        }
        _ => Err(AgentError::JsonParseError(format!(
            "expected \"tool\", \"actions\" or \"final_answer\": {json_str}"
        ))),
    }
}
