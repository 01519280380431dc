//! 能力执行器
//!
//! 持有 CapabilityRegistry 与默认超时，每次调用输出结构化审计日志（JSON），
//! 结果统一为文本，失败映射为 AgentError。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, ProtocolError};
use crate::tools::CapabilityRegistry;

pub struct ToolExecutor {
    registry: Arc<CapabilityRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<CapabilityRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    /// 调用能力；取消返回 AgentError::Cancelled，其余失败包装为 AgentError::Protocol
    pub async fn execute(
        &self,
        tool_name: &str,
        args: Value,
        cancel: &CancellationToken,
    ) -> Result<String, AgentError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = self
            .registry
            .invoke(tool_name, args, self.timeout, cancel)
            .await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(_) => (true, "ok"),
            Err(ProtocolError::InvokeTimeout { .. }) => (false, "timeout"),
            Err(ProtocolError::Cancelled) => (false, "cancelled"),
            Err(e) => (false, e.kind()),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Value::String(text)) => Ok(text),
            Ok(other) => Ok(other.to_string()),
            Err(ProtocolError::Cancelled) => Err(AgentError::Cancelled),
            Err(e) => Err(AgentError::Protocol(e)),
        }
    }
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
