//! 执行过程事件：供 CLI / 上层订阅展示状态、计划、调用与观察

use serde::Serialize;

use crate::core::ExecutionState;
use crate::react::{RunStatus, Subtask};

/// 单个过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    StateChanged {
        from: ExecutionState,
        to: ExecutionState,
    },
    /// 规划或反思后的当前计划
    Plan { subtasks: Vec<Subtask> },
    /// 第几步开始请求决策
    Thinking { step: usize, max_steps: usize },
    /// 决策附带的思考内容
    ThinkingContent { text: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 调用结果（预览）
    Observation {
        tool: String,
        ok: bool,
        preview: String,
    },
    /// 恢复动作（RetryWithPrompt / Reflect / Continue）
    Recovery { action: String, detail: String },
    Reflection { assessment: String },
    Final { status: RunStatus, answer: String },
}
