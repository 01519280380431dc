//! Trace：一次 Run 的有序步骤记录

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::ExecutionState;
use crate::react::ToolCall;

/// 一步中执行的动作
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// 调用一个或多个能力
    Invoke { calls: Vec<ToolCall> },
    /// 决策阶段推理后端失败
    BackendFailure { error: String },
    /// 决策无法解析，已注入重试提示
    MalformedDecision { error: String },
    /// Run 在此步被取消
    Cancelled,
}

impl StepAction {
    pub fn summary(&self) -> String {
        match self {
            StepAction::Invoke { calls } => {
                let names: Vec<&str> = calls.iter().map(|c| c.tool.as_str()).collect();
                format!("invoke {}", names.join(", "))
            }
            StepAction::BackendFailure { error } => format!("backend failure: {error}"),
            StepAction::MalformedDecision { error } => format!("malformed decision: {error}"),
            StepAction::Cancelled => "cancelled".to_string(),
        }
    }
}

/// 单个能力调用的观察
#[derive(Clone, Debug, Serialize)]
pub struct Observation {
    pub tool: String,
    pub ok: bool,
    /// 成功时为结果文本，失败时为错误信息
    pub content: String,
    /// 失败类别（invoke_timeout / capability_not_found 等）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct Step {
    /// 从 0 开始连续编号
    pub index: usize,
    /// 进入该步时的执行状态
    pub state_at_entry: ExecutionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
    pub action: StepAction,
    pub observations: Vec<Observation>,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    pub fn new(index: usize, state_at_entry: ExecutionState, action: StepAction) -> Self {
        Self {
            index,
            state_at_entry,
            thought: None,
            action,
            observations: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    /// 是否有失败的观察
    pub fn has_failure(&self) -> bool {
        self.observations.iter().any(|o| !o.ok)
    }
}

/// Run 的最终状态
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Completed,
    NeedsInput,
    Truncated,
    Cancelled,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::NeedsInput => "needs-input",
            RunStatus::Truncated => "truncated",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        }
    }
}
