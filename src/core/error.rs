//! 错误类型与恢复动作
//!
//! 两层错误：ProtocolError（传输 / 会话 / 能力调用）与 AgentError（执行引擎、推理后端、规划）。
//! 与 RecoveryEngine 配合：根据 AgentError 决定 RetryWithPrompt / Reflect / Continue / Abort。

use std::time::Duration;

use thiserror::Error;

/// 能力协议层错误（Provider 配置、连接、调用、路由）
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Provider 配置非法：该 Provider 被跳过，其它照常
    #[error("Config error for provider '{provider}': {reason}")]
    ConfigError { provider: String, reason: String },

    /// 无法连接 / 启动 Provider（按退避重试，之后 Degraded / Closed）
    #[error("Connection error for provider '{provider}': {reason}")]
    ConnectionError { provider: String, reason: String },

    /// 截止时间前未收到响应
    #[error("Invoke timeout: {target} after {}ms", .timeout.as_millis())]
    InvokeTimeout { target: String, timeout: Duration },

    /// Provider 返回的工具级失败（isError=true）
    #[error("Invoke error from {target}: {message}")]
    InvokeError { target: String, message: String },

    /// JSON-RPC 层错误响应
    #[error("JSON-RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("Capability not found: {0}")]
    CapabilityNotFound(String),

    /// 裸名同时匹配多个 Provider，需要使用限定名
    #[error("Capability '{name}' is ambiguous, use one of: {}", .candidates.join(", "))]
    AmbiguousCapability { name: String, candidates: Vec<String> },

    /// 会话不在 Ready（Degraded / Closed / 已断开）
    #[error("Session unavailable: {0}")]
    SessionUnavailable(String),

    #[error("Resource not found: {0}")]
    ResourceNotFound(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Cancelled")]
    Cancelled,
}

impl ProtocolError {
    /// 供 Trace 记录的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolError::ConfigError { .. } => "config_error",
            ProtocolError::ConnectionError { .. } => "connection_error",
            ProtocolError::InvokeTimeout { .. } => "invoke_timeout",
            ProtocolError::InvokeError { .. } | ProtocolError::Rpc { .. } => "invoke_error",
            ProtocolError::CapabilityNotFound(_) | ProtocolError::AmbiguousCapability { .. } => {
                "capability_not_found"
            }
            ProtocolError::SessionUnavailable(_) => "session_unavailable",
            ProtocolError::ResourceNotFound(_) => "resource_not_found",
            ProtocolError::Codec(_) => "codec_error",
            ProtocolError::Cancelled => "cancelled",
        }
    }
}

/// 执行引擎运行过程中可能出现的错误
#[derive(Error, Debug)]
pub enum AgentError {
    #[error("JSON parse error: {0}")]
    JsonParseError(String),

    #[error("Planning error: {0}")]
    PlanningError(String),

    #[error("LLM error: {0}")]
    LlmError(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Invalid run options: {0}")]
    InvalidOptions(String),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::core::ExecutionState,
        to: crate::core::ExecutionState,
    },

    #[error("Config error: {0}")]
    ConfigError(String),

    #[error("Cancelled")]
    Cancelled,
}

impl AgentError {
    /// 供 Trace 记录的错误类别
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::Protocol(e) => e.kind(),
            AgentError::JsonParseError(_) => "json_parse_error",
            AgentError::PlanningError(_) => "planning_error",
            AgentError::LlmError(_) => "llm_error",
            AgentError::InvalidOptions(_) => "invalid_options",
            AgentError::InvalidTransition { .. } => "invalid_transition",
            AgentError::ConfigError(_) => "config_error",
            AgentError::Cancelled => "cancelled",
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 将提示注入下一轮，让 LLM 重试（如 JSON 格式错误）
    RetryWithPrompt(String),
    /// 记录失败并触发一次 Reflector
    Reflect,
    /// 记录为失败观察后继续
    Continue,
    /// 终止当前任务
    Abort,
}
