//! 错误恢复引擎
//!
//! 根据 AgentError 类型返回 RecoveryAction，供执行引擎决定是重试、反思、继续还是终止。

use crate::core::{AgentError, ProtocolError, RecoveryAction};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 反思 / 继续 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        match err {
            AgentError::JsonParseError(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous output was not valid JSON: {raw}. \
                To call a capability output exactly one JSON object: \
                {{\"thought\": \"...\", \"tool\": \"name\", \"args\": {{...}}}}. \
                To finish output {{\"final_answer\": \"...\"}}. Output nothing else."
            )),
            AgentError::Protocol(ProtocolError::AmbiguousCapability { name, candidates }) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Capability '{name}' exists on several providers. Use a qualified name: {}.",
                    candidates.join(", ")
                ))
            }
            AgentError::Protocol(ProtocolError::CapabilityNotFound(name)) => {
                RecoveryAction::RetryWithPrompt(format!(
                    "Capability '{name}' does not exist. Only use capabilities from the list."
                ))
            }
            AgentError::Protocol(ProtocolError::InvokeTimeout { .. })
            | AgentError::Protocol(ProtocolError::InvokeError { .. })
            | AgentError::Protocol(ProtocolError::Rpc { .. }) => RecoveryAction::Reflect,
            AgentError::Protocol(ProtocolError::Cancelled) => RecoveryAction::Abort,
            AgentError::Protocol(_) | AgentError::LlmError(_) | AgentError::PlanningError(_) => {
                RecoveryAction::Continue
            }
            AgentError::Cancelled
            | AgentError::InvalidOptions(_)
            | AgentError::InvalidTransition { .. }
            | AgentError::ConfigError(_) => RecoveryAction::Abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_recovery_json_parse_error() {
        let engine = RecoveryEngine::new();
        let err = AgentError::JsonParseError("invalid json".to_string());
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => assert!(msg.contains("JSON")),
            _ => panic!("Expected RetryWithPrompt"),
        }
    }

    #[test]
    fn test_recovery_ambiguous_lists_candidates() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Protocol(ProtocolError::AmbiguousCapability {
            name: "search".to_string(),
            candidates: vec!["a.search".to_string(), "b.search".to_string()],
        });
        match engine.handle(&err) {
            RecoveryAction::RetryWithPrompt(msg) => {
                assert!(msg.contains("a.search") && msg.contains("b.search"))
            }
            _ => panic!("Expected RetryWithPrompt"),
        }
    }

    #[test]
    fn test_recovery_invoke_timeout_reflects() {
        let engine = RecoveryEngine::new();
        let err = AgentError::Protocol(ProtocolError::InvokeTimeout {
            target: "docs.search".to_string(),
            timeout: Duration::from_secs(30),
        });
        assert!(matches!(engine.handle(&err), RecoveryAction::Reflect));
    }

    #[test]
    fn test_recovery_llm_error_continues() {
        let engine = RecoveryEngine::new();
        let err = AgentError::LlmError("connection refused".to_string());
        assert!(matches!(engine.handle(&err), RecoveryAction::Continue));
    }

    #[test]
    fn test_recovery_cancelled() {
        let engine = RecoveryEngine::new();
        assert!(matches!(engine.handle(&AgentError::Cancelled), RecoveryAction::Abort));
    }
}
