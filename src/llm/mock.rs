//! Mock / Scripted 推理后端（用于测试与无 Key 本地运行）
//!
//! 通过 system 消息开头的角色句区分调用类别（规划 / 决策 / 反思 / 汇总）。

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::LlmClient;
use crate::memory::{Message, Role};
use crate::react::prompts::{PLANNER_ROLE, REFLECTOR_ROLE, SYNTHESIS_ROLE};

/// 推理调用类别
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallKind {
    Plan,
    Decide,
    Reflect,
    Synthesize,
}

impl CallKind {
    pub fn detect(messages: &[Message]) -> Self {
        let system = messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .unwrap_or("");
        if system.starts_with(PLANNER_ROLE) {
            CallKind::Plan
        } else if system.starts_with(REFLECTOR_ROLE) {
            CallKind::Reflect
        } else if system.starts_with(SYNTHESIS_ROLE) {
            CallKind::Synthesize
        } else {
            CallKind::Decide
        }
    }
}

fn last_user(messages: &[Message]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .unwrap_or("(no input)")
}

/// Mock 客户端：规划一个子任务，用 builtin.echo 回显任务，再以观察作答
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let reply = match CallKind::detect(messages) {
            CallKind::Plan => {
                let task = last_user(messages);
                json!({
                    "task_analysis": "single step",
                    "subtasks": [{
                        "id": "1",
                        "description": task,
                        "capability_hints": ["builtin.echo"],
                        "priority": 3
                    }],
                    "execution_order": ["1"]
                })
                .to_string()
            }
            CallKind::Decide => {
                if messages.iter().any(|m| m.role == Role::Assistant) {
                    json!({
                        "thought": "the observation answers the task",
                        "final_answer": format!("Echo from Mock: {}", last_user(messages))
                    })
                    .to_string()
                } else {
                    json!({
                        "thought": "echo the task back",
                        "tool": "builtin.echo",
                        "args": { "text": last_user(messages) }
                    })
                    .to_string()
                }
            }
            CallKind::Reflect => json!({
                "assessment": "on track",
                "can_proceed": true,
                "needs_user_input": false
            })
            .to_string(),
            CallKind::Synthesize => format!("Partial answer from Mock: {}", last_user(messages)),
        };
        Ok(reply)
    }
}

const DEFAULT_PLAN: &str = r#"{"task_analysis":"default","subtasks":[{"id":"1","description":"complete the task","capability_hints":[],"priority":3}],"execution_order":["1"]}"#;
const DEFAULT_DECISION: &str = r#"{"final_answer":"done"}"#;
const DEFAULT_REFLECTION: &str = r#"{"assessment":"on track","failed_steps":[],"revised_subtasks":null,"needs_user_input":false,"question":null,"can_proceed":true}"#;
const DEFAULT_SYNTHESIS: &str = "summary";

/// 按调用类别排队回复的后端；队列为空时返回默认回复
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    queues: Mutex<HashMap<CallKind, VecDeque<Result<String, String>>>>,
    calls: Mutex<Vec<(CallKind, Vec<Message>)>>,
    delay: Option<Duration>,
}

impl ScriptedLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, kind: CallKind, reply: Result<String, String>) -> Self {
        self.queues
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .entry(kind)
            .or_default()
            .push_back(reply);
        self
    }

    pub fn plan(self, reply: impl Into<String>) -> Self {
        self.push(CallKind::Plan, Ok(reply.into()))
    }

    pub fn decide(self, reply: impl Into<String>) -> Self {
        self.push(CallKind::Decide, Ok(reply.into()))
    }

    pub fn reflect(self, reply: impl Into<String>) -> Self {
        self.push(CallKind::Reflect, Ok(reply.into()))
    }

    pub fn synthesize(self, reply: impl Into<String>) -> Self {
        self.push(CallKind::Synthesize, Ok(reply.into()))
    }

    /// 下一次该类别调用返回后端错误
    pub fn fail(self, kind: CallKind, error: impl Into<String>) -> Self {
        self.push(kind, Err(error.into()))
    }

    /// 每次调用前等待
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// 某类别已发生的调用次数
    pub fn calls(&self, kind: CallKind) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    /// 某类别第 n 次调用收到的消息
    pub fn messages_of(&self, kind: CallKind, n: usize) -> Option<Vec<Message>> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|(k, _)| *k == kind)
            .nth(n)
            .map(|(_, m)| m.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, String> {
        let kind = CallKind::detect(messages);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((kind, messages.to_vec()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let next = self
            .queues
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(&kind)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| {
            Ok(match kind {
                CallKind::Plan => DEFAULT_PLAN,
                CallKind::Decide => DEFAULT_DECISION,
                CallKind::Reflect => DEFAULT_REFLECTION,
                CallKind::Synthesize => DEFAULT_SYNTHESIS,
            }
            .to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn system(role: &str) -> Message {
        Message::system(format!("{role}\nmore instructions"))
    }

    #[test]
    fn test_detect_call_kind() {
        assert_eq!(CallKind::detect(&[system(PLANNER_ROLE)]), CallKind::Plan);
        assert_eq!(CallKind::detect(&[system(REFLECTOR_ROLE)]), CallKind::Reflect);
        assert_eq!(CallKind::detect(&[system(SYNTHESIS_ROLE)]), CallKind::Synthesize);
        assert_eq!(CallKind::detect(&[Message::user("hi")]), CallKind::Decide);
    }

    #[tokio::test]
    async fn test_scripted_queues_then_defaults() {
        let llm = ScriptedLlmClient::new()
            .decide(r#"{"tool":"builtin.echo","args":{"text":"a"}}"#)
            .fail(CallKind::Decide, "boom");
        let msgs = [Message::user("task")];
        assert!(llm.complete(&msgs).await.unwrap().contains("builtin.echo"));
        assert_eq!(llm.complete(&msgs).await.unwrap_err(), "boom");
        assert_eq!(llm.complete(&msgs).await.unwrap(), DEFAULT_DECISION);
        assert_eq!(llm.calls(CallKind::Decide), 3);
        assert_eq!(llm.calls(CallKind::Plan), 0);
    }

    #[tokio::test]
    async fn test_mock_echoes_then_answers() {
        let llm = MockLlmClient;
        let first = llm.complete(&[Message::user("hello")]).await.unwrap();
        assert!(first.contains("builtin.echo"));
        let second = llm
            .complete(&[
                Message::user("hello"),
                Message::assistant(first),
                Message::user("hello"),
            ])
            .await
            .unwrap();
        assert!(second.contains("final_answer"));
    }
}
