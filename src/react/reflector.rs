//! Reflector：定期评估进展，可改写未执行的子任务或向用户提问
//!
//! 回复无法解析时视为「计划不变、可以继续」。已完成的子任务不会被改写。

use std::collections::HashSet;
use std::sync::Arc;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::planner::{SubtaskSpec, SubtaskStatus};
use crate::react::{prompts, Step, Subtask};

/// 反思输出格式
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Reflection {
    /// 对当前进展的评估
    #[serde(default)]
    pub assessment: String,
    /// 已完成的子任务 id
    #[serde(default)]
    pub completed_subtasks: Vec<String>,
    /// 失败且不再尝试的子任务 id
    #[serde(default)]
    pub failed_subtasks: Vec<String>,
    /// 失败步骤的序号
    #[serde(default)]
    pub failed_steps: Vec<usize>,
    /// 替换所有尚未执行的子任务；null 表示不改
    #[serde(default)]
    pub revised_subtasks: Option<Vec<SubtaskSpec>>,
    #[serde(default)]
    pub needs_user_input: bool,
    /// needs_user_input 时向用户提出的问题
    #[serde(default)]
    pub question: Option<String>,
    /// false 表示无法继续，引擎以已有信息作答
    #[serde(default = "default_can_proceed")]
    pub can_proceed: bool,
}

fn default_can_proceed() -> bool {
    true
}

impl Reflection {
    /// 计划不变、继续执行
    pub fn unchanged(assessment: impl Into<String>) -> Self {
        Self {
            assessment: assessment.into(),
            completed_subtasks: Vec::new(),
            failed_subtasks: Vec::new(),
            failed_steps: Vec::new(),
            revised_subtasks: None,
            needs_user_input: false,
            question: None,
            can_proceed: true,
        }
    }
}

/// Trace 之外单独保存的反思记录
#[derive(Clone, Debug, Serialize)]
pub struct ReflectionRecord {
    /// 反思发生时已完成的步数
    pub after_step: usize,
    pub reflection: Reflection,
}

pub fn reflection_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(Reflection)).unwrap_or_default()
}

pub fn parse_reflection(output: &str) -> Option<Reflection> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        let start = trimmed.find('{')?;
        let end = trimmed.rfind('}')?;
        trimmed.get(start..=end)?
    };
    serde_json::from_str(json_str).ok()
}

/// 应用反思结果：只动尚未执行（Pending）的子任务
pub fn apply_reflection(subtasks: &mut Vec<Subtask>, reflection: &Reflection) {
    for st in subtasks.iter_mut() {
        if st.status != SubtaskStatus::Pending {
            continue;
        }
        if reflection.completed_subtasks.contains(&st.id) {
            st.status = SubtaskStatus::Completed;
        } else if reflection.failed_subtasks.contains(&st.id) {
            st.status = SubtaskStatus::Failed;
        }
    }

    if let Some(revised) = &reflection.revised_subtasks {
        subtasks.retain(|s| s.status != SubtaskStatus::Pending);
        let taken: HashSet<String> = subtasks.iter().map(|s| s.id.clone()).collect();
        let start = subtasks.len();
        for (i, spec) in revised.iter().filter(|s| !taken.contains(&s.id)).enumerate() {
            subtasks.push(Subtask {
                id: spec.id.clone(),
                description: spec.description.clone(),
                capability_hints: spec.capability_hints.clone(),
                priority: spec.priority.clamp(1, 5),
                order: start + i,
                status: SubtaskStatus::Pending,
            });
        }
    }
}

pub struct Reflector {
    llm: Arc<dyn LlmClient>,
}

impl Reflector {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 后端失败返回 LlmError；回复无法解析时返回 unchanged
    pub async fn reflect(
        &self,
        task: &str,
        trace: &[Step],
        subtasks: &[Subtask],
    ) -> Result<Reflection, AgentError> {
        let messages = vec![
            Message::system(prompts::reflector_system(&reflection_schema_json())),
            Message::user(prompts::reflector_user(task, trace, subtasks)),
        ];
        let output = self.llm.complete(&messages).await.map_err(AgentError::LlmError)?;
        Ok(parse_reflection(&output).unwrap_or_else(|| {
            tracing::warn!("unparseable reflection, keeping the plan");
            Reflection::unchanged("unparseable reflection")
        }))
    }
}
