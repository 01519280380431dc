//! Planner：把任务分解为有序子任务
//!
//! 后端回复按 PlanFormat 解析；格式错误时带严格提示重试一次，仍失败则退化为「任务本身」一个子任务。
//! 子任务列表为空且给出 direct_answer 时视为平凡任务，引擎直接作答。

use std::collections::HashSet;
use std::sync::Arc;

use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};

use crate::core::AgentError;
use crate::llm::LlmClient;
use crate::memory::Message;
use crate::react::prompts;

/// 规划输出格式（同时用于生成 prompt 中的 Schema）
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PlanFormat {
    /// 对任务的简短分析
    #[serde(default)]
    pub task_analysis: String,
    #[serde(default)]
    pub subtasks: Vec<SubtaskSpec>,
    /// 子任务 id 的执行顺序；缺省时按 subtasks 顺序
    #[serde(default)]
    pub execution_order: Vec<String>,
    /// 平凡任务的直接答案（此时 subtasks 为空）
    #[serde(default)]
    pub direct_answer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SubtaskSpec {
    pub id: String,
    pub description: String,
    /// 可能用到的能力（限定名）
    #[serde(default)]
    pub capability_hints: Vec<String>,
    /// 1（最低）到 5（最高）
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    3
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Completed,
    Failed,
}

impl SubtaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
        }
    }
}

/// 计划中的一个子任务
#[derive(Clone, Debug, Serialize)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub capability_hints: Vec<String>,
    pub priority: u8,
    /// 执行顺序中的位置（从 0 开始）
    pub order: usize,
    pub status: SubtaskStatus,
}

impl Subtask {
    fn from_spec(spec: SubtaskSpec, order: usize) -> Self {
        Self {
            id: spec.id,
            description: spec.description,
            capability_hints: spec.capability_hints,
            priority: spec.priority.clamp(1, 5),
            order,
            status: SubtaskStatus::Pending,
        }
    }

    /// 规划失败时的兜底：任务本身
    pub fn whole_task(task: &str) -> Self {
        Self {
            id: "1".to_string(),
            description: task.to_string(),
            capability_hints: Vec::new(),
            priority: 3,
            order: 0,
            status: SubtaskStatus::Pending,
        }
    }
}

/// 按 execution_order 排列子任务；未出现在顺序中的 id 追加在后，未知或重复的 id 忽略
pub fn order_subtasks(specs: Vec<SubtaskSpec>, execution_order: &[String]) -> Vec<Subtask> {
    let mut remaining: Vec<Option<SubtaskSpec>> = specs.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut seen = HashSet::new();

    for id in execution_order {
        if !seen.insert(id.clone()) {
            continue;
        }
        if let Some(slot) = remaining
            .iter_mut()
            .find(|s| s.as_ref().is_some_and(|spec| &spec.id == id))
        {
            if let Some(spec) = slot.take() {
                ordered.push(spec);
            }
        }
    }
    ordered.extend(remaining.into_iter().flatten());

    ordered
        .into_iter()
        .enumerate()
        .map(|(i, spec)| Subtask::from_spec(spec, i))
        .collect()
}

/// 规划结果
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub analysis: String,
    pub subtasks: Vec<Subtask>,
    /// 平凡任务：无需任何能力调用
    pub direct_answer: Option<String>,
}

pub fn plan_schema_json() -> String {
    serde_json::to_string_pretty(&schema_for!(PlanFormat)).unwrap_or_default()
}

/// 从回复中解析计划；至少要有一个子任务或一个直接答案
pub fn parse_plan(output: &str) -> Result<PlanFormat, AgentError> {
    let trimmed = output.trim();
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else {
        match (trimmed.find('{'), trimmed.rfind('}')) {
            (Some(start), Some(end)) if end > start => &trimmed[start..=end],
            _ => return Err(AgentError::JsonParseError(format!("no JSON in plan: {trimmed}"))),
        }
    };
    let plan: PlanFormat = serde_json::from_str(json_str)
        .map_err(|e| AgentError::JsonParseError(format!("{}: {}", e, json_str)))?;
    let has_answer = plan
        .direct_answer
        .as_deref()
        .is_some_and(|a| !a.trim().is_empty());
    if plan.subtasks.is_empty() && !has_answer {
        return Err(AgentError::PlanningError(
            "plan has neither subtasks nor a direct answer".to_string(),
        ));
    }
    Ok(plan)
}

pub struct Planner {
    llm: Arc<dyn LlmClient>,
}

impl Planner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// 第一次后端调用失败返回 LlmError；格式错误不会失败
    pub async fn plan(&self, task: &str, capabilities_json: &str) -> Result<PlanOutcome, AgentError> {
        let mut messages = vec![
            Message::system(prompts::planner_system(capabilities_json, &plan_schema_json())),
            Message::user(task.to_string()),
        ];
        let first = self.llm.complete(&messages).await.map_err(AgentError::LlmError)?;

        let parsed = match parse_plan(&first) {
            Ok(plan) => Some(plan),
            Err(e) => {
                tracing::warn!(error = %e, "malformed plan, retrying with strict prompt");
                messages.push(Message::assistant(first.clone()));
                messages.push(Message::user(prompts::planner_strict_retry(&first)));
                match self.llm.complete(&messages).await {
                    Ok(second) => match parse_plan(&second) {
                        Ok(plan) => Some(plan),
                        Err(e) => {
                            tracing::warn!(error = %e, "plan still malformed, falling back to a single subtask");
                            None
                        }
                    },
                    Err(e) => {
                        tracing::warn!(error = %e, "plan retry failed, falling back to a single subtask");
                        None
                    }
                }
            }
        };

        let Some(plan) = parsed else {
            return Ok(PlanOutcome {
                analysis: String::new(),
                subtasks: vec![Subtask::whole_task(task)],
                direct_answer: None,
            });
        };

        let direct_answer = if plan.subtasks.is_empty() {
            plan.direct_answer.filter(|a| !a.trim().is_empty())
        } else {
            None
        };
        Ok(PlanOutcome {
            analysis: plan.task_analysis,
            subtasks: order_subtasks(plan.subtasks, &plan.execution_order),
            direct_answer,
        })
    }
}
