//! 各角色的提示词
//!
//! 每类调用的 system 消息以固定的角色句开头，脚本化后端据此区分调用类别。

use crate::react::{Step, Subtask};

pub const PLANNER_ROLE: &str = "You are the planning module of a tool-using agent.";
pub const EXECUTOR_ROLE: &str = "You are the execution module of a tool-using agent.";
pub const REFLECTOR_ROLE: &str = "You are the reflection module of a tool-using agent.";
pub const SYNTHESIS_ROLE: &str = "You are the answer synthesis module of a tool-using agent.";

/// 观察在 prompt 中的最大字符数
const OBSERVATION_PROMPT_CHARS: usize = 2000;

pub fn planner_system(capabilities_json: &str, plan_schema: &str) -> String {
    format!(
        "{PLANNER_ROLE}\n\
        Break the user's task into an ordered list of subtasks that can be solved with the capabilities below.\n\
        If the task is trivial and needs no capability, return an empty subtask list and put the answer in \"direct_answer\".\n\n\
        Available capabilities:\n{capabilities_json}\n\n\
        Respond with one JSON object matching this schema and nothing else:\n{plan_schema}"
    )
}

pub fn planner_strict_retry(previous: &str) -> String {
    format!(
        "Your previous reply could not be parsed:\n{}\n\n\
        Reply again with ONLY a JSON object with the fields task_analysis, subtasks \
        (each with id, description, capability_hints, priority 1-5) and execution_order. \
        No markdown, no prose.",
        clip(previous, 500)
    )
}

pub fn executor_system(
    capabilities_json: &str,
    call_schema: &str,
    parallel_schema: &str,
    final_schema: &str,
    memories: &[String],
) -> String {
    let mut prompt = format!(
        "{EXECUTOR_ROLE}\n\
        Work through the plan one step at a time. Each reply is exactly one JSON object:\n\
        - call one capability:\n{call_schema}\n\
        - or call several independent capabilities at once:\n{parallel_schema}\n\
        - or finish:\n{final_schema}\n\n\
        Use qualified capability names from this list:\n{capabilities_json}"
    );
    if !memories.is_empty() {
        prompt.push_str("\n\nRelevant memories about this user:\n");
        for m in memories {
            prompt.push_str("- ");
            prompt.push_str(m);
            prompt.push('\n');
        }
    }
    prompt
}

pub fn executor_task(task: &str, subtasks: &[Subtask]) -> String {
    format!("Task: {task}\n\nPlan:\n{}", render_subtasks(subtasks))
}

pub fn reflector_system(reflection_schema: &str) -> String {
    format!(
        "{REFLECTOR_ROLE}\n\
        Assess progress on the task given the steps taken so far. You may rewrite the subtasks that \
        have not been attempted yet, mark failed steps, or ask the user a question when the task \
        cannot continue without their input.\n\n\
        Respond with one JSON object matching this schema and nothing else:\n{reflection_schema}"
    )
}

pub fn reflector_user(task: &str, trace: &[Step], subtasks: &[Subtask]) -> String {
    format!(
        "Task: {task}\n\nSubtasks:\n{}\n\nSteps so far:\n{}",
        render_subtasks(subtasks),
        render_trace(trace)
    )
}

pub fn synthesis_system() -> String {
    format!(
        "{SYNTHESIS_ROLE}\n\
        The step budget is exhausted. Write the best possible answer to the task from the \
        observations gathered so far. Say plainly what is still missing."
    )
}

pub fn synthesis_user(task: &str, trace: &[Step]) -> String {
    format!("Task: {task}\n\nSteps:\n{}", render_trace(trace))
}

pub fn render_subtasks(subtasks: &[Subtask]) -> String {
    subtasks
        .iter()
        .map(|s| {
            let hints = if s.capability_hints.is_empty() {
                String::new()
            } else {
                format!(" (hints: {})", s.capability_hints.join(", "))
            };
            format!("{}. [{}] {}{}", s.order + 1, s.status.as_str(), s.description, hints)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_trace(trace: &[Step]) -> String {
    if trace.is_empty() {
        return "(none)".to_string();
    }
    trace
        .iter()
        .map(|step| {
            let mut line = format!("#{} {}", step.index, step.action.summary());
            for obs in &step.observations {
                let status = if obs.ok { "ok" } else { "failed" };
                line.push_str(&format!(
                    "\n   {} [{}]: {}",
                    obs.tool,
                    status,
                    clip(&obs.content, OBSERVATION_PROMPT_CHARS)
                ));
            }
            line
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// 按字符截断
pub fn clip(s: &str, max_chars: usize) -> String {
    if s.chars().count() > max_chars {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    } else {
        s.to_string()
    }
}
