//! 决策输出 JSON Schema（schemars 生成，拼入 system prompt 以减少格式错误）

use schemars::{schema_for, JsonSchema};
use serde_json::Value;

/// 单个能力调用：与执行引擎解析的 `{"thought", "tool", "args"}` 一致（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 推理过程，简短
    pub thought: Option<String>,
    /// 限定名 `<provider>.<tool>`；在所有 Provider 中唯一时可用裸名
    pub tool: String,
    /// 参数，须满足该能力的 input schema
    pub args: Value,
}

/// 并发调用多个互不依赖的能力
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ParallelCallFormat {
    pub thought: Option<String>,
    pub actions: Vec<ToolCallFormat>,
}

/// 任务完成
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FinalAnswerFormat {
    pub thought: Option<String>,
    pub final_answer: String,
}

fn pretty<T: JsonSchema>() -> String {
    serde_json::to_string_pretty(&schema_for!(T)).unwrap_or_default()
}

/// 单个调用的 Schema
pub fn tool_call_schema_json() -> String {
    pretty::<ToolCallFormat>()
}

/// 并发调用的 Schema
pub fn parallel_call_schema_json() -> String {
    pretty::<ParallelCallFormat>()
}

/// 最终答案的 Schema
pub fn final_answer_schema_json() -> String {
    pretty::<FinalAnswerFormat>()
}
