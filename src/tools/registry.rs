//! 本地工具注册表
//!
//! 进程内能力实现 Tool trait（name / description / parameters_schema / execute），
//! 由 ToolRegistry 按名注册；对外统一以 `builtin.<name>` 暴露给 CapabilityRegistry。

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::protocol::CapabilityDescriptor;
use crate::tools::EchoTool;

/// 本地能力的 Provider 名
pub const BUILTIN_PROVIDER: &str = "builtin";

/// 工具 trait：名称、描述（供 LLM 理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    /// 工具名称（限定名中 `builtin.` 之后的部分）
    fn name(&self) -> &str;

    /// 工具描述（供 LLM 理解功能）
    fn description(&self) -> &str;

    /// 参数 JSON Schema
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    async fn execute(&self, args: Value) -> Result<String, String>;
}

/// 本地工具表：按名称存储 Arc<dyn Tool>
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 默认内置能力：echo
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(EchoTool);
        registry
    }

    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.insert(name, Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// 以能力描述形式导出（provider = builtin，无会话）
    pub fn descriptors(&self) -> Vec<CapabilityDescriptor> {
        self.tools
            .iter()
            .map(|(name, tool)| CapabilityDescriptor {
                qualified_name: CapabilityDescriptor::qualify(BUILTIN_PROVIDER, name),
                name: name.clone(),
                provider: BUILTIN_PROVIDER.to_string(),
                session_id: None,
                description: tool.description().to_string(),
                input_schema: tool.parameters_schema(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_are_qualified() {
        let registry = ToolRegistry::with_builtins();
        let d = registry.descriptors();
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].qualified_name, "builtin.echo");
        assert!(d[0].session_id.is_none());
        assert_eq!(d[0].input_schema["required"][0], "text");
    }

    #[tokio::test]
    async fn test_execute_registered_tool() {
        let registry = ToolRegistry::with_builtins();
        let echo = registry.get("echo").unwrap();
        let out = echo.execute(serde_json::json!({"text": "hi"})).await.unwrap();
        assert_eq!(out, "hi");
        assert!(registry.get("cat").is_none());
    }
}
