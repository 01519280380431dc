//! 推理后端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / Scripted）实现 LlmClient；
//! ModelFactory 按模型名选择后端，供每次 Run 解析 `model_name`。

use std::sync::Arc;

use async_trait::async_trait;

use crate::memory::Message;

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成；能力清单与输出格式由调用方写入 messages
    async fn complete(&self, messages: &[Message]) -> Result<String, String>;

    /// 累计 token 使用：(prompt_tokens, completion_tokens, total_tokens)
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 模型名 → 推理后端
pub trait ModelFactory: Send + Sync {
    /// `None` 表示使用配置的默认模型
    fn client_for(&self, model: Option<&str>) -> Result<Arc<dyn LlmClient>, String>;
}

/// 总是返回同一个后端（测试 / 嵌入式调用）
pub struct FixedModel(pub Arc<dyn LlmClient>);

impl ModelFactory for FixedModel {
    fn client_for(&self, _model: Option<&str>) -> Result<Arc<dyn LlmClient>, String> {
        Ok(self.0.clone())
    }
}
