//! 按配置与环境变量选择推理后端（DeepSeek / OpenAI 兼容 / Mock）

use std::sync::Arc;

use tracing::{info, warn};

use crate::config::LlmSection;
use crate::llm::{
    create_deepseek_client, deepseek_api_key, is_deepseek_model, LlmClient, MockLlmClient,
    ModelFactory, OpenAiClient,
};

/// 由 [llm] 段驱动的模型工厂
pub struct ConfiguredModels {
    llm: LlmSection,
}

impl ConfiguredModels {
    pub fn new(llm: LlmSection) -> Self {
        Self { llm }
    }
}

impl ModelFactory for ConfiguredModels {
    fn client_for(&self, model: Option<&str>) -> Result<Arc<dyn LlmClient>, String> {
        let model = model
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.llm.model);
        let provider = self.llm.provider.to_lowercase();

        if model == "mock" || provider == "mock" {
            info!("Using Mock LLM");
            return Ok(Arc::new(MockLlmClient));
        }

        if is_deepseek_model(model) || (provider == "deepseek" && self.llm.base_url.is_none()) {
            return match deepseek_api_key() {
                Some(key) => {
                    info!(model = %model, "Using DeepSeek LLM");
                    Ok(Arc::new(create_deepseek_client(model, &key)))
                }
                None => {
                    warn!(model = %model, "No DEEPSEEK_API_KEY / OPENAI_API_KEY set, using Mock LLM");
                    Ok(Arc::new(MockLlmClient))
                }
            };
        }

        match std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty()) {
            Some(key) => {
                info!(model = %model, base_url = ?self.llm.base_url, "Using OpenAI-compatible LLM");
                Ok(Arc::new(OpenAiClient::new(
                    self.llm.base_url.as_deref(),
                    model,
                    Some(key.as_str()),
                )))
            }
            None if self.llm.base_url.is_some() => {
                // 自建兼容端点通常不校验 key
                info!(model = %model, base_url = ?self.llm.base_url, "Using OpenAI-compatible LLM without key");
                Ok(Arc::new(OpenAiClient::new(
                    self.llm.base_url.as_deref(),
                    model,
                    Some("sk-placeholder"),
                )))
            }
            None => {
                warn!(model = %model, "No OPENAI_API_KEY set, using Mock LLM");
                Ok(Arc::new(MockLlmClient))
            }
        }
    }
}
