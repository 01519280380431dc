//! DeepSeek 后端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat (常规对话), deepseek-reasoner (思考模式)

use crate::llm::OpenAiClient;

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";
pub const DEEPSEEK_REASONER: &str = "deepseek-reasoner";

/// `DEEPSEEK_API_KEY`，其次 `OPENAI_API_KEY`
pub fn deepseek_api_key() -> Option<String> {
    std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .filter(|k| !k.trim().is_empty())
}

pub fn is_deepseek_model(model: &str) -> bool {
    model.to_ascii_lowercase().starts_with("deepseek")
}

pub fn create_deepseek_client(model: &str, api_key: &str) -> OpenAiClient {
    OpenAiClient::new(Some(DEEPSEEK_BASE_URL), model, Some(api_key))
}
