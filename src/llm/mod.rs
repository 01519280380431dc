//! LLM 层：推理后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）

pub mod deepseek;
pub mod factory;
pub mod mock;
pub mod openai;
pub mod traits;

pub use deepseek::{
    create_deepseek_client, deepseek_api_key, is_deepseek_model, DEEPSEEK_CHAT, DEEPSEEK_REASONER,
};
pub use factory::ConfiguredModels;
pub use mock::{CallKind, MockLlmClient, ScriptedLlmClient};
pub use openai::{OpenAiClient, TokenUsage};
pub use traits::{FixedModel, LlmClient, ModelFactory};
