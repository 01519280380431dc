//! Bee 执行内核
//!
//! 模块划分：
//! - **agent**: Run 级入口（按模型名选择推理后端，返回答案 / 步骤 / 状态）
//! - **config**: 应用配置加载（TOML + 环境变量），含 Provider 表
//! - **core**: 错误与恢复、执行状态机、动作调度、优雅关闭
//! - **llm**: 推理后端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）
//! - **memory**: 决策对话与跨 Run 用户记忆
//! - **protocol**: JSON-RPC 编解码、挂起调用表、三种传输、会话监管与 ProtocolClient
//! - **react**: 执行引擎、Planner、Reflector、决策解析
//! - **tools**: 本地能力、能力注册表与执行器

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod protocol;
pub mod react;
pub mod tools;

pub use agent::{Agent, RunResponse};
