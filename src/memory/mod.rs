//! 记忆层：决策对话（短期）与跨 Run 用户记忆

pub mod conversation;
pub mod store;

pub use conversation::{ConversationMemory, Message, Role};
pub use store::{InMemoryMemoryStore, MemoryStore, NoopMemoryStore};
