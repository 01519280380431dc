//! 跨 Run 的用户记忆
//!
//! 执行引擎在规划前按任务检索记忆，完成后写回结论。当前实现为按用户隔离的关键词重叠检索。

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use async_trait::async_trait;

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// 按查询检索该用户最相关的 k 条
    async fn fetch(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<String>, String>;

    async fn store(&self, user_id: &str, memory: &str) -> Result<(), String>;
}

/// 空实现：未启用记忆时使用
#[derive(Clone, Debug, Default)]
pub struct NoopMemoryStore;

#[async_trait]
impl MemoryStore for NoopMemoryStore {
    async fn fetch(&self, _user_id: &str, _query: &str, _k: usize) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }

    async fn store(&self, _user_id: &str, _memory: &str) -> Result<(), String> {
        Ok(())
    }
}

/// 将文本切分为小写词集合
fn tokenize_lower(s: &str) -> HashSet<String> {
    s.split(|c: char| !c.is_alphanumeric())
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() > 1)
        .collect()
}

/// 内存实现：每个用户最多保留 max_entries 条，超出时丢弃最旧的
#[derive(Debug)]
pub struct InMemoryMemoryStore {
    entries: RwLock<HashMap<String, Vec<(String, HashSet<String>)>>>,
    max_entries: usize,
}

impl InMemoryMemoryStore {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_entries: max_entries.max(1),
        }
    }
}

impl Default for InMemoryMemoryStore {
    fn default() -> Self {
        Self::new(500)
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn fetch(&self, user_id: &str, query: &str, k: usize) -> Result<Vec<String>, String> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let query_tokens = tokenize_lower(query);
        if query_tokens.is_empty() {
            return Ok(Vec::new());
        }
        let entries = self.entries.read().map_err(|e| e.to_string())?;
        let Some(user_entries) = entries.get(user_id) else {
            return Ok(Vec::new());
        };
        // 分数相同时新的在前
        let mut scored: Vec<(usize, usize, &str)> = user_entries
            .iter()
            .enumerate()
            .map(|(i, (text, tokens))| (query_tokens.intersection(tokens).count(), i, text.as_str()))
            .filter(|(score, _, _)| *score > 0)
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(b.1.cmp(&a.1)));
        Ok(scored
            .into_iter()
            .take(k)
            .map(|(_, _, text)| text.to_string())
            .collect())
    }

    async fn store(&self, user_id: &str, memory: &str) -> Result<(), String> {
        let memory = memory.trim();
        if memory.is_empty() {
            return Ok(());
        }
        let mut entries = self.entries.write().map_err(|e| e.to_string())?;
        let user_entries = entries.entry(user_id.to_string()).or_default();
        user_entries.push((memory.to_string(), tokenize_lower(memory)));
        let n = user_entries.len();
        if n > self.max_entries {
            user_entries.drain(0..n - self.max_entries);
        }
        Ok(())
    }
}
