//! 发现结果：能力描述、资源描述与会话快照

use serde::Serialize;
use serde_json::Value;

use crate::config::TransportKind;

/// 会话存活状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

/// 一个可调用能力；只有 Ready 会话的描述对外可见
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CapabilityDescriptor {
    /// `<provider>.<tool>`
    pub qualified_name: String,
    /// Provider 内的工具名
    pub name: String,
    pub provider: String,
    /// 所属会话 id；本地能力为 None
    pub session_id: Option<String>,
    pub description: String,
    pub input_schema: Value,
}

impl CapabilityDescriptor {
    pub fn qualify(provider: &str, tool: &str) -> String {
        format!("{provider}.{tool}")
    }

    /// 从 tools/list 的单项解析；缺少 name 的条目丢弃
    pub fn from_listing(provider: &str, session_id: &str, item: &Value) -> Option<Self> {
        let name = item.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            qualified_name: Self::qualify(provider, name),
            name: name.to_string(),
            provider: provider.to_string(),
            session_id: Some(session_id.to_string()),
            description: item
                .get("description")
                .and_then(|d| d.as_str())
                .unwrap_or("")
                .to_string(),
            input_schema: item
                .get("inputSchema")
                .cloned()
                .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    pub provider: String,
    pub description: Option<String>,
    pub mime_type: Option<String>,
}

impl ResourceDescriptor {
    pub fn from_listing(provider: &str, item: &Value) -> Option<Self> {
        let uri = item.get("uri")?.as_str()?.to_string();
        let text = |key: &str| item.get(key).and_then(|v| v.as_str()).map(str::to_string);
        Some(Self {
            name: text("name").unwrap_or_else(|| uri.clone()),
            uri,
            provider: provider.to_string(),
            description: text("description"),
            mime_type: text("mimeType"),
        })
    }
}

/// resources/read 的结果
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceContent {
    Text {
        uri: String,
        mime_type: Option<String>,
        text: String,
    },
    Blob {
        uri: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    },
}

impl ResourceContent {
    pub fn uri(&self) -> &str {
        match self {
            ResourceContent::Text { uri, .. } | ResourceContent::Blob { uri, .. } => uri,
        }
    }
}

/// 会话快照（诊断 / 日志）
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub provider: String,
    pub transport: TransportKind,
    pub liveness: Liveness,
    pub last_error: Option<String>,
    pub tools: usize,
    pub resources: usize,
}
