//! 能力注册表：合并本地工具与所有 Ready 会话的发现结果，按名路由调用
//!
//! 纯路由，不含任何传输逻辑。目录按 ProtocolClient 的版本号惰性重建，
//! 会话关闭时其条目随版本变化整体消失；路由命中后由会话再次校验，已撤下的能力立即失败。

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::ProtocolError;
use crate::protocol::{CapabilityDescriptor, ProtocolClient, ResourceContent, ResourceDescriptor};
use crate::tools::ToolRegistry;

#[derive(Debug, Clone)]
enum Route {
    Local(String),
    Remote { provider: String, tool: String },
}

#[derive(Default)]
struct Catalog {
    version: Option<u64>,
    descriptors: Vec<CapabilityDescriptor>,
    by_qualified: HashMap<String, Route>,
    /// 裸名 → 限定名列表（多于一个即有歧义）
    by_bare: HashMap<String, Vec<String>>,
}

pub struct CapabilityRegistry {
    local: ToolRegistry,
    client: Arc<ProtocolClient>,
    catalog: RwLock<Catalog>,
}

impl CapabilityRegistry {
    pub fn new(local: ToolRegistry, client: Arc<ProtocolClient>) -> Self {
        Self {
            local,
            client,
            catalog: RwLock::new(Catalog::default()),
        }
    }

    pub fn client(&self) -> &Arc<ProtocolClient> {
        &self.client
    }

    /// 当前可见的全部能力（本地在前，远程按限定名排序）
    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        self.refresh_if_stale();
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .descriptors
            .clone()
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.client.list_resources()
    }

    /// 解析名称并调用；`cancel` 触发时放弃在途调用（槽位释放并通知 Provider）
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Value, ProtocolError> {
        if cancel.is_cancelled() {
            return Err(ProtocolError::Cancelled);
        }
        let (qualified, route) = self.resolve(name)?;
        debug!(tool = %qualified, "routing capability call");
        let call = async {
            match route {
                Route::Local(tool) => self.invoke_local(&qualified, &tool, args, timeout).await,
                Route::Remote { provider, tool } => {
                    self.client.invoke_on(&provider, &tool, args, timeout).await
                }
            }
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProtocolError::Cancelled),
            r = call => r,
        }
    }

    pub async fn fetch_resource(&self, uri: &str) -> Result<ResourceContent, ProtocolError> {
        self.client.fetch_resource(uri).await
    }

    /// 所有 Provider 配置均非法时的致命错误
    pub fn fatal_config_error(&self) -> Option<ProtocolError> {
        self.client.fatal_config_error()
    }

    /// 供 prompt 使用的能力清单（JSON 数组）
    pub fn to_prompt_json(&self) -> String {
        let items: Vec<Value> = self
            .list()
            .iter()
            .map(|d| {
                serde_json::json!({
                    "name": d.qualified_name,
                    "description": d.description,
                    "parameters": d.input_schema,
                })
            })
            .collect();
        serde_json::to_string_pretty(&items).unwrap_or_else(|_| "[]".to_string())
    }

    async fn invoke_local(
        &self,
        qualified: &str,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let handler = self
            .local
            .get(tool)
            .ok_or_else(|| ProtocolError::CapabilityNotFound(qualified.to_string()))?;
        match tokio::time::timeout(timeout, handler.execute(args)).await {
            Ok(Ok(text)) => Ok(Value::String(text)),
            Ok(Err(message)) => Err(ProtocolError::InvokeError {
                target: qualified.to_string(),
                message,
            }),
            Err(_) => Err(ProtocolError::InvokeTimeout {
                target: qualified.to_string(),
                timeout,
            }),
        }
    }

    /// 限定名总能解析；裸名仅在唯一时解析，否则列出候选
    fn resolve(&self, name: &str) -> Result<(String, Route), ProtocolError> {
        self.refresh_if_stale();
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(route) = catalog.by_qualified.get(name) {
            return Ok((name.to_string(), route.clone()));
        }
        match catalog.by_bare.get(name).map(Vec::as_slice) {
            Some([only]) => {
                let route = catalog
                    .by_qualified
                    .get(only)
                    .cloned()
                    .ok_or_else(|| ProtocolError::CapabilityNotFound(name.to_string()))?;
                Ok((only.clone(), route))
            }
            Some(many) if many.len() > 1 => Err(ProtocolError::AmbiguousCapability {
                name: name.to_string(),
                candidates: many.to_vec(),
            }),
            _ => Err(ProtocolError::CapabilityNotFound(name.to_string())),
        }
    }

    fn refresh_if_stale(&self) {
        let version = self.client.catalog_version();
        {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            if catalog.version == Some(version) {
                return;
            }
        }
        let rebuilt = self.build(version);
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        // 并发重建时保留较新的一份
        if catalog.version.map_or(true, |v| v <= version) {
            *catalog = rebuilt;
        }
    }

    fn build(&self, version: u64) -> Catalog {
        let mut descriptors = self.local.descriptors();
        descriptors.extend(self.client.list());

        let mut by_qualified = HashMap::new();
        let mut by_bare: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for d in &descriptors {
            // 按来源而不是 Provider 名路由：只有本地描述没有会话
            let route = match d.session_id {
                None => Route::Local(d.name.clone()),
                Some(_) => Route::Remote {
                    provider: d.provider.clone(),
                    tool: d.name.clone(),
                },
            };
            by_qualified.insert(d.qualified_name.clone(), route);
            by_bare
                .entry(d.name.clone())
                .or_default()
                .push(d.qualified_name.clone());
        }
        debug!(version, capabilities = descriptors.len(), "capability catalog rebuilt");
        Catalog {
            version: Some(version),
            descriptors,
            by_qualified,
            by_bare: by_bare.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::ProtocolSection;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::new(
            ToolRegistry::with_builtins(),
            ProtocolClient::new(ProtocolSection::default()),
        )
    }

    #[tokio::test]
    async fn test_builtin_echo_by_bare_and_qualified_name() {
        let registry = registry();
        let cancel = CancellationToken::new();
        let names: Vec<String> = registry.list().into_iter().map(|d| d.qualified_name).collect();
        assert_eq!(names, vec!["builtin.echo"]);

        for name in ["echo", "builtin.echo"] {
            let out = registry
                .invoke(name, json!({"text": "hi"}), Duration::from_secs(1), &cancel)
                .await
                .unwrap();
            assert_eq!(out, json!("hi"));
        }
    }

    #[tokio::test]
    async fn test_unknown_and_failing_capabilities() {
        let registry = registry();
        let cancel = CancellationToken::new();
        assert!(matches!(
            registry.invoke("search", json!({}), Duration::from_secs(1), &cancel).await,
            Err(ProtocolError::CapabilityNotFound(_))
        ));
        assert!(matches!(
            registry.invoke("echo", json!({}), Duration::from_secs(1), &cancel).await,
            Err(ProtocolError::InvokeError { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_token_short_circuits() {
        let registry = registry();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            registry.invoke("echo", json!({"text": "x"}), Duration::from_secs(1), &cancel).await,
            Err(ProtocolError::Cancelled)
        ));
    }

    #[test]
    fn test_prompt_json_lists_parameters() {
        let prompt = registry().to_prompt_json();
        assert!(prompt.contains("builtin.echo"));
        assert!(prompt.contains("\"text\""));
    }
}
