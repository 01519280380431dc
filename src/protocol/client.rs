//! ProtocolClient：持有全部 TransportSession，对上提供 initialize / list / invoke / shutdown
//!
//! 显式构造、显式关闭，不是全局单例；测试可以各自创建隔离实例并断言泄漏。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::catalog::{CapabilityDescriptor, Liveness, ResourceContent, ResourceDescriptor, SessionInfo};
use super::session::TransportSession;
use crate::config::{ProtocolSection, ProviderEntry};
use crate::core::ProtocolError;

/// initialize 的结果汇总
#[derive(Debug, Clone, Default, Serialize)]
pub struct InitReport {
    pub ready: Vec<String>,
    pub degraded: Vec<String>,
    pub disabled: Vec<String>,
    /// 配置非法被跳过的 Provider 及原因
    pub skipped: Vec<(String, String)>,
}

pub struct ProtocolClient {
    settings: ProtocolSection,
    sessions: RwLock<BTreeMap<String, Arc<TransportSession>>>,
    catalog_version: Arc<watch::Sender<u64>>,
    /// 所有启用的 Provider 配置均非法时记录，执行引擎据此让 Run 失败
    fatal: Mutex<Option<ProtocolError>>,
    shutdown: CancellationToken,
}

impl ProtocolClient {
    pub fn new(settings: ProtocolSection) -> Arc<Self> {
        let (catalog_version, _) = watch::channel(0u64);
        Arc::new(Self {
            settings,
            sessions: RwLock::new(BTreeMap::new()),
            catalog_version: Arc::new(catalog_version),
            fatal: Mutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn settings(&self) -> &ProtocolSection {
        &self.settings
    }

    /// 为每个启用且合法的 Provider 启动会话，并等待首次握手结束。
    /// 单个 Provider 的配置错误只跳过它；全部非法时返回 ConfigError。
    pub async fn initialize(
        &self,
        providers: &BTreeMap<String, ProviderEntry>,
    ) -> Result<InitReport, ProtocolError> {
        let mut report = InitReport::default();
        let mut started = Vec::new();

        for (name, entry) in providers {
            if !entry.enabled {
                info!(server = %name, "provider disabled, skipping");
                report.disabled.push(name.clone());
                continue;
            }
            if let Err(e) = entry.validate(name) {
                warn!(server = %name, error = %e, "invalid provider config, skipping");
                report.skipped.push((name.clone(), e.to_string()));
                continue;
            }
            if self.session(name).is_some() {
                warn!(server = %name, "provider already connected, skipping");
                continue;
            }
            let session = TransportSession::start(
                name,
                entry.clone(),
                self.settings.clone(),
                self.catalog_version.clone(),
                self.shutdown.child_token(),
            );
            self.sessions
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(name.clone(), session.clone());
            started.push(session);
        }

        if started.is_empty() && !report.skipped.is_empty() {
            let reason = report
                .skipped
                .iter()
                .map(|(name, e)| format!("{name}: {e}"))
                .collect::<Vec<_>>()
                .join("; ");
            let err = ProtocolError::ConfigError {
                provider: "*".to_string(),
                reason: format!("no usable provider ({reason})"),
            };
            *self.fatal.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.clone());
            return Err(err);
        }

        // 首次握手受发现超时约束，这里多留一点余量
        let settle = self.settings.discovery_timeout() + Duration::from_secs(1);
        let outcomes = join_all(started.iter().map(|s| s.wait_settled(settle))).await;
        for (session, liveness) in started.iter().zip(outcomes) {
            match liveness {
                Liveness::Ready => report.ready.push(session.provider().to_string()),
                _ => report.degraded.push(session.provider().to_string()),
            }
        }
        info!(
            ready = report.ready.len(),
            degraded = report.degraded.len(),
            skipped = report.skipped.len(),
            disabled = report.disabled.len(),
            "protocol client initialized"
        );
        Ok(report)
    }

    /// 所有 Ready 会话的能力，按限定名排序
    pub fn list(&self) -> Vec<CapabilityDescriptor> {
        let mut tools: Vec<CapabilityDescriptor> =
            self.sessions().iter().flat_map(|s| s.tools()).collect();
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools
    }

    pub fn list_resources(&self) -> Vec<ResourceDescriptor> {
        self.sessions().iter().flat_map(|s| s.resources()).collect()
    }

    /// 按限定名或唯一裸名调用远程能力
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let (provider, tool) = self.resolve(name)?;
        self.invoke_on(&provider, &tool, args, timeout).await
    }

    /// 直接调用指定 Provider 上的工具
    pub async fn invoke_on(
        &self,
        provider: &str,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let session = self.session(provider).ok_or_else(|| {
            ProtocolError::CapabilityNotFound(CapabilityDescriptor::qualify(provider, tool))
        })?;
        session.invoke(tool, args, timeout).await
    }

    pub async fn fetch_resource(&self, uri: &str) -> Result<ResourceContent, ProtocolError> {
        let owner = self
            .sessions()
            .into_iter()
            .find(|s| s.has_resource(uri))
            .ok_or_else(|| ProtocolError::ResourceNotFound(uri.to_string()))?;
        owner.fetch_resource(uri).await
    }

    pub async fn refresh(&self, provider: &str) -> Result<(), ProtocolError> {
        let session = self
            .session(provider)
            .ok_or_else(|| ProtocolError::SessionUnavailable(provider.to_string()))?;
        session.refresh().await
    }

    pub fn session_states(&self) -> Vec<SessionInfo> {
        self.sessions().iter().map(|s| s.info()).collect()
    }

    /// 所有会话的在途调用总数
    pub fn pending_calls(&self) -> usize {
        self.sessions().iter().map(|s| s.pending_calls()).sum()
    }

    /// 目录版本号：任一会话的描述或存活状态变化都会递增
    pub fn catalog_version(&self) -> u64 {
        *self.catalog_version.borrow()
    }

    pub fn subscribe_catalog(&self) -> watch::Receiver<u64> {
        self.catalog_version.subscribe()
    }

    pub fn fatal_config_error(&self) -> Option<ProtocolError> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 每个会话在各自的期限内关闭，超时的强制终止
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<TransportSession>> = {
            let mut map = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *map).into_values().collect()
        };
        if sessions.is_empty() {
            return;
        }
        let deadline = self.settings.shutdown_timeout();
        join_all(sessions.iter().map(|session| async move {
            if tokio::time::timeout(deadline, session.close()).await.is_err() {
                warn!(
                    server = %session.provider(),
                    timeout_secs = deadline.as_secs(),
                    "session close timed out, forcing"
                );
                session.force_close();
            }
        }))
        .await;
        self.shutdown.cancel();
        info!(sessions = sessions.len(), "protocol client shut down");
    }

    /// 限定名 `<provider>.<tool>` 直接命中；裸名仅在唯一时解析
    fn resolve(&self, name: &str) -> Result<(String, String), ProtocolError> {
        if let Some((provider, tool)) = name.split_once('.') {
            if let Some(session) = self.session(provider) {
                if session.has_tool(tool) {
                    return Ok((provider.to_string(), tool.to_string()));
                }
                if session.liveness() != Liveness::Ready {
                    return Err(ProtocolError::SessionUnavailable(format!(
                        "{provider} is {:?}",
                        session.liveness()
                    )));
                }
                return Err(ProtocolError::CapabilityNotFound(name.to_string()));
            }
        }
        let candidates: Vec<String> = self
            .sessions()
            .iter()
            .filter(|s| s.has_tool(name))
            .map(|s| s.provider().to_string())
            .collect();
        match candidates.as_slice() {
            [] => Err(ProtocolError::CapabilityNotFound(name.to_string())),
            [provider] => Ok((provider.clone(), name.to_string())),
            _ => Err(ProtocolError::AmbiguousCapability {
                name: name.to_string(),
                candidates: candidates
                    .iter()
                    .map(|p| CapabilityDescriptor::qualify(p, name))
                    .collect(),
            }),
        }
    }

    fn session(&self, provider: &str) -> Option<Arc<TransportSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(provider)
            .cloned()
    }

    fn sessions(&self) -> Vec<Arc<TransportSession>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.shutdown.cancel();
        let sessions = self.sessions.get_mut().unwrap_or_else(PoisonError::into_inner);
        for session in sessions.values() {
            session.force_close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;

    fn fast_settings() -> ProtocolSection {
        ProtocolSection {
            discovery_timeout_secs: 2,
            max_reconnect_attempts: 0,
            backoff_base_ms: 10,
            backoff_cap_ms: 10,
            ..ProtocolSection::default()
        }
    }

    #[tokio::test]
    async fn test_all_invalid_configs_is_fatal() {
        let client = ProtocolClient::new(fast_settings());
        let mut providers = BTreeMap::new();
        providers.insert(
            "broken".to_string(),
            ProviderEntry::remote(TransportKind::Socket, "http://not-a-socket"),
        );
        let err = client.initialize(&providers).await.unwrap_err();
        assert!(matches!(err, ProtocolError::ConfigError { .. }));
        assert!(client.fatal_config_error().is_some());
    }

    #[tokio::test]
    async fn test_invalid_provider_is_skipped_others_proceed() {
        let client = ProtocolClient::new(fast_settings());
        let mut providers = BTreeMap::new();
        providers.insert(
            "broken".to_string(),
            ProviderEntry::remote(TransportKind::Http, "ftp://nope"),
        );
        providers.insert(
            "down".to_string(),
            ProviderEntry::remote(TransportKind::Socket, "ws://127.0.0.1:9/"),
        );
        let mut off = ProviderEntry::process("true", vec![]);
        off.enabled = false;
        providers.insert("off".to_string(), off);

        let report = client.initialize(&providers).await.unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.disabled, vec!["off".to_string()]);
        assert_eq!(report.degraded, vec!["down".to_string()]);
        assert!(client.fatal_config_error().is_none());
        assert!(client.list().is_empty());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_empty_config_is_ok() {
        let client = ProtocolClient::new(fast_settings());
        let report = client.initialize(&BTreeMap::new()).await.unwrap();
        assert!(report.ready.is_empty());
        assert!(client.fatal_config_error().is_none());
        assert!(matches!(
            client.invoke("missing", Value::Null, Duration::from_secs(1)).await,
            Err(ProtocolError::CapabilityNotFound(_))
        ));
    }
}
