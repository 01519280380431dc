//! TransportSession：到一个 Provider 的一条物理通道及其生命周期
//!
//! 监管任务负责 建连 → 握手 → 发现 → Ready，断开后按退避重连，
//! 超过重连预算后永久 Closed。会话是加锁单位：发现刷新与在途调用互斥
//! （刷新持写锁，调用持读锁），不同会话之间互不阻塞。

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use base64::Engine as _;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::catalog::{CapabilityDescriptor, Liveness, ResourceContent, ResourceDescriptor, SessionInfo};
use super::jsonrpc::PROTOCOL_VERSION;
use super::peer::{PeerSignal, RpcPeer};
use super::transport::{ConnectOptions, Transport};
use crate::config::{ProtocolSection, ProviderEntry};
use crate::core::ProtocolError;

/// 分页上限，防止服务端游标死循环
const MAX_PAGES: usize = 64;

#[derive(Debug, Default)]
struct SessionCatalog {
    tools: Vec<CapabilityDescriptor>,
    resources: Vec<ResourceDescriptor>,
    /// initialize 响应里声明了 resources 能力
    resources_supported: bool,
}

pub struct TransportSession {
    id: String,
    provider: String,
    entry: ProviderEntry,
    settings: ProtocolSection,
    liveness: watch::Sender<Liveness>,
    last_error: Mutex<Option<String>>,
    io_lock: tokio::sync::RwLock<()>,
    peer: RwLock<Option<Arc<RpcPeer>>>,
    catalog: RwLock<SessionCatalog>,
    /// 所有会话共享的目录版本号，描述或存活状态变化时递增
    catalog_version: Arc<watch::Sender<u64>>,
    shutdown: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl TransportSession {
    /// 创建会话并启动监管任务（立即开始首次建连）
    pub fn start(
        provider: &str,
        entry: ProviderEntry,
        settings: ProtocolSection,
        catalog_version: Arc<watch::Sender<u64>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (liveness, _) = watch::channel(Liveness::Connecting);
        let session = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            provider: provider.to_string(),
            entry,
            settings,
            liveness,
            last_error: Mutex::new(None),
            io_lock: tokio::sync::RwLock::new(()),
            peer: RwLock::new(None),
            catalog: RwLock::new(SessionCatalog::default()),
            catalog_version,
            shutdown,
            supervisor: Mutex::new(None),
        });
        let handle = tokio::spawn(session.clone().supervise());
        *session
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);
        session
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    pub fn subscribe_liveness(&self) -> watch::Receiver<Liveness> {
        self.liveness.subscribe()
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn info(&self) -> SessionInfo {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        SessionInfo {
            id: self.id.clone(),
            provider: self.provider.clone(),
            transport: self.entry.transport,
            liveness: self.liveness(),
            last_error: self.last_error(),
            tools: catalog.tools.len(),
            resources: catalog.resources.len(),
        }
    }

    /// 对外可见的能力；非 Ready 时为空
    pub fn tools(&self) -> Vec<CapabilityDescriptor> {
        if self.liveness() != Liveness::Ready {
            return Vec::new();
        }
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .tools
            .clone()
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        if self.liveness() != Liveness::Ready {
            return Vec::new();
        }
        self.catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources
            .clone()
    }

    pub fn has_tool(&self, tool: &str) -> bool {
        self.liveness() == Liveness::Ready
            && self
                .catalog
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .tools
                .iter()
                .any(|t| t.name == tool)
    }

    pub fn has_resource(&self, uri: &str) -> bool {
        self.liveness() == Liveness::Ready
            && self
                .catalog
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .resources
                .iter()
                .any(|r| r.uri == uri)
    }

    /// 在途调用数（诊断与泄漏断言）
    pub fn pending_calls(&self) -> usize {
        self.current_peer().map(|p| p.pending_len()).unwrap_or(0)
    }

    /// 等待首次建连结束（Ready / Degraded / Closed），最多 `timeout`
    pub async fn wait_settled(&self, timeout: Duration) -> Liveness {
        let mut rx = self.liveness.subscribe();
        let _ = tokio::time::timeout(timeout, rx.wait_for(|l| *l != Liveness::Connecting)).await;
        self.liveness()
    }

    /// 调用一个工具；会话非 Ready 或工具不在当前目录时立即失败
    pub async fn invoke(
        &self,
        tool: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        let target = CapabilityDescriptor::qualify(&self.provider, tool);
        let _io = self.io_lock.read().await;
        let peer = self.ready_peer()?;
        if !self.has_tool(tool) {
            return Err(ProtocolError::CapabilityNotFound(target));
        }
        let arguments = if args.is_null() { json!({}) } else { args };
        let result = peer
            .request(
                "tools/call",
                Some(json!({ "name": tool, "arguments": arguments })),
                &target,
                timeout,
            )
            .await?;
        flatten_call_result(&target, result)
    }

    pub async fn fetch_resource(&self, uri: &str) -> Result<ResourceContent, ProtocolError> {
        let _io = self.io_lock.read().await;
        let peer = self.ready_peer()?;
        let result = peer
            .request(
                "resources/read",
                Some(json!({ "uri": uri })),
                uri,
                self.call_timeout(),
            )
            .await?;
        parse_resource(uri, &result)
    }

    /// 重新执行发现（list_changed 或手动触发）
    pub async fn refresh(&self) -> Result<(), ProtocolError> {
        let _io = self.io_lock.write().await;
        let peer = self.ready_peer()?;
        let catalog = self.discover(&peer).await?;
        info!(
            server = %self.provider,
            tools = catalog.tools.len(),
            resources = catalog.resources.len(),
            "catalog refreshed"
        );
        self.install_catalog(catalog);
        Ok(())
    }

    /// 有界优雅关闭：先撤下目录（在途与后续调用立即失败），再关闭通道
    pub async fn close(&self) {
        self.shutdown.cancel();
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.clear_catalog();
        if let Some(peer) = self.take_peer() {
            peer.close().await;
        }
        self.set_liveness(Liveness::Closed);
        info!(server = %self.provider, session = %self.id, "session closed");
    }

    /// 同步强制关闭（关闭超时后的兜底）
    pub fn force_close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
        self.clear_catalog();
        if let Some(peer) = self.take_peer() {
            peer.abort();
        }
        self.set_liveness(Liveness::Closed);
        warn!(server = %self.provider, session = %self.id, "session force-closed");
    }

    async fn supervise(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            let (signal_tx, mut signal_rx) = mpsc::unbounded_channel();
            let established = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                r = self.establish(signal_tx) => r,
            };

            match established {
                Ok(()) => {
                    attempt = 0;
                    self.set_last_error(None);
                    self.set_liveness(Liveness::Ready);
                    info!(server = %self.provider, session = %self.id, "session ready");

                    let reason = loop {
                        let signal = tokio::select! {
                            _ = self.shutdown.cancelled() => return,
                            s = signal_rx.recv() => s,
                        };
                        match signal {
                            Some(PeerSignal::ListChanged) => {
                                let refreshed = tokio::select! {
                                    _ = self.shutdown.cancelled() => return,
                                    r = self.refresh() => r,
                                };
                                if let Err(e) = refreshed {
                                    warn!(server = %self.provider, error = %e, "catalog refresh failed");
                                }
                            }
                            Some(PeerSignal::Closed(reason)) => break reason,
                            None => break "peer stopped".to_string(),
                        }
                    };
                    self.teardown(&reason).await;
                }
                Err(e) => {
                    warn!(server = %self.provider, error = %e, attempt, "session establish failed");
                    self.set_last_error(Some(e.to_string()));
                    self.set_liveness(Liveness::Degraded);
                }
            }

            attempt += 1;
            if attempt > self.settings.max_reconnect_attempts {
                warn!(
                    server = %self.provider,
                    attempts = attempt - 1,
                    "reconnect budget exhausted, session closed"
                );
                self.set_liveness(Liveness::Closed);
                return;
            }
            let delay = self.settings.reconnect_delay(attempt);
            debug!(server = %self.provider, attempt, delay_ms = delay.as_millis() as u64, "reconnecting after backoff");
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// 建连 + initialize + notifications/initialized + 发现，整体受发现超时约束
    async fn establish(&self, signals: mpsc::UnboundedSender<PeerSignal>) -> Result<(), ProtocolError> {
        let opts = ConnectOptions::new(&self.provider, &self.entry, &self.settings);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Transport::connect(&opts, events_tx).await?;
        let peer = RpcPeer::start(&self.provider, transport, events_rx, signals);

        let timeout = self.call_timeout();
        let handshake = async {
            let init = peer
                .request(
                    "initialize",
                    Some(json!({
                        "protocolVersion": PROTOCOL_VERSION,
                        "capabilities": {},
                        "clientInfo": {
                            "name": env!("CARGO_PKG_NAME"),
                            "version": env!("CARGO_PKG_VERSION"),
                        }
                    })),
                    "initialize",
                    timeout,
                )
                .await?;
            debug!(server = %self.provider, server_info = ?init.get("serverInfo"), "initialize ok");
            peer.notify("notifications/initialized", None).await?;
            let mut catalog = self.discover_tools(&peer).await?;
            catalog.resources_supported = init
                .get("capabilities")
                .and_then(|c| c.get("resources"))
                .is_some();
            if catalog.resources_supported {
                match self.discover_resources(&peer).await {
                    Ok(resources) => catalog.resources = resources,
                    Err(e) => warn!(server = %self.provider, error = %e, "resource discovery failed"),
                }
            }
            Ok::<_, ProtocolError>(catalog)
        };

        let outcome = match tokio::time::timeout(self.settings.discovery_timeout(), handshake).await {
            Ok(r) => r,
            Err(_) => Err(ProtocolError::ConnectionError {
                provider: self.provider.clone(),
                reason: format!(
                    "discovery timed out after {}s",
                    self.settings.discovery_timeout_secs
                ),
            }),
        };
        match outcome {
            Ok(catalog) => {
                info!(
                    server = %self.provider,
                    transport = ?opts.entry.transport,
                    tools = catalog.tools.len(),
                    resources = catalog.resources.len(),
                    "discovery complete"
                );
                *self.peer.write().unwrap_or_else(PoisonError::into_inner) = Some(peer);
                self.install_catalog(catalog);
                Ok(())
            }
            Err(e) => {
                peer.close().await;
                Err(e)
            }
        }
    }

    async fn discover(&self, peer: &RpcPeer) -> Result<SessionCatalog, ProtocolError> {
        let mut catalog = self.discover_tools(peer).await?;
        catalog.resources_supported = self
            .catalog
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resources_supported;
        if catalog.resources_supported {
            catalog.resources = self.discover_resources(peer).await.unwrap_or_default();
        }
        Ok(catalog)
    }

    async fn discover_tools(&self, peer: &RpcPeer) -> Result<SessionCatalog, ProtocolError> {
        let items = self.paginate(peer, "tools/list", "tools").await?;
        let tools = items
            .iter()
            .filter_map(|item| CapabilityDescriptor::from_listing(&self.provider, &self.id, item))
            .collect();
        Ok(SessionCatalog {
            tools,
            ..SessionCatalog::default()
        })
    }

    async fn discover_resources(&self, peer: &RpcPeer) -> Result<Vec<ResourceDescriptor>, ProtocolError> {
        let items = self.paginate(peer, "resources/list", "resources").await?;
        Ok(items
            .iter()
            .filter_map(|item| ResourceDescriptor::from_listing(&self.provider, item))
            .collect())
    }

    async fn paginate(&self, peer: &RpcPeer, method: &str, field: &str) -> Result<Vec<Value>, ProtocolError> {
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_PAGES {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let page = peer
                .request(method, params, method, self.call_timeout())
                .await?;
            if let Some(list) = page.get(field).and_then(|v| v.as_array()) {
                items.extend(list.iter().cloned());
            }
            cursor = page
                .get("nextCursor")
                .and_then(|c| c.as_str())
                .filter(|c| !c.is_empty())
                .map(str::to_string);
            if cursor.is_none() {
                break;
            }
        }
        Ok(items)
    }

    async fn teardown(&self, reason: &str) {
        self.clear_catalog();
        if let Some(peer) = self.take_peer() {
            peer.close().await;
        }
        self.set_last_error(Some(reason.to_string()));
        self.set_liveness(Liveness::Degraded);
    }

    fn ready_peer(&self) -> Result<Arc<RpcPeer>, ProtocolError> {
        if self.liveness() != Liveness::Ready {
            return Err(ProtocolError::SessionUnavailable(format!(
                "{} is {:?}",
                self.provider,
                self.liveness()
            )));
        }
        self.current_peer()
            .ok_or_else(|| ProtocolError::SessionUnavailable(format!("{}: not connected", self.provider)))
    }

    fn current_peer(&self) -> Option<Arc<RpcPeer>> {
        self.peer.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn take_peer(&self) -> Option<Arc<RpcPeer>> {
        self.peer.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn call_timeout(&self) -> Duration {
        self.entry
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.settings.discovery_timeout())
    }

    fn install_catalog(&self, catalog: SessionCatalog) {
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = catalog;
        self.bump_version();
    }

    fn clear_catalog(&self) {
        *self.catalog.write().unwrap_or_else(PoisonError::into_inner) = SessionCatalog::default();
        self.bump_version();
    }

    fn set_liveness(&self, liveness: Liveness) {
        let changed = self.liveness.send_if_modified(|current| {
            if *current == liveness {
                false
            } else {
                *current = liveness;
                true
            }
        });
        if changed {
            self.bump_version();
        }
    }

    fn set_last_error(&self, err: Option<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = err;
    }

    fn bump_version(&self) {
        self.catalog_version.send_modify(|v| *v += 1);
    }
}

/// tools/call 结果：isError 转为 InvokeError；全部为文本块时拼成字符串
pub(crate) fn flatten_call_result(target: &str, result: Value) -> Result<Value, ProtocolError> {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let blocks = result
        .get("content")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();
    let texts: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();
    let all_text = !blocks.is_empty() && texts.len() == blocks.len();

    if is_error {
        let message = if texts.is_empty() {
            result.to_string()
        } else {
            texts.join("\n")
        };
        return Err(ProtocolError::InvokeError {
            target: target.to_string(),
            message,
        });
    }
    if all_text {
        return Ok(Value::String(texts.join("\n")));
    }
    if let Some(structured) = result.get("structuredContent") {
        return Ok(structured.clone());
    }
    Ok(result)
}

fn parse_resource(uri: &str, result: &Value) -> Result<ResourceContent, ProtocolError> {
    let item = result
        .get("contents")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .ok_or_else(|| ProtocolError::ResourceNotFound(uri.to_string()))?;
    let uri = item
        .get("uri")
        .and_then(|u| u.as_str())
        .unwrap_or(uri)
        .to_string();
    let mime_type = item
        .get("mimeType")
        .and_then(|m| m.as_str())
        .map(str::to_string);
    if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
        return Ok(ResourceContent::Text {
            uri,
            mime_type,
            text: text.to_string(),
        });
    }
    if let Some(blob) = item.get("blob").and_then(|b| b.as_str()) {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .map_err(|e| ProtocolError::Codec(format!("invalid base64 blob for {uri}: {e}")))?;
        return Ok(ResourceContent::Blob {
            uri,
            mime_type,
            bytes,
        });
    }
    Err(ProtocolError::Codec(format!("resource {uri} has neither text nor blob")))
}
