//! RpcPeer：一条已建立通道上的 JSON-RPC 端点
//!
//! - 出站请求先登记 PendingCall（截止时间在写出前确定），再写出，等待完成槽
//! - 分发任务把入站响应回填到 PendingCall，应答服务端请求，把通知转成会话信号
//! - 看门狗负责超时；调用方放弃（future 被 drop）时 CallGuard 释放槽位并通知 Provider

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::jsonrpc::{
    notification, parse_inbound, response_to, Inbound, JsonRpcRequest, RpcError, METHOD_NOT_FOUND,
};
use super::pending::{run_watchdog, PendingCall, PendingCalls};
use super::transport::{Transport, TransportEvent};
use crate::core::ProtocolError;

/// 分发任务上报给会话监管的信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerSignal {
    /// 服务端声明能力列表已变化，需要重新发现
    ListChanged,
    /// 通道断开
    Closed(String),
}

pub struct RpcPeer {
    name: String,
    transport: Arc<Transport>,
    pending: Arc<PendingCalls>,
    next_id: AtomicU64,
    stop: CancellationToken,
}

impl RpcPeer {
    /// 接管一个已连接的通道：启动入站分发与看门狗
    pub fn start(
        name: &str,
        transport: Transport,
        events: mpsc::UnboundedReceiver<TransportEvent>,
        signals: mpsc::UnboundedSender<PeerSignal>,
    ) -> Arc<Self> {
        let transport = Arc::new(transport);
        let pending = Arc::new(PendingCalls::new());
        let stop = CancellationToken::new();

        tokio::spawn(dispatch(
            name.to_string(),
            transport.clone(),
            pending.clone(),
            events,
            signals,
            stop.clone(),
        ));

        let expired_transport = transport.clone();
        let expired_name = name.to_string();
        tokio::spawn(run_watchdog(pending.clone(), stop.clone(), move |ids| {
            for id in ids {
                warn!(server = %expired_name, id, "request timed out");
                send_cancelled(expired_transport.clone(), id, "timeout");
            }
        }));

        Arc::new(Self {
            name: name.to_string(),
            transport,
            pending,
            next_id: AtomicU64::new(1),
            stop,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 当前在途调用数
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// 发出请求并等待响应；超时由看门狗回填，放弃由 CallGuard 清理
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        target: &str,
        timeout: Duration,
    ) -> Result<Value, ProtocolError> {
        if self.stop.is_cancelled() {
            return Err(ProtocolError::SessionUnavailable(format!("{}: closed", self.name)));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let message = serde_json::to_value(JsonRpcRequest::new(id, method, params))
            .map_err(|e| ProtocolError::Codec(e.to_string()))?;
        let (call, rx) = PendingCall::new(id, target, message.clone(), timeout);
        let deadline = call.deadline;
        self.pending.register(call);
        let mut guard = CallGuard {
            peer: self,
            id,
            armed: true,
        };

        match tokio::time::timeout_at(deadline, self.transport.send(&message)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                guard.armed = false;
                self.pending.remove(id);
                return Err(e);
            }
            // 写出本身卡到截止时间：看门狗已回填超时
            Err(_) => {}
        }

        let result = rx.await.unwrap_or_else(|_| {
            Err(ProtocolError::SessionUnavailable(format!("{}: closed", self.name)))
        });
        guard.armed = false;
        result
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ProtocolError> {
        self.transport.send(&notification(method, params)).await
    }

    /// 优雅关闭：在途调用失败返回，通道按各自规则关闭
    pub async fn close(&self) {
        self.stop.cancel();
        let failed = self
            .pending
            .fail_all(&ProtocolError::SessionUnavailable(format!("{}: closed", self.name)));
        if failed > 0 {
            debug!(server = %self.name, failed, "pending calls failed on close");
        }
        self.transport.close().await;
    }

    /// 同步强制关闭
    pub fn abort(&self) {
        self.stop.cancel();
        self.pending
            .fail_all(&ProtocolError::SessionUnavailable(format!("{}: aborted", self.name)));
        self.transport.abort();
    }
}

impl Drop for RpcPeer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// 调用方在响应前放弃时释放槽位，并尽力通知 Provider
struct CallGuard<'a> {
    peer: &'a RpcPeer,
    id: u64,
    armed: bool,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.peer.pending.remove(self.id).is_some() {
            debug!(server = %self.peer.name, id = self.id, "request abandoned");
            send_cancelled(self.peer.transport.clone(), self.id, "cancelled");
        }
    }
}

fn send_cancelled(transport: Arc<Transport>, id: u64, reason: &'static str) {
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    handle.spawn(async move {
        let msg = notification(
            "notifications/cancelled",
            Some(json!({ "requestId": id, "reason": reason })),
        );
        let _ = tokio::time::timeout(Duration::from_secs(1), transport.send(&msg)).await;
    });
}

async fn dispatch(
    name: String,
    transport: Arc<Transport>,
    pending: Arc<PendingCalls>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    signals: mpsc::UnboundedSender<PeerSignal>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => return,
            event = events.recv() => event,
        };
        let text = match event {
            Some(TransportEvent::Message(text)) => text,
            Some(TransportEvent::Closed(reason)) => {
                finish(&name, &pending, &signals, reason);
                return;
            }
            None => {
                finish(&name, &pending, &signals, "transport dropped".to_string());
                return;
            }
        };
        let items = match parse_inbound(&text) {
            Ok(items) => items,
            Err(e) => {
                warn!(server = %name, error = %e, "dropping unparseable message");
                continue;
            }
        };
        for item in items {
            match item {
                Inbound::Response { id, result } => {
                    if !pending.complete(id, result.map_err(ProtocolError::from)) {
                        debug!(server = %name, id, "late or unknown response ignored");
                    }
                }
                Inbound::Request { id, method, .. } => {
                    let reply = match method.as_str() {
                        "ping" => Ok(json!({})),
                        other => Err(RpcError {
                            code: METHOD_NOT_FOUND,
                            message: format!("method not supported: {other}"),
                            data: None,
                        }),
                    };
                    let transport = transport.clone();
                    tokio::spawn(async move {
                        let _ = transport.send(&response_to(id, reply)).await;
                    });
                }
                Inbound::Notification { method, params } => match method.as_str() {
                    "notifications/tools/list_changed" | "notifications/resources/list_changed" => {
                        info!(server = %name, %method, "provider catalog changed");
                        let _ = signals.send(PeerSignal::ListChanged);
                    }
                    "notifications/message" => {
                        debug!(server = %name, params = ?params, "provider log");
                    }
                    other => debug!(server = %name, method = %other, "notification ignored"),
                },
            }
        }
    }
}

fn finish(
    name: &str,
    pending: &PendingCalls,
    signals: &mpsc::UnboundedSender<PeerSignal>,
    reason: String,
) {
    let failed = pending.fail_all(&ProtocolError::SessionUnavailable(format!(
        "{name}: {reason}"
    )));
    warn!(server = %name, reason = %reason, failed, "provider connection lost");
    let _ = signals.send(PeerSignal::Closed(reason));
}
