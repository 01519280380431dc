//! 物理通道：本地进程 / Streamed-HTTP / Socket
//!
//! 三种机制收敛为一个封闭接口 {send, close}，在会话建立时按配置选定变体。
//! 入站方向统一为 TransportEvent（原始文本消息或断开原因），由 RpcPeer 解析与分发。

pub mod http;
pub mod process;
pub mod socket;

use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::config::{ProtocolSection, ProviderEntry, TransportKind};
use crate::core::ProtocolError;

pub use http::{HttpTransport, SseEvent, SseParser};
pub use process::ProcessTransport;
pub use socket::SocketTransport;

/// 传输层上报的入站事件
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// 一条完整的 JSON-RPC 文本（一行 / 一个 SSE 事件 / 一个帧）
    Message(String),
    /// 通道已断开，不会再有消息
    Closed(String),
}

pub type EventSender = mpsc::UnboundedSender<TransportEvent>;

/// 建立通道所需的参数
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub provider: String,
    pub entry: ProviderEntry,
    pub heartbeat_interval: Duration,
    pub close_grace: Duration,
    /// 建连本身（spawn / GET / 握手）的上限
    pub connect_timeout: Duration,
}

impl ConnectOptions {
    pub fn new(provider: &str, entry: &ProviderEntry, settings: &ProtocolSection) -> Self {
        let connect_timeout = entry
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| settings.discovery_timeout());
        Self {
            provider: provider.to_string(),
            entry: entry.clone(),
            heartbeat_interval: settings.heartbeat_interval(),
            close_grace: settings.close_grace(),
            connect_timeout,
        }
    }
}

/// 一个已建立的通道
pub enum Transport {
    Process(ProcessTransport),
    StreamedHttp(HttpTransport),
    Socket(SocketTransport),
}

impl Transport {
    pub async fn connect(opts: &ConnectOptions, events: EventSender) -> Result<Self, ProtocolError> {
        let connecting = async {
            match opts.entry.transport {
                TransportKind::Process => ProcessTransport::spawn(opts, events).map(Transport::Process),
                TransportKind::Http => HttpTransport::connect(opts, events)
                    .await
                    .map(Transport::StreamedHttp),
                TransportKind::Socket => SocketTransport::connect(opts, events)
                    .await
                    .map(Transport::Socket),
            }
        };
        tokio::time::timeout(opts.connect_timeout, connecting)
            .await
            .map_err(|_| ProtocolError::ConnectionError {
                provider: opts.provider.clone(),
                reason: format!("connect timed out after {}s", opts.connect_timeout.as_secs()),
            })?
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Transport::Process(_) => TransportKind::Process,
            Transport::StreamedHttp(_) => TransportKind::Http,
            Transport::Socket(_) => TransportKind::Socket,
        }
    }

    /// 写出一条 JSON-RPC 消息（请求 / 通知 / 对服务端请求的响应）
    pub async fn send(&self, message: &Value) -> Result<(), ProtocolError> {
        match self {
            Transport::Process(t) => t.send(message).await,
            Transport::StreamedHttp(t) => t.send(message).await,
            Transport::Socket(t) => t.send(message).await,
        }
    }

    /// 有界优雅关闭；返回时不留下子进程 / 连接
    pub async fn close(&self) {
        match self {
            Transport::Process(t) => t.close().await,
            Transport::StreamedHttp(t) => t.close().await,
            Transport::Socket(t) => t.close().await,
        }
    }

    /// 同步强制终止（Shutdown 超时后的兜底）
    pub fn abort(&self) {
        match self {
            Transport::Process(t) => t.abort(),
            Transport::StreamedHttp(t) => t.abort(),
            Transport::Socket(t) => t.abort(),
        }
    }
}

pub(crate) fn connection_error(provider: &str, reason: impl std::fmt::Display) -> ProtocolError {
    ProtocolError::ConnectionError {
        provider: provider.to_string(),
        reason: reason.to_string(),
    }
}

/// 日志用：最多 200 个字符
pub(crate) fn preview(s: &str) -> &str {
    let end = s
        .char_indices()
        .nth(200)
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    s[..end].trim_end()
}
