//! Socket 传输：WebSocket 全双工长连接，每帧一条 JSON-RPC 文本
//!
//! 心跳：每个 interval 发一次 Ping；任何入站帧（含 Pong）都刷新最近活跃时间，
//! 静默超过两个 interval 判定对端已死，上报 Closed 由会话走重连流程。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, StreamExt};
use futures_util::SinkExt;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{connection_error, preview, ConnectOptions, EventSender, TransportEvent};
use crate::core::ProtocolError;

const MIN_HEARTBEAT: Duration = Duration::from_millis(100);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// 最近一次收到入站帧的时间（相对连接建立时刻的毫秒数）
struct Liveness {
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl Liveness {
    fn touch(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_seen_ms.store(ms, Ordering::Relaxed);
    }

    fn silent_for(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_seen_ms.load(Ordering::Relaxed)))
    }
}

pub struct SocketTransport {
    provider: String,
    writer: Arc<Mutex<WsSink>>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl SocketTransport {
    pub async fn connect(opts: &ConnectOptions, events: EventSender) -> Result<Self, ProtocolError> {
        let provider = opts.provider.as_str();
        let url = opts
            .entry
            .url
            .as_deref()
            .ok_or_else(|| connection_error(provider, "no url configured"))?;
        let mut request = url
            .into_client_request()
            .map_err(|e| connection_error(provider, format!("invalid url: {e}")))?;
        for (k, v) in &opts.entry.headers {
            let name = HeaderName::from_bytes(k.as_bytes())
                .map_err(|e| connection_error(provider, format!("bad header '{k}': {e}")))?;
            let value = HeaderValue::from_str(v)
                .map_err(|e| connection_error(provider, format!("bad header value for '{k}': {e}")))?;
            request.headers_mut().insert(name, value);
        }

        info!(server = %provider, url = %url, "socket connecting");
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| connection_error(provider, e))?;
        info!(server = %provider, "socket connected");

        let (write, mut read) = stream.split();
        let writer = Arc::new(Mutex::new(write));
        let liveness = Arc::new(Liveness {
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        });

        let name = provider.to_string();
        let reader_events = events.clone();
        let reader_liveness = liveness.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(msg)) => {
                        reader_liveness.touch();
                        match msg {
                            WsMessage::Text(text) => {
                                debug!(server = %name, "← {}", preview(&text));
                                if reader_events.send(TransportEvent::Message(text)).is_err() {
                                    return;
                                }
                            }
                            WsMessage::Binary(data) => {
                                if let Ok(text) = String::from_utf8(data) {
                                    if reader_events.send(TransportEvent::Message(text)).is_err() {
                                        return;
                                    }
                                }
                            }
                            WsMessage::Close(_) => break "socket closed by server".to_string(),
                            _ => {}
                        }
                    }
                    Some(Err(e)) => break format!("socket error: {e}"),
                    None => break "socket stream ended".to_string(),
                }
            };
            let _ = reader_events.send(TransportEvent::Closed(reason));
        });

        let name = provider.to_string();
        let hb_writer = writer.clone();
        // interval(0) 会 panic
        let interval = opts.heartbeat_interval.max(MIN_HEARTBEAT);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let silent = liveness.silent_for();
                if silent > interval * 2 {
                    warn!(server = %name, silent_ms = silent.as_millis() as u64, "peer missed heartbeats");
                    let _ = events.send(TransportEvent::Closed("heartbeat timeout".to_string()));
                    break;
                }
                let sent = tokio::time::timeout(interval, async {
                    hb_writer.lock().await.send(WsMessage::Ping(Vec::new())).await
                })
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    let _ = events.send(TransportEvent::Closed("heartbeat send failed".to_string()));
                    break;
                }
            }
        });

        Ok(Self {
            provider: provider.to_string(),
            writer,
            reader,
            heartbeat,
        })
    }

    pub async fn send(&self, message: &Value) -> Result<(), ProtocolError> {
        let text = serde_json::to_string(message)
            .map_err(|e| ProtocolError::Codec(format!("serialize error: {e}")))?;
        debug!(server = %self.provider, "→ {}", preview(&text));
        self.writer
            .lock()
            .await
            .send(WsMessage::Text(text))
            .await
            .map_err(|e| connection_error(&self.provider, format!("send error: {e}")))
    }

    pub async fn close(&self) {
        self.heartbeat.abort();
        let closing = async {
            let mut writer = self.writer.lock().await;
            let _ = writer.send(WsMessage::Close(None)).await;
            let _ = writer.close().await;
        };
        if tokio::time::timeout(Duration::from_secs(1), closing).await.is_err() {
            debug!(server = %self.provider, "socket close handshake timed out");
        }
        self.reader.abort();
    }

    pub fn abort(&self) {
        self.heartbeat.abort();
        self.reader.abort();
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        self.abort();
    }
}
