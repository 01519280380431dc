//! 集成测试用的假 Provider：WebSocket（tokio-tungstenite）或 Streamed-HTTP（axum SSE）上的 JSON-RPC 服务端
//!
//! 工具行为按名称固定：
//! - `hang`：永不回复
//! - `fail`：返回 isError
//! - `slow`：300ms 后回复
//! - 其它：回复 `<name>: <arguments>` 文本

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use bee_engine::config::{ProtocolSection, ProviderEntry, TransportKind};
use futures_util::{stream, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::tungstenite::Message;

/// tools/list 每页条数（超过时分页）
const PAGE_SIZE: usize = 2;

struct ServerState {
    tools: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<Value>>,
    calls: Mutex<Vec<String>>,
    connections: AtomicUsize,
    mute: AtomicBool,
    /// 冻结时不再读 socket（连 Pong 也不回）
    frozen: AtomicBool,
    push: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

impl ServerState {
    fn new(tools: &[&str]) -> Arc<Self> {
        let (push, _) = broadcast::channel(16);
        let (kick, _) = broadcast::channel(4);
        Arc::new(Self {
            tools: Mutex::new(tools.iter().map(|t| t.to_string()).collect()),
            cancelled: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            connections: AtomicUsize::new(0),
            mute: AtomicBool::new(false),
            frozen: AtomicBool::new(false),
            push,
            kick,
        })
    }
}

pub struct FakeServer {
    url: String,
    transport: TransportKind,
    state: Arc<ServerState>,
    accept: tokio::task::JoinHandle<()>,
}

impl FakeServer {
    pub async fn start(tools: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = ServerState::new(tools);
        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        state.connections.fetch_add(1, Ordering::SeqCst);
                        serve(ws, state).await;
                    }
                });
            }
        });
        Self {
            url: format!("ws://{addr}"),
            transport: TransportKind::Socket,
            state,
            accept,
        }
    }

    /// 旧式 SSE 传输：GET /sse 先下发 `endpoint` 事件，POST /messages 回 202，响应走事件流
    pub async fn start_http(tools: &[&str]) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = ServerState::new(tools);
        let app = Router::new()
            .route("/sse", get(sse_stream))
            .route("/messages", post(post_message))
            .with_state(HttpState {
                server: state.clone(),
                stream_tx: Arc::new(Mutex::new(None)),
            });
        let accept = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            url: format!("http://{addr}/sse"),
            transport: TransportKind::Http,
            state,
            accept,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn entry(&self) -> ProviderEntry {
        ProviderEntry::remote(self.transport, self.url.clone())
    }

    pub fn set_tools(&self, tools: &[&str]) {
        *self.state.tools.lock().unwrap() = tools.iter().map(|t| t.to_string()).collect();
    }

    /// 向所有连接推送 notifications/tools/list_changed
    pub fn notify_list_changed(&self) {
        let frame = json!({ "jsonrpc": "2.0", "method": "notifications/tools/list_changed" });
        let _ = self.state.push.send(frame.to_string());
    }

    /// 不再回复任何请求
    pub fn set_mute(&self, mute: bool) {
        self.state.mute.store(mute, Ordering::SeqCst);
    }

    /// 停止读取所有 WebSocket 连接，对端看起来像静默死亡
    pub fn set_frozen(&self, frozen: bool) {
        self.state.frozen.store(frozen, Ordering::SeqCst);
    }

    /// 断开当前所有 WebSocket 连接（监听继续，允许重连）
    pub fn drop_connections(&self) {
        let _ = self.state.kick.send(());
    }

    /// 收到的 notifications/cancelled 的 requestId
    pub fn cancelled(&self) -> Vec<Value> {
        self.state.cancelled.lock().unwrap().clone()
    }

    /// 收到的 tools/call 的工具名
    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.accept.abort();
    }
}

async fn serve(ws: tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>, state: Arc<ServerState>) {
    let (mut sink, mut stream) = ws.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let mut push_rx = state.push.subscribe();

    let writer = tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                f = out_rx.recv() => match f {
                    Some(f) => f,
                    None => break,
                },
                p = push_rx.recv() => match p {
                    Ok(p) => p,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(_) => break,
                },
            };
            if sink.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let mut kick_rx = state.kick.subscribe();
    loop {
        while state.frozen.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let next = tokio::select! {
            _ = kick_rx.recv() => break,
            m = stream.next() => m,
        };
        let Some(Ok(msg)) = next else {
            break;
        };
        let Message::Text(text) = msg else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        handle(&state, value, &out_tx);
    }
    writer.abort();
}

#[derive(Clone)]
struct HttpState {
    server: Arc<ServerState>,
    /// 当前事件流；POST 的响应经它下发
    stream_tx: Arc<Mutex<Option<mpsc::UnboundedSender<String>>>>,
}

async fn sse_stream(
    State(st): State<HttpState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    st.server.connections.fetch_add(1, Ordering::SeqCst);
    *st.stream_tx.lock().unwrap() = Some(tx);

    let endpoint = stream::once(async {
        Ok::<_, Infallible>(Event::default().event("endpoint").data("/messages"))
    });
    let messages = stream::unfold(rx, |mut rx| async move {
        let frame = rx.recv().await?;
        Some((Ok(Event::default().event("message").data(frame)), rx))
    });
    Sse::new(endpoint.chain(messages))
}

async fn post_message(State(st): State<HttpState>, Json(msg): Json<Value>) -> StatusCode {
    let tx = st.stream_tx.lock().unwrap().clone();
    match tx {
        Some(tx) => {
            handle(&st.server, msg, &tx);
            StatusCode::ACCEPTED
        }
        None => StatusCode::NOT_FOUND,
    }
}

fn handle(state: &Arc<ServerState>, msg: Value, out: &mpsc::UnboundedSender<String>) {
    let method = msg.get("method").and_then(Value::as_str).unwrap_or("");
    let params = msg.get("params").cloned().unwrap_or(Value::Null);
    let Some(id) = msg.get("id").cloned() else {
        if method == "notifications/cancelled" {
            let request_id = params.get("requestId").cloned().unwrap_or(Value::Null);
            state.cancelled.lock().unwrap().push(request_id);
        }
        return;
    };
    if state.mute.load(Ordering::SeqCst) {
        return;
    }

    let reply = |result: Value| {
        let _ = out.send(json!({ "jsonrpc": "2.0", "id": id, "result": result }).to_string());
    };

    match method {
        "initialize" => reply(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": { "tools": { "listChanged": true }, "resources": {} },
            "serverInfo": { "name": "fake", "version": "0.0.1" }
        })),
        "tools/list" => {
            let tools = state.tools.lock().unwrap().clone();
            let start: usize = params
                .get("cursor")
                .and_then(Value::as_str)
                .and_then(|c| c.parse().ok())
                .unwrap_or(0);
            let page: Vec<Value> = tools
                .iter()
                .skip(start)
                .take(PAGE_SIZE)
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("{name} tool"),
                        "inputSchema": {
                            "type": "object",
                            "properties": { "query": { "type": "string" } }
                        }
                    })
                })
                .collect();
            let mut result = json!({ "tools": page });
            if start + PAGE_SIZE < tools.len() {
                result["nextCursor"] = json!((start + PAGE_SIZE).to_string());
            }
            reply(result)
        }
        "resources/list" => reply(json!({
            "resources": [{ "uri": "mem://notes", "name": "notes", "mimeType": "text/plain" }]
        })),
        "resources/read" => reply(json!({
            "contents": [{ "uri": "mem://notes", "mimeType": "text/plain", "text": "remember the milk" }]
        })),
        "tools/call" => {
            let name = params.get("name").and_then(Value::as_str).unwrap_or("").to_string();
            let args = params.get("arguments").cloned().unwrap_or(Value::Null);
            state.calls.lock().unwrap().push(name.clone());
            match name.as_str() {
                "hang" => {}
                "fail" => reply(json!({
                    "content": [{ "type": "text", "text": "backend down" }],
                    "isError": true
                })),
                "slow" => {
                    let out = out.clone();
                    let id = id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        let _ = out.send(
                            json!({
                                "jsonrpc": "2.0",
                                "id": id,
                                "result": { "content": [{ "type": "text", "text": "slow done" }] }
                            })
                            .to_string(),
                        );
                    });
                }
                _ => reply(json!({
                    "content": [{ "type": "text", "text": format!("{name}: {args}") }]
                })),
            }
        }
        "ping" => reply(json!({})),
        _ => {
            let _ = out.send(
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": -32601, "message": "method not found" }
                })
                .to_string(),
            );
        }
    }
}

/// 测试用的快速协议参数
pub fn fast_settings() -> ProtocolSection {
    ProtocolSection {
        discovery_timeout_secs: 2,
        max_reconnect_attempts: 1,
        backoff_base_ms: 20,
        backoff_cap_ms: 50,
        heartbeat_interval_secs: 5,
        close_grace_ms: 200,
        shutdown_timeout_secs: 2,
    }
}

pub fn providers(entries: &[(&str, ProviderEntry)]) -> BTreeMap<String, ProviderEntry> {
    entries
        .iter()
        .map(|(name, entry)| (name.to_string(), entry.clone()))
        .collect()
}

/// 轮询直到条件成立或超时
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
