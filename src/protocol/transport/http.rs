//! Streamed-HTTP 传输：长连接 SSE 事件流承载入站消息，出站请求单独 POST
//!
//! - GET `Accept: text/event-stream`；若首个 `endpoint` 事件给出 POST 地址则使用之（相对地址按流 URL 解析），
//!   否则 POST 到配置 URL。GET 返回 405 时退化为纯 POST 模式（响应在 POST 的响应体里）。
//! - POST 响应为 application/json 或 text/event-stream 时，其中的消息按「来自流」处理；202/204 表示稍后经流返回。
//! - 服务端下发的 `Mcp-Session-Id` 在后续请求中回带。

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{connection_error, ConnectOptions, EventSender, TransportEvent};
use crate::core::ProtocolError;

const SESSION_HEADER: &str = "mcp-session-id";
/// 等待 `endpoint` 事件的上限；超过则直接 POST 到流 URL
const ENDPOINT_WAIT: Duration = Duration::from_secs(2);

/// 一个 SSE 事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// 未声明 event: 时为 "message"
    pub event: String,
    pub data: String,
}

/// 增量 SSE 解析器：喂入任意切分的字节块，吐出完整事件。
/// 只解码完整的行，跨块切开的多字节字符留到下一块再拼
#[derive(Debug, Default)]
pub struct SseParser {
    partial_line: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.partial_line.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some(pos) = self.partial_line.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial_line.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..pos]);
            if let Some(ev) = self.feed_line(line.trim_end_matches('\r')) {
                out.push(ev);
            }
        }
        out
    }

    /// 流结束时冲刷最后一个未以空行结尾的事件
    pub fn finish(&mut self) -> Option<SseEvent> {
        let raw = std::mem::take(&mut self.partial_line);
        let rest = String::from_utf8_lossy(&raw);
        let rest = rest.trim_end_matches('\r');
        if !rest.is_empty() {
            if let Some(ev) = self.feed_line(rest) {
                return Some(ev);
            }
        }
        self.dispatch()
    }

    fn feed_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = match line.split_once(':') {
            Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

pub struct HttpTransport {
    provider: String,
    client: reqwest::Client,
    post_url: Url,
    headers: HeaderMap,
    session_id: Mutex<Option<String>>,
    events: EventSender,
    stream_task: Option<JoinHandle<()>>,
}

impl HttpTransport {
    pub async fn connect(opts: &ConnectOptions, events: EventSender) -> Result<Self, ProtocolError> {
        let provider = opts.provider.as_str();
        let url = opts
            .entry
            .url
            .as_deref()
            .ok_or_else(|| connection_error(provider, "no url configured"))?;
        let stream_url = Url::parse(url).map_err(|e| connection_error(provider, e))?;
        let headers = header_map(provider, &opts.entry.headers)?;
        let client = reqwest::Client::builder()
            .connect_timeout(opts.connect_timeout)
            .build()
            .map_err(|e| connection_error(provider, e))?;

        info!(server = %provider, url = %stream_url, "event stream connecting");
        let response = client
            .get(stream_url.clone())
            .headers(headers.clone())
            .header(ACCEPT, "text/event-stream")
            .header("Cache-Control", "no-cache")
            .send()
            .await
            .map_err(|e| connection_error(provider, e))?;

        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            info!(server = %provider, "server has no event stream, using POST-only mode");
            return Ok(Self {
                provider: provider.to_string(),
                client,
                post_url: stream_url,
                headers,
                session_id: Mutex::new(None),
                events,
                stream_task: None,
            });
        }
        if !response.status().is_success() {
            return Err(connection_error(
                provider,
                format!("event stream HTTP {}", response.status()),
            ));
        }
        let session_id = session_header(response.headers());

        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let stream_task = tokio::spawn(read_stream(
            provider.to_string(),
            response,
            events.clone(),
            endpoint_tx,
        ));

        let post_url = match tokio::time::timeout(ENDPOINT_WAIT, endpoint_rx).await {
            Ok(Ok(endpoint)) => stream_url
                .join(endpoint.trim())
                .map_err(|e| connection_error(provider, format!("bad endpoint event: {e}")))?,
            _ => stream_url.clone(),
        };
        info!(server = %provider, post_url = %post_url, "event stream connected");

        Ok(Self {
            provider: provider.to_string(),
            client,
            post_url,
            headers,
            session_id: Mutex::new(session_id),
            events,
            stream_task: Some(stream_task),
        })
    }

    pub async fn send(&self, message: &Value) -> Result<(), ProtocolError> {
        let mut req = self
            .client
            .post(self.post_url.clone())
            .headers(self.headers.clone())
            .header(ACCEPT, "application/json, text/event-stream")
            .json(message);
        if let Some(id) = self.current_session_id() {
            req = req.header(SESSION_HEADER, id);
        }
        let response = req
            .send()
            .await
            .map_err(|e| connection_error(&self.provider, e))?;

        if let Some(id) = session_header(response.headers()) {
            *self.session_id.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        }
        let status = response.status();
        if status == StatusCode::ACCEPTED || status == StatusCode::NO_CONTENT {
            return Ok(());
        }
        if !status.is_success() {
            return Err(connection_error(&self.provider, format!("POST HTTP {status}")));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        let body = response
            .text()
            .await
            .map_err(|e| connection_error(&self.provider, e))?;
        if body.trim().is_empty() {
            return Ok(());
        }
        if content_type.starts_with("text/event-stream") {
            let mut parser = SseParser::new();
            let mut events = parser.push(body.as_bytes());
            events.extend(parser.finish());
            for ev in events.into_iter().filter(|e| e.event == "message") {
                let _ = self.events.send(TransportEvent::Message(ev.data));
            }
        } else {
            let _ = self.events.send(TransportEvent::Message(body));
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.abort();
        if let Some(id) = self.current_session_id() {
            let req = self
                .client
                .delete(self.post_url.clone())
                .headers(self.headers.clone())
                .header(SESSION_HEADER, id)
                .timeout(Duration::from_secs(1));
            if let Err(e) = req.send().await {
                debug!(server = %self.provider, error = %e, "session delete failed");
            }
        }
    }

    pub fn abort(&self) {
        if let Some(task) = &self.stream_task {
            task.abort();
        }
    }

    fn current_session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn read_stream(
    provider: String,
    mut response: reqwest::Response,
    events: EventSender,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut parser = SseParser::new();
    let reason = loop {
        match response.chunk().await {
            Ok(Some(bytes)) => {
                for ev in parser.push(&bytes) {
                    match ev.event.as_str() {
                        "endpoint" => {
                            if let Some(tx) = endpoint_tx.take() {
                                let _ = tx.send(ev.data);
                            }
                        }
                        "message" => {
                            if events.send(TransportEvent::Message(ev.data)).is_err() {
                                return;
                            }
                        }
                        other => debug!(server = %provider, event = %other, "ignored SSE event"),
                    }
                }
            }
            Ok(None) => break "event stream ended".to_string(),
            Err(e) => {
                warn!(server = %provider, error = %e, "event stream error");
                break format!("event stream error: {e}");
            }
        }
    };
    let _ = events.send(TransportEvent::Closed(reason));
}

fn header_map(provider: &str, headers: &HashMap<String, String>) -> Result<HeaderMap, ProtocolError> {
    let mut map = HeaderMap::new();
    for (k, v) in headers {
        let name = HeaderName::from_bytes(k.as_bytes())
            .map_err(|e| connection_error(provider, format!("bad header '{k}': {e}")))?;
        let value = HeaderValue::from_str(v)
            .map_err(|e| connection_error(provider, format!("bad header value for '{k}': {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

fn session_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
