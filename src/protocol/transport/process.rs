//! 本地进程传输：启动配置的可执行文件，经 stdin/stdout 交换按行分隔的 JSON-RPC
//!
//! Close：关闭 stdin 作为终止信号 → 等待宽限期 → 强杀并回收。
//! 子进程句柄放在 ChildGuard 里，Drop 时强杀（配合 kill_on_drop），
//! 因此即使 close 从未被调用或在中途被取消，也不会遗留子进程。

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{connection_error, preview, ConnectOptions, EventSender, TransportEvent};
use crate::core::ProtocolError;

/// 子进程监护：Drop 即强杀
#[derive(Debug)]
struct ChildGuard {
    child: Mutex<Option<Child>>,
}

impl ChildGuard {
    fn take(&self) -> Option<Child> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    fn kill_now(&self) {
        if let Some(child) = self
            .child
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            let _ = child.start_kill();
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        let slot = self.child.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(child) = slot.as_mut() {
            let _ = child.start_kill();
        }
    }
}

pub struct ProcessTransport {
    provider: String,
    pid: Option<u32>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    child: Arc<ChildGuard>,
    close_grace: Duration,
    reader: JoinHandle<()>,
    stderr: JoinHandle<()>,
}

impl ProcessTransport {
    pub fn spawn(opts: &ConnectOptions, events: EventSender) -> Result<Self, ProtocolError> {
        let provider = opts.provider.as_str();
        let program = opts
            .entry
            .command
            .as_deref()
            .ok_or_else(|| connection_error(provider, "no command configured"))?;

        let mut cmd = Command::new(program);
        cmd.args(&opts.entry.args)
            .envs(&opts.entry.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &opts.entry.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| connection_error(provider, format!("failed to spawn '{program}': {e}")))?;
        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| connection_error(provider, "no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| connection_error(provider, "no stdout"))?;
        let stderr = child.stderr.take();
        info!(server = %provider, program = %program, pid = ?pid, "provider process spawned");

        let name = provider.to_string();
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let reason = loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => {
                        debug!(server = %name, "← {}", preview(&line));
                        if events.send(TransportEvent::Message(line)).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break "stdout closed".to_string(),
                    Err(e) => break format!("stdout read error: {e}"),
                }
            };
            let _ = events.send(TransportEvent::Closed(reason));
        });

        let name = provider.to_string();
        let stderr = tokio::spawn(async move {
            let Some(stderr) = stderr else { return };
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(server = %name, stderr = %line, "provider stderr");
            }
        });

        Ok(Self {
            provider: provider.to_string(),
            pid,
            stdin: tokio::sync::Mutex::new(Some(stdin)),
            child: Arc::new(ChildGuard {
                child: Mutex::new(Some(child)),
            }),
            close_grace: opts.close_grace,
            reader,
            stderr,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub async fn send(&self, message: &Value) -> Result<(), ProtocolError> {
        let mut line = serde_json::to_string(message)
            .map_err(|e| ProtocolError::Codec(format!("serialize error: {e}")))?;
        line.push('\n');
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| ProtocolError::SessionUnavailable(format!("{}: stdin closed", self.provider)))?;
        debug!(server = %self.provider, "→ {}", preview(&line));
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| connection_error(&self.provider, format!("write error: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| connection_error(&self.provider, format!("flush error: {e}")))
    }

    pub async fn close(&self) {
        // stdin EOF 是约定的终止信号
        drop(self.stdin.lock().await.take());
        let Some(mut child) = self.child.take() else {
            return;
        };
        match tokio::time::timeout(self.close_grace, child.wait()).await {
            Ok(status) => {
                debug!(server = %self.provider, status = ?status.ok(), "provider process exited");
            }
            Err(_) => {
                warn!(
                    server = %self.provider,
                    grace_ms = self.close_grace.as_millis() as u64,
                    "provider process ignored termination, killing"
                );
                if let Err(e) = child.kill().await {
                    warn!(server = %self.provider, error = %e, "kill failed");
                }
            }
        }
        self.reader.abort();
        self.stderr.abort();
    }

    pub fn abort(&self) {
        self.child.kill_now();
        self.reader.abort();
        self.stderr.abort();
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.reader.abort();
        self.stderr.abort();
    }
}
