//! PendingCall 表与截止时间看门狗
//!
//! 每个出站请求在写出前登记 {关联 id, 目标能力, 负载, 截止时间, 完成槽}；
//! 响应到达、看门狗超时、会话关闭、调用方放弃，四条路径都会把槽位移出表。
//! 锁只在同步临界区内持有（Drop 路径也要能用），不跨 await。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::ProtocolError;

pub type CallResult = Result<Value, ProtocolError>;

/// 一次在途调用
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    /// 限定能力名或协议方法名，用于超时错误与日志
    pub target: String,
    pub payload: Value,
    pub issued_at: Instant,
    pub deadline: Instant,
    slot: oneshot::Sender<CallResult>,
}

impl PendingCall {
    pub fn new(
        id: u64,
        target: impl Into<String>,
        payload: Value,
        timeout: Duration,
    ) -> (Self, oneshot::Receiver<CallResult>) {
        let (slot, rx) = oneshot::channel();
        let issued_at = Instant::now();
        let call = Self {
            id,
            target: target.into(),
            payload,
            issued_at,
            deadline: issued_at + timeout,
            slot,
        };
        (call, rx)
    }

    fn resolve(self, result: CallResult) {
        let _ = self.slot.send(result);
    }

    fn timeout_error(&self) -> ProtocolError {
        ProtocolError::InvokeTimeout {
            target: self.target.clone(),
            timeout: self.deadline.saturating_duration_since(self.issued_at),
        }
    }
}

/// 关联 id → PendingCall
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<u64, PendingCall>>,
    /// 新登记时唤醒看门狗重新计算最近截止时间
    changed: Notify,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, call: PendingCall) {
        self.lock().insert(call.id, call);
        self.changed.notify_one();
    }

    /// 用响应完成调用；id 不在表中（已超时 / 已放弃）返回 false
    pub fn complete(&self, id: u64, result: CallResult) -> bool {
        let call = self.lock().remove(&id);
        match call {
            Some(call) => {
                call.resolve(result);
                true
            }
            None => false,
        }
    }

    /// 调用方放弃：移出但不回填
    pub fn remove(&self, id: u64) -> Option<PendingCall> {
        self.lock().remove(&id)
    }

    /// 会话关闭：所有在途调用以同一错误失败
    pub fn fail_all(&self, err: &ProtocolError) -> usize {
        let drained: Vec<PendingCall> = self.lock().drain().map(|(_, c)| c).collect();
        let n = drained.len();
        for call in drained {
            call.resolve(Err(err.clone()));
        }
        n
    }

    /// 回填所有已过期调用为超时错误，返回过期 id
    pub fn expire(&self, now: Instant) -> Vec<u64> {
        let expired: Vec<PendingCall> = {
            let mut calls = self.lock();
            let ids: Vec<u64> = calls
                .values()
                .filter(|c| c.deadline <= now)
                .map(|c| c.id)
                .collect();
            ids.iter().filter_map(|id| calls.remove(id)).collect()
        };
        let ids = expired.iter().map(|c| c.id).collect();
        for call in expired {
            let err = call.timeout_error();
            tracing::debug!(id = call.id, target = %call.target, "pending call expired");
            call.resolve(Err(err));
        }
        ids
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().values().map(|c| c.deadline).min()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 空闲时看门狗的最长休眠
const WATCHDOG_IDLE: Duration = Duration::from_secs(3600);

/// 看门狗：睡到最近截止时间，回填过期调用；新登记会提前唤醒。
/// `on_expired` 收到过期 id，用于向 Provider 发送取消通知。
pub async fn run_watchdog<F>(pending: Arc<PendingCalls>, stop: CancellationToken, on_expired: F)
where
    F: Fn(Vec<u64>) + Send,
{
    loop {
        let wake_at = pending
            .next_deadline()
            .unwrap_or_else(|| Instant::now() + WATCHDOG_IDLE);
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = pending.changed.notified() => continue,
            _ = tokio::time::sleep_until(wake_at) => {
                let expired = pending.expire(Instant::now());
                if !expired.is_empty() {
                    on_expired(expired);
                }
            }
        }
    }
}
