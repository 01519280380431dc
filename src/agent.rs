//! Run 级入口
//!
//! Agent 持有显式构建、显式关闭的能力注册表（含 ProtocolClient），
//! 每次 `run` 按 model_name 选择推理后端并驱动一次执行引擎。多个 Run 可并发共享同一个 Agent。

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::core::{AgentError, TaskScheduler};
use crate::llm::{ConfiguredModels, ModelFactory};
use crate::memory::{InMemoryMemoryStore, MemoryStore};
use crate::protocol::{InitReport, ProtocolClient};
use crate::react::{Engine, EngineEvent, RunOptions, RunStatus, Step, Task};
use crate::tools::{CapabilityRegistry, ToolRegistry};

/// 请求层看到的 Run 结果
#[derive(Debug, Clone, Serialize)]
pub struct RunResponse {
    pub final_answer: String,
    pub steps: Vec<Step>,
    pub status: RunStatus,
    pub execution_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Agent {
    registry: Arc<CapabilityRegistry>,
    models: Arc<dyn ModelFactory>,
    memory: Arc<dyn MemoryStore>,
    scheduler: TaskScheduler,
    llm_timeout: Duration,
    defaults: RunOptions,
    event_tx: Option<UnboundedSender<EngineEvent>>,
}

impl Agent {
    pub fn new(registry: Arc<CapabilityRegistry>, models: Arc<dyn ModelFactory>) -> Self {
        Self {
            registry,
            models,
            memory: Arc::new(InMemoryMemoryStore::default()),
            scheduler: TaskScheduler::default(),
            llm_timeout: Duration::from_secs(60),
            defaults: RunOptions::default(),
            event_tx: None,
        }
    }

    /// 按配置连接所有 Provider 并组装 Agent。
    /// 单个 Provider 不可用不影响其它；全部配置非法时仍返回 Agent，但之后的 Run 以 failed 结束。
    pub async fn connect(cfg: &AppConfig) -> (Self, InitReport) {
        let client = ProtocolClient::new(cfg.protocol.clone());
        let report = match client.initialize(&cfg.providers).await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "no usable capability provider");
                InitReport::default()
            }
        };
        let registry = Arc::new(CapabilityRegistry::new(ToolRegistry::with_builtins(), client));
        let agent = Self::new(registry, Arc::new(ConfiguredModels::new(cfg.llm.clone())))
            .with_scheduler(TaskScheduler::new(cfg.engine.max_concurrent_actions))
            .with_llm_timeout(Duration::from_secs(cfg.llm.request_timeout_secs.max(1)))
            .with_defaults(RunOptions::from(&cfg.engine));
        (agent, report)
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_defaults(mut self, defaults: RunOptions) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn defaults(&self) -> &RunOptions {
        &self.defaults
    }

    /// 执行一次任务；`options` 为 None 时使用配置的默认值。只有非法选项返回 Err
    pub async fn run(
        &self,
        user_id: &str,
        prompt: &str,
        model_name: Option<&str>,
        options: Option<RunOptions>,
        cancel: CancellationToken,
    ) -> Result<RunResponse, AgentError> {
        let options = options.unwrap_or_else(|| self.defaults.clone());
        options.validate()?;
        let started = Instant::now();

        let llm = match self.models.client_for(model_name) {
            Ok(llm) => llm,
            Err(e) => {
                warn!(model = ?model_name, error = %e, "no reasoning backend for model");
                return Ok(RunResponse {
                    final_answer: String::new(),
                    steps: Vec::new(),
                    status: RunStatus::Failed,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    error: Some(e),
                });
            }
        };

        let mut engine = Engine::new(llm, self.registry.clone())
            .with_memory(self.memory.clone())
            .with_scheduler(self.scheduler.clone())
            .with_llm_timeout(self.llm_timeout);
        if let Some(tx) = &self.event_tx {
            engine = engine.with_events(tx.clone());
        }

        let outcome = engine.run(&Task::new(user_id, prompt), &options, cancel).await?;
        let execution_time_ms = started.elapsed().as_millis() as u64;
        info!(
            user = %user_id,
            status = outcome.status.as_str(),
            execution_time_ms,
            "run complete"
        );
        Ok(RunResponse {
            final_answer: outcome.final_answer,
            steps: outcome.trace,
            status: outcome.status,
            execution_time_ms,
            error: outcome.error,
        })
    }

    /// 关闭所有 Provider 会话
    pub async fn shutdown(&self) {
        self.registry.client().shutdown().await;
    }
}
