//! 执行引擎：有界的 规划 → 执行 → 观察 → 反思 循环
//!
//! 每次请求决策都是一个挂起点（可被取消、受推理超时约束），状态转移只沿 StateMachine 的边进行。
//! 除非法选项外，Run 不向调用方抛错：所有故障都以 status 与 Trace 的形式返回。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineSection;
use crate::core::{
    AgentError, ExecutionState, RecoveryAction, RecoveryEngine, StateMachine, TaskScheduler,
};
use crate::llm::LlmClient;
use crate::memory::{ConversationMemory, MemoryStore, Message, NoopMemoryStore};
use crate::react::reflector::{apply_reflection, Reflection, ReflectionRecord};
use crate::react::{
    parse_decision, prompts, Decision, EngineEvent, Observation, Planner, Reflector, RunStatus,
    Step, StepAction, Subtask, ToolCall,
};
use crate::tools::{
    final_answer_schema_json, parallel_call_schema_json, tool_call_schema_json,
    CapabilityRegistry, ToolExecutor,
};

/// 每次 Run 检索的记忆条数
const MEMORY_FETCH_LIMIT: usize = 5;
/// 事件中观察预览的最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;
/// 思考内容展示最大字符数
const THINKING_PREVIEW_CHARS: usize = 800;

/// 一次 Run 的输入，创建后只读
#[derive(Clone, Debug, Serialize)]
pub struct Task {
    pub user_id: String,
    pub prompt: String,
}

impl Task {
    pub fn new(user_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            prompt: prompt.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub max_steps: usize,
    pub reflection_interval: usize,
    pub enable_memory: bool,
    pub enable_reflection: bool,
    pub tool_timeout: Duration,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::from(&EngineSection::default())
    }
}

impl From<&EngineSection> for RunOptions {
    fn from(cfg: &EngineSection) -> Self {
        Self {
            max_steps: cfg.max_steps,
            reflection_interval: cfg.reflection_interval,
            enable_memory: cfg.enable_memory,
            enable_reflection: cfg.enable_reflection,
            tool_timeout: Duration::from_secs(cfg.tool_timeout_secs),
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<(), AgentError> {
        if self.max_steps == 0 {
            return Err(AgentError::InvalidOptions("max_steps must be > 0".to_string()));
        }
        if self.reflection_interval == 0 {
            return Err(AgentError::InvalidOptions(
                "reflection_interval must be > 0".to_string(),
            ));
        }
        if self.tool_timeout.is_zero() {
            return Err(AgentError::InvalidOptions("tool_timeout must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Run 的结果：最终答案、状态与完整 Trace
#[derive(Clone, Debug, Serialize)]
pub struct RunOutcome {
    pub final_answer: String,
    pub status: RunStatus,
    pub trace: Vec<Step>,
    /// 反思记录（不计入 Trace）
    pub reflections: Vec<ReflectionRecord>,
    pub subtasks: Vec<Subtask>,
    /// 经过的执行状态
    pub states: Vec<ExecutionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct Engine {
    llm: Arc<dyn LlmClient>,
    registry: Arc<CapabilityRegistry>,
    memory: Arc<dyn MemoryStore>,
    scheduler: TaskScheduler,
    recovery: RecoveryEngine,
    llm_timeout: Duration,
    event_tx: Option<UnboundedSender<EngineEvent>>,
}

impl Engine {
    pub fn new(llm: Arc<dyn LlmClient>, registry: Arc<CapabilityRegistry>) -> Self {
        Self {
            llm,
            registry,
            memory: Arc::new(NoopMemoryStore),
            scheduler: TaskScheduler::default(),
            recovery: RecoveryEngine::new(),
            llm_timeout: Duration::from_secs(60),
            event_tx: None,
        }
    }

    pub fn with_memory(mut self, memory: Arc<dyn MemoryStore>) -> Self {
        self.memory = memory;
        self
    }

    /// 多个 Run 共享同一个调度器时，并发动作总数受同一信号量约束
    pub fn with_scheduler(mut self, scheduler: TaskScheduler) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_llm_timeout(mut self, timeout: Duration) -> Self {
        self.llm_timeout = timeout;
        self
    }

    pub fn with_events(mut self, tx: UnboundedSender<EngineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 执行一个任务；只有非法选项会返回 Err
    pub async fn run(
        &self,
        task: &Task,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, AgentError> {
        options.validate()?;
        info!(user = %task.user_id, max_steps = options.max_steps, "run started");

        let mut run = RunState {
            engine: self,
            task,
            options,
            cancel,
            machine: StateMachine::new(),
            trace: Vec::new(),
            reflections: Vec::new(),
            subtasks: Vec::new(),
            dialogue: ConversationMemory::new(options.max_steps + 2),
            memories: Vec::new(),
            executor: ToolExecutor::new(self.registry.clone(), options.tool_timeout),
            executed_steps: 0,
            status: RunStatus::Failed,
            final_answer: String::new(),
            error: None,
        };

        if let Err(e) = run.drive().await {
            warn!(error = %e, "run aborted");
            run.fail(e.to_string());
        }

        info!(
            status = run.status.as_str(),
            steps = run.trace.len(),
            reflections = run.reflections.len(),
            "run finished"
        );
        run.emit(EngineEvent::Final {
            status: run.status,
            answer: run.final_answer.clone(),
        });
        Ok(run.into_outcome())
    }

    fn emit(&self, ev: EngineEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(ev);
        }
    }

    /// 推理调用：受取消信号与推理超时约束
    async fn guarded<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AgentError::Cancelled),
            r = tokio::time::timeout(self.llm_timeout, fut) => r.unwrap_or_else(|_| {
                Err(AgentError::LlmError(format!(
                    "reasoning backend timed out after {}ms",
                    self.llm_timeout.as_millis()
                )))
            }),
        }
    }

    async fn ask(&self, messages: &[Message], cancel: &CancellationToken) -> Result<String, AgentError> {
        self.guarded(cancel, async {
            self.llm.complete(messages).await.map_err(AgentError::LlmError)
        })
        .await
    }
}

/// 一次 Run 的可变状态；只在 Engine::run 内部存在
struct RunState<'a> {
    engine: &'a Engine,
    task: &'a Task,
    options: &'a RunOptions,
    cancel: CancellationToken,
    machine: StateMachine,
    trace: Vec<Step>,
    reflections: Vec<ReflectionRecord>,
    subtasks: Vec<Subtask>,
    /// 决策对话：assistant 决策 + user 观察
    dialogue: ConversationMemory,
    memories: Vec<String>,
    executor: ToolExecutor,
    /// 已执行（进入 OBSERVING）的步数
    executed_steps: usize,
    status: RunStatus,
    final_answer: String,
    error: Option<String>,
}

impl RunState<'_> {
    fn emit(&self, ev: EngineEvent) {
        self.engine.emit(ev);
    }

    fn transition(&mut self, next: ExecutionState) -> Result<(), AgentError> {
        let from = self.machine.current();
        self.machine.transition(next)?;
        self.emit(EngineEvent::StateChanged { from, to: next });
        Ok(())
    }

    /// Err 只代表非法转移等内部故障，由 run 统一记为 failed
    async fn drive(&mut self) -> Result<(), AgentError> {
        self.transition(ExecutionState::Planning)?;

        if let Some(e) = self.engine.registry.fatal_config_error() {
            self.fail(e.to_string());
            return Ok(());
        }

        if self.options.enable_memory {
            self.memories = self.fetch_memories().await;
        }

        let capabilities = self.engine.registry.to_prompt_json();
        let planner = Planner::new(self.engine.llm.clone());
        let plan = match self
            .engine
            .guarded(&self.cancel, planner.plan(&self.task.prompt, &capabilities))
            .await
        {
            Ok(plan) => plan,
            Err(AgentError::Cancelled) => {
                self.cancelled(None, Vec::new());
                return Ok(());
            }
            Err(e) => {
                // 第一次推理调用即失败：后端不可用
                self.fail(e.to_string());
                return Ok(());
            }
        };

        if let Some(answer) = plan.direct_answer {
            debug!("trivial task, answering directly");
            self.transition(ExecutionState::Responding)?;
            self.complete(answer).await;
            return Ok(());
        }

        info!(subtasks = plan.subtasks.len(), analysis = %plan.analysis, "plan ready");
        self.subtasks = plan.subtasks;
        self.emit(EngineEvent::Plan {
            subtasks: self.subtasks.clone(),
        });

        self.steps().await
    }

    async fn steps(&mut self) -> Result<(), AgentError> {
        loop {
            if self.cancel.is_cancelled() {
                self.cancelled(None, Vec::new());
                return Ok(());
            }
            if self.trace.len() >= self.options.max_steps {
                info!(max_steps = self.options.max_steps, "step budget exhausted");
                self.transition(ExecutionState::Responding)?;
                self.final_answer = self.synthesize().await;
                self.status = RunStatus::Truncated;
                return Ok(());
            }

            let index = self.trace.len();
            let entry_state = self.machine.current();
            self.emit(EngineEvent::Thinking {
                step: index,
                max_steps: self.options.max_steps,
            });

            let messages = self.decision_messages();
            let reply = match self.engine.ask(&messages, &self.cancel).await {
                Ok(reply) => reply,
                Err(AgentError::Cancelled) => {
                    self.cancelled(None, Vec::new());
                    return Ok(());
                }
                Err(e) => {
                    warn!(step = index, error = %e, "reasoning backend failed, recording step");
                    self.trace.push(Step::new(
                        index,
                        entry_state,
                        StepAction::BackendFailure {
                            error: e.to_string(),
                        },
                    ));
                    continue;
                }
            };

            match parse_decision(&reply) {
                Err(e) => {
                    if let RecoveryAction::RetryWithPrompt(prompt) = self.engine.recovery.handle(&e) {
                        self.emit(EngineEvent::Recovery {
                            action: "RetryWithPrompt".to_string(),
                            detail: prompt.clone(),
                        });
                        self.dialogue.push(Message::assistant(reply));
                        self.dialogue.push(Message::user(prompt));
                    }
                    self.trace.push(Step::new(
                        index,
                        entry_state,
                        StepAction::MalformedDecision {
                            error: e.to_string(),
                        },
                    ));
                }
                Ok(Decision::Final { thought, answer }) => {
                    if let Some(t) = thought {
                        self.emit_thought(&t);
                    }
                    self.transition(ExecutionState::Responding)?;
                    self.complete(answer).await;
                    return Ok(());
                }
                Ok(Decision::Invoke { thought, calls }) => {
                    if let Some(t) = &thought {
                        self.emit_thought(t);
                    }
                    self.transition(ExecutionState::Executing)?;
                    let results = self.dispatch(&calls).await;
                    let (observations, hints) = self.observe(&calls, results);

                    if self.cancel.is_cancelled() {
                        self.cancelled(thought, observations);
                        return Ok(());
                    }

                    self.transition(ExecutionState::Observing)?;
                    self.dialogue.push(Message::assistant(reply));
                    self.dialogue
                        .push(Message::user(render_observations(index, &observations, &hints)));

                    let mut step = Step::new(index, entry_state, StepAction::Invoke { calls });
                    step.thought = thought;
                    step.observations = observations;
                    let failed = step.has_failure();
                    self.trace.push(step);
                    self.executed_steps += 1;

                    let due = self.executed_steps % self.options.reflection_interval == 0;
                    if self.options.enable_reflection && (due || failed) && self.reflect().await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    fn emit_thought(&self, thought: &str) {
        self.emit(EngineEvent::ThinkingContent {
            text: prompts::clip(thought, THINKING_PREVIEW_CHARS),
        });
    }

    fn decision_messages(&self) -> Vec<Message> {
        let system = prompts::executor_system(
            &self.engine.registry.to_prompt_json(),
            &tool_call_schema_json(),
            &parallel_call_schema_json(),
            &final_answer_schema_json(),
            &self.memories,
        );
        let mut messages = vec![
            Message::system(system),
            Message::user(prompts::executor_task(&self.task.prompt, &self.subtasks)),
        ];
        messages.extend(self.dialogue.messages().iter().cloned());
        messages
    }

    /// 并发执行一步内的所有调用；单个失败不影响其它调用
    async fn dispatch(&self, calls: &[ToolCall]) -> Vec<Result<String, AgentError>> {
        let runs = calls.iter().map(|call| async move {
            self.emit(EngineEvent::ToolCall {
                tool: call.tool.clone(),
                args: call.args.clone(),
            });
            let _permit = self.engine.scheduler.acquire_tool().await;
            self.executor
                .execute(&call.tool, call.args.clone(), &self.cancel)
                .await
        });
        join_all(runs).await
    }

    /// 结果 → 观察；同时收集恢复提示（如歧义名的候选）
    fn observe(
        &self,
        calls: &[ToolCall],
        results: Vec<Result<String, AgentError>>,
    ) -> (Vec<Observation>, Vec<String>) {
        let mut observations = Vec::with_capacity(results.len());
        let mut hints = Vec::new();
        for (call, result) in calls.iter().zip(results) {
            let obs = match result {
                Ok(content) => Observation {
                    tool: call.tool.clone(),
                    ok: true,
                    content,
                    error_kind: None,
                },
                Err(e) => {
                    if let RecoveryAction::RetryWithPrompt(hint) = self.engine.recovery.handle(&e) {
                        hints.push(hint);
                    }
                    Observation {
                        tool: call.tool.clone(),
                        ok: false,
                        content: e.to_string(),
                        error_kind: Some(e.kind().to_string()),
                    }
                }
            };
            self.emit(EngineEvent::Observation {
                tool: obs.tool.clone(),
                ok: obs.ok,
                preview: prompts::clip(&obs.content, OBSERVATION_PREVIEW_CHARS),
            });
            observations.push(obs);
        }
        (observations, hints)
    }

    /// 返回 true 表示 Run 已在反思中结束
    async fn reflect(&mut self) -> Result<bool, AgentError> {
        self.transition(ExecutionState::Reflecting)?;
        let reflector = Reflector::new(self.engine.llm.clone());
        let reflection = match self
            .engine
            .guarded(
                &self.cancel,
                reflector.reflect(&self.task.prompt, &self.trace, &self.subtasks),
            )
            .await
        {
            Ok(r) => r,
            Err(AgentError::Cancelled) => {
                self.cancelled(None, Vec::new());
                return Ok(true);
            }
            Err(e) => {
                warn!(error = %e, "reflection failed, keeping the plan");
                Reflection::unchanged(format!("reflection unavailable: {e}"))
            }
        };

        info!(
            after_step = self.trace.len(),
            assessment = %reflection.assessment,
            "reflection"
        );
        self.emit(EngineEvent::Reflection {
            assessment: reflection.assessment.clone(),
        });
        apply_reflection(&mut self.subtasks, &reflection);
        if reflection.revised_subtasks.is_some() {
            self.emit(EngineEvent::Plan {
                subtasks: self.subtasks.clone(),
            });
        }
        self.reflections.push(ReflectionRecord {
            after_step: self.trace.len(),
            reflection: reflection.clone(),
        });

        if reflection.needs_user_input {
            self.transition(ExecutionState::Responding)?;
            self.final_answer = reflection
                .question
                .filter(|q| !q.trim().is_empty())
                .unwrap_or(reflection.assessment);
            self.status = RunStatus::NeedsInput;
            return Ok(true);
        }
        if !reflection.can_proceed {
            self.transition(ExecutionState::Responding)?;
            self.final_answer = self.synthesize().await;
            self.status = RunStatus::Completed;
            return Ok(true);
        }
        Ok(false)
    }

    /// 以 Trace 汇总答案；后端不可用时拼接成功的观察
    async fn synthesize(&self) -> String {
        let messages = [
            Message::system(prompts::synthesis_system()),
            Message::user(prompts::synthesis_user(&self.task.prompt, &self.trace)),
        ];
        match self.engine.ask(&messages, &self.cancel).await {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => self.fallback_answer(),
            Err(e) => {
                warn!(error = %e, "answer synthesis failed, concatenating observations");
                self.fallback_answer()
            }
        }
    }

    fn fallback_answer(&self) -> String {
        let gathered: Vec<String> = self
            .trace
            .iter()
            .flat_map(|s| s.observations.iter())
            .filter(|o| o.ok)
            .map(|o| format!("{}: {}", o.tool, o.content))
            .collect();
        if gathered.is_empty() {
            "No answer could be produced within the step budget.".to_string()
        } else {
            gathered.join("\n")
        }
    }

    async fn complete(&mut self, answer: String) {
        self.status = RunStatus::Completed;
        if self.options.enable_memory && !answer.trim().is_empty() {
            let memory = format!("Task: {}\nAnswer: {}", self.task.prompt, answer);
            if let Err(e) = self.engine.memory.store(&self.task.user_id, &memory).await {
                warn!(error = %e, "failed to store memory");
            }
        }
        self.final_answer = answer;
    }

    async fn fetch_memories(&self) -> Vec<String> {
        let fetch = async {
            self.engine
                .memory
                .fetch(&self.task.user_id, &self.task.prompt, MEMORY_FETCH_LIMIT)
                .await
                .map_err(AgentError::LlmError)
        };
        match self.engine.guarded(&self.cancel, fetch).await {
            Ok(memories) => {
                debug!(count = memories.len(), "memories fetched");
                memories
            }
            Err(e) => {
                warn!(error = %e, "memory fetch failed, continuing without");
                Vec::new()
            }
        }
    }

    /// 记录取消步并进入 ERROR
    fn cancelled(&mut self, thought: Option<String>, observations: Vec<Observation>) {
        let mut step = Step::new(self.trace.len(), self.machine.current(), StepAction::Cancelled);
        step.thought = thought;
        step.observations = observations;
        self.trace.push(step);
        if !self.machine.current().is_terminal() {
            let _ = self.transition(ExecutionState::Error);
        }
        self.status = RunStatus::Cancelled;
        info!(steps = self.trace.len(), "run cancelled");
    }

    fn fail(&mut self, error: String) {
        if !self.machine.current().is_terminal() {
            let _ = self.transition(ExecutionState::Error);
        }
        self.status = RunStatus::Failed;
        self.error = Some(error);
    }

    fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            final_answer: self.final_answer,
            status: self.status,
            trace: self.trace,
            reflections: self.reflections,
            subtasks: self.subtasks,
            states: self.machine.history().to_vec(),
            error: self.error,
        }
    }
}

fn render_observations(index: usize, observations: &[Observation], hints: &[String]) -> String {
    let mut text = format!("Observations for step #{index}:");
    for obs in observations {
        let status = match (&obs.ok, &obs.error_kind) {
            (true, _) => "ok".to_string(),
            (false, Some(kind)) => format!("failed: {kind}"),
            (false, None) => "failed".to_string(),
        };
        text.push_str(&format!("\n- {} [{}]: {}", obs.tool, status, obs.content));
    }
    for hint in hints {
        text.push_str("\nHint: ");
        text.push_str(hint);
    }
    text
}
