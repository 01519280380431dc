//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__ENGINE__MAX_STEPS=20`）。
//! Provider 表 `[providers.<name>]` 只做解析，逐项校验由 ProtocolClient 在 initialize 时完成，
//! 单个 Provider 配置错误不影响其它 Provider。

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::ProtocolError;
use crate::tools::BUILTIN_PROVIDER;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub engine: EngineSection,
    pub protocol: ProtocolSection,
    /// Provider 名 → 配置；BTreeMap 保证连接与列举顺序稳定
    pub providers: BTreeMap<String, ProviderEntry>,
}

/// [app] 段
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppSection {
    pub name: Option<String>,
}

/// [llm] 段：后端选择与超时
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 单次推理请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

fn default_provider() -> String {
    "deepseek".to_string()
}

fn default_model() -> String {
    "deepseek-chat".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// [engine] 段：单次 Run 的默认选项
#[derive(Debug, Clone, Deserialize)]
pub struct EngineSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default = "default_reflection_interval")]
    pub reflection_interval: usize,
    #[serde(default = "default_true")]
    pub enable_memory: bool,
    #[serde(default = "default_true")]
    pub enable_reflection: bool,
    /// 单次能力调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
    /// 同一步内并发动作上限
    #[serde(default = "default_max_concurrent_actions")]
    pub max_concurrent_actions: usize,
}

fn default_max_steps() -> usize {
    10
}

fn default_reflection_interval() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_tool_timeout_secs() -> u64 {
    30
}

fn default_max_concurrent_actions() -> usize {
    3
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            reflection_interval: default_reflection_interval(),
            enable_memory: true,
            enable_reflection: true,
            tool_timeout_secs: default_tool_timeout_secs(),
            max_concurrent_actions: default_max_concurrent_actions(),
        }
    }
}

/// [protocol] 段：握手、重连退避、心跳、关闭宽限期
#[derive(Debug, Clone, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_discovery_timeout_secs")]
    pub discovery_timeout_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// 本地进程 Close 时等待自行退出的时间，超时后强杀
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Shutdown 时每个会话的关闭期限
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_discovery_timeout_secs() -> u64 {
    10
}

fn default_max_reconnect_attempts() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_backoff_cap_ms() -> u64 {
    30_000
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_close_grace_ms() -> u64 {
    2_000
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            discovery_timeout_secs: default_discovery_timeout_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_cap_ms: default_backoff_cap_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            close_grace_ms: default_close_grace_ms(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ProtocolSection {
    /// 时长类参数必须为正：0 会让握手立即超时、心跳定时器无法创建
    pub fn validate(&self) -> Result<(), String> {
        let positive = [
            ("discovery_timeout_secs", self.discovery_timeout_secs),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("backoff_base_ms", self.backoff_base_ms),
            ("backoff_cap_ms", self.backoff_cap_ms),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(format!("protocol.{key} must be > 0"));
            }
        }
        if self.backoff_cap_ms < self.backoff_base_ms {
            return Err("protocol.backoff_cap_ms must be >= backoff_base_ms".to_string());
        }
        Ok(())
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_secs(self.discovery_timeout_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// 第 attempt 次（从 1 开始）重连前的等待：base·2^(n-1)，上限 cap
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

/// 传输种类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// 本地子进程，stdin/stdout 按行分隔 JSON
    #[serde(alias = "stdio")]
    Process,
    /// 长连接事件流 + 独立 POST 请求
    #[serde(alias = "sse", alias = "streamable_http")]
    Http,
    /// WebSocket 全双工 + 心跳
    #[serde(alias = "websocket", alias = "ws")]
    Socket,
}

/// [providers.<name>] 段
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEntry {
    pub transport: TransportKind,
    /// process：可执行文件
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    /// http / socket：端点 URL
    pub url: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 覆盖该 Provider 的握手 / 发现超时（秒）
    pub timeout_secs: Option<u64>,
}

impl ProviderEntry {
    pub fn process(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            transport: TransportKind::Process,
            command: Some(command.into()),
            args,
            env: HashMap::new(),
            cwd: None,
            url: None,
            headers: HashMap::new(),
            enabled: true,
            timeout_secs: None,
        }
    }

    pub fn remote(transport: TransportKind, url: impl Into<String>) -> Self {
        Self {
            transport,
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            url: Some(url.into()),
            headers: HashMap::new(),
            enabled: true,
            timeout_secs: None,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// 校验单个 Provider：缺命令 / URL、scheme 不匹配、名称含分隔符
    pub fn validate(&self, name: &str) -> Result<(), ProtocolError> {
        let fail = |reason: String| ProtocolError::ConfigError {
            provider: name.to_string(),
            reason,
        };
        if name.is_empty() || name.contains('.') {
            return Err(fail("provider name must be non-empty and contain no '.'".into()));
        }
        if name == BUILTIN_PROVIDER {
            return Err(fail(format!(
                "provider name '{BUILTIN_PROVIDER}' is reserved for local capabilities"
            )));
        }
        if self.timeout_secs == Some(0) {
            return Err(fail("timeout_secs must be > 0".into()));
        }
        match self.transport {
            TransportKind::Process => match self.command.as_deref() {
                Some(cmd) if !cmd.trim().is_empty() => Ok(()),
                _ => Err(fail("process transport requires 'command'".into())),
            },
            TransportKind::Http => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| fail("http transport requires 'url'".into()))?;
                let parsed = reqwest::Url::parse(url).map_err(|e| fail(format!("bad url: {e}")))?;
                match parsed.scheme() {
                    "http" | "https" => Ok(()),
                    other => Err(fail(format!("http transport cannot use scheme '{other}'"))),
                }
            }
            TransportKind::Socket => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| fail("socket transport requires 'url'".into()))?;
                let parsed = reqwest::Url::parse(url).map_err(|e| fail(format!("bad url: {e}")))?;
                match parsed.scheme() {
                    "ws" | "wss" => Ok(()),
                    other => Err(fail(format!("socket transport cannot use scheme '{other}'"))),
                }
            }
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    let cfg: AppConfig = c.try_deserialize()?;
    cfg.protocol.validate().map_err(config::ConfigError::Message)?;
    Ok(cfg)
}
