//! bee-engine：执行一个任务并以 JSON 打印结果
//!
//! 用法：`bee-engine [--config <path>] [--model <name>] [--user <id>] <task...>`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use bee_engine::config::load_config;
use bee_engine::core::{ProtocolClientCleanup, ShutdownCoordinator, ShutdownManager};
use bee_engine::{observability, Agent};
use clap::Parser;

#[derive(Parser)]
#[command(name = "bee-engine")]
#[command(about = "Run one task through the Bee execution core", long_about = None)]
#[command(version)]
struct Cli {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long)]
    config: Option<PathBuf>,

    /// 推理模型名（缺省使用 [llm].model）
    #[arg(long)]
    model: Option<String>,

    #[arg(long, default_value = "local")]
    user: String,

    /// 任务描述
    #[arg(required = true)]
    task: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init();
    let task = cli.task.join(" ");

    let cfg = load_config(cli.config.clone()).context("Failed to load config")?;
    let (agent, report) = Agent::connect(&cfg).await;
    tracing::info!(
        ready = ?report.ready,
        degraded = ?report.degraded,
        skipped = report.skipped.len(),
        "providers connected"
    );

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let result = agent
        .run(&cli.user, &task, cli.model.as_deref(), None, shutdown.token())
        .await;

    let mut coordinator =
        ShutdownCoordinator::new().with_timeout(cfg.protocol.shutdown_timeout() * 2);
    coordinator.register(ProtocolClientCleanup::new(agent.registry().client().clone()));
    coordinator.run_cleanup().await;

    let response = result.context("Run rejected")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&response).context("Failed to encode result")?
    );
    Ok(())
}
