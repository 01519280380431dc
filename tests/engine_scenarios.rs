//! 执行引擎端到端场景：脚本化推理后端 + 进程内假 Provider

mod common;

use std::sync::Arc;
use std::time::Duration;

use bee_engine::config::{AppConfig, ProviderEntry, TransportKind};
use bee_engine::core::ExecutionState;
use bee_engine::llm::{CallKind, ScriptedLlmClient};
use bee_engine::protocol::ProtocolClient;
use bee_engine::react::{Engine, RunOptions, RunStatus, StepAction, Task};
use bee_engine::tools::{CapabilityRegistry, ToolRegistry};
use bee_engine::Agent;
use common::{eventually, fast_settings, providers, FakeServer};
use tokio_util::sync::CancellationToken;

fn options(tool_timeout: Duration) -> RunOptions {
    RunOptions {
        max_steps: 10,
        reflection_interval: 3,
        enable_memory: false,
        enable_reflection: true,
        tool_timeout,
    }
}

async fn connect(server: &FakeServer, name: &str) -> Arc<CapabilityRegistry> {
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[(name, server.entry())]))
        .await
        .unwrap();
    Arc::new(CapabilityRegistry::new(ToolRegistry::with_builtins(), client))
}

#[tokio::test]
async fn test_two_searches_then_answer() {
    let server = FakeServer::start(&["search"]).await;
    let registry = connect(&server, "facts").await;
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .decide(r#"{"thought":"first","tool":"facts.search","args":{"query":"rust"}}"#)
            .decide(r#"{"thought":"second","tool":"facts.search","args":{"query":"tokio"}}"#)
            .decide(r#"{"final_answer":"rust and tokio"}"#),
    );

    let out = Engine::new(llm.clone(), registry.clone())
        .run(
            &Task::new("u", "tell me about rust"),
            &options(Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out.status, RunStatus::Completed);
    assert_eq!(out.final_answer, "rust and tokio");
    assert_eq!(out.trace.len(), 2);
    assert!(out.trace.len() <= 10);
    assert!(out.trace[0].observations[0].content.contains("rust"));
    assert!(out.trace[1].observations[0].content.contains("tokio"));
    assert!(out.trace.iter().all(|s| !s.has_failure()));
    assert_eq!(out.states.first(), Some(&ExecutionState::Idle));
    assert_eq!(out.states.last(), Some(&ExecutionState::Responding));
    assert_eq!(server.calls(), vec!["search", "search"]);
    assert_eq!(llm.calls(CallKind::Decide), 3);
    registry.client().shutdown().await;
}

#[tokio::test]
async fn test_tool_timeout_is_observed_and_run_recovers() {
    let server = FakeServer::start(&["hang"]).await;
    let registry = connect(&server, "s").await;
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .decide(r#"{"tool":"s.hang","args":{}}"#)
            .decide(r#"{"final_answer":"gave up waiting"}"#),
    );

    let out = Engine::new(llm, registry.clone())
        .run(
            &Task::new("u", "wait for it"),
            &options(Duration::from_millis(200)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out.status, RunStatus::Completed);
    assert_eq!(out.final_answer, "gave up waiting");
    let obs = &out.trace[0].observations[0];
    assert!(!obs.ok);
    assert_eq!(obs.error_kind.as_deref(), Some("invoke_timeout"));
    // 失败的调用触发一次反思
    assert_eq!(out.reflections.len(), 1);
    assert_eq!(registry.client().pending_calls(), 0);
    assert!(eventually(Duration::from_secs(2), || server.cancelled().len() == 1).await);
    registry.client().shutdown().await;
}

#[tokio::test]
async fn test_remote_tool_error_is_observed() {
    let server = FakeServer::start(&["fail"]).await;
    let registry = connect(&server, "s").await;
    let llm = Arc::new(
        ScriptedLlmClient::new()
            .decide(r#"{"tool":"fail","args":{}}"#)
            .decide(r#"{"final_answer":"backend was down"}"#),
    );

    let out = Engine::new(llm, registry.clone())
        .run(
            &Task::new("u", "try it"),
            &options(Duration::from_secs(5)),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(out.status, RunStatus::Completed);
    let obs = &out.trace[0].observations[0];
    assert_eq!(obs.tool, "fail");
    assert!(!obs.ok);
    assert_eq!(obs.error_kind.as_deref(), Some("invoke_error"));
    assert!(obs.content.contains("backend down"));
    registry.client().shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_remote_call() {
    let server = FakeServer::start(&["hang"]).await;
    let registry = connect(&server, "s").await;
    let llm = Arc::new(ScriptedLlmClient::new().decide(r#"{"tool":"s.hang","args":{}}"#));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let out = tokio::time::timeout(
        Duration::from_secs(5),
        Engine::new(llm, registry.clone()).run(
            &Task::new("u", "wait forever"),
            &options(Duration::from_secs(30)),
            cancel,
        ),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(out.status, RunStatus::Cancelled);
    assert!(matches!(out.trace.last().unwrap().action, StepAction::Cancelled));
    assert_eq!(out.states.last(), Some(&ExecutionState::Error));
    assert_eq!(registry.client().pending_calls(), 0);
    assert!(eventually(Duration::from_secs(2), || server.cancelled().len() == 1).await);
    registry.client().shutdown().await;
}

#[tokio::test]
async fn test_unreachable_provider_does_not_fail_run() {
    let good = FakeServer::start(&["search"]).await;
    let mut cfg = AppConfig::default();
    cfg.llm.model = "mock".to_string();
    cfg.protocol = fast_settings();
    cfg.providers = providers(&[
        ("dead", ProviderEntry::remote(TransportKind::Socket, "ws://127.0.0.1:1")),
        ("good", good.entry()),
    ]);

    let (agent, report) = Agent::connect(&cfg).await;
    assert_eq!(report.ready, vec!["good".to_string()]);
    assert_eq!(report.degraded, vec!["dead".to_string()]);

    let resp = agent
        .run("u", "hello there", None, None, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status, RunStatus::Completed);
    assert!(resp.final_answer.contains("hello there"));
    assert!(resp.error.is_none());
    agent.shutdown().await;
    assert_eq!(agent.registry().client().pending_calls(), 0);
}

#[tokio::test]
async fn test_concurrent_runs_share_one_client() {
    let server = FakeServer::start(&["search", "slow"]).await;
    let registry = connect(&server, "s").await;

    let run = |tool: &'static str| {
        let registry = registry.clone();
        async move {
            let llm = Arc::new(
                ScriptedLlmClient::new()
                    .decide(format!(r#"{{"tool":"s.{tool}","args":{{}}}}"#))
                    .decide(format!(r#"{{"final_answer":"{tool} ok"}}"#)),
            );
            Engine::new(llm, registry)
                .run(
                    &Task::new(tool, "go"),
                    &options(Duration::from_secs(5)),
                    CancellationToken::new(),
                )
                .await
                .unwrap()
        }
    };

    let (a, b) = tokio::join!(run("search"), run("slow"));
    assert_eq!(a.final_answer, "search ok");
    assert_eq!(b.final_answer, "slow ok");
    assert_eq!(b.trace[0].observations[0].content, "slow done");
    assert_eq!(registry.client().pending_calls(), 0);
    registry.client().shutdown().await;
}
