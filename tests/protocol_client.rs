//! ProtocolClient 端到端测试：真实 WebSocket 连接到进程内假 Provider

mod common;

use std::time::Duration;

use bee_engine::config::{ProtocolSection, ProviderEntry, TransportKind};
use bee_engine::core::ProtocolError;
use bee_engine::protocol::{Liveness, ProtocolClient, ResourceContent};
use bee_engine::tools::{CapabilityRegistry, ToolRegistry};
use common::{eventually, fast_settings, providers, FakeServer};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_paginated_discovery_and_invoke() {
    let server = FakeServer::start(&["search", "fetch", "summarize"]).await;
    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[("facts", server.entry())]))
        .await
        .unwrap();
    assert_eq!(report.ready, vec!["facts".to_string()]);

    let names: Vec<String> = client.list().into_iter().map(|d| d.qualified_name).collect();
    assert_eq!(names, vec!["facts.fetch", "facts.search", "facts.summarize"]);

    let out = client
        .invoke("facts.search", json!({"query": "rust"}), CALL_TIMEOUT)
        .await
        .unwrap();
    assert!(out.as_str().unwrap().starts_with("search:"));
    assert!(out.as_str().unwrap().contains("rust"));

    // 唯一裸名同样可以解析
    let out = client.invoke("fetch", json!({}), CALL_TIMEOUT).await.unwrap();
    assert!(out.as_str().unwrap().starts_with("fetch:"));

    assert_eq!(server.calls(), vec!["search", "fetch"]);
    assert_eq!(client.pending_calls(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn test_bare_name_ambiguous_across_providers() {
    let a = FakeServer::start(&["search"]).await;
    let b = FakeServer::start(&["search", "only_b"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("a", a.entry()), ("b", b.entry())]))
        .await
        .unwrap();

    match client.invoke("search", json!({}), CALL_TIMEOUT).await {
        Err(ProtocolError::AmbiguousCapability { candidates, .. }) => {
            assert_eq!(candidates, vec!["a.search", "b.search"]);
        }
        other => panic!("expected ambiguity, got {other:?}"),
    }
    assert!(client.invoke("b.search", json!({}), CALL_TIMEOUT).await.is_ok());
    assert!(client.invoke("only_b", json!({}), CALL_TIMEOUT).await.is_ok());
    assert!(matches!(
        client.invoke("nope", json!({}), CALL_TIMEOUT).await,
        Err(ProtocolError::CapabilityNotFound(_))
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn test_tool_error_is_reported() {
    let server = FakeServer::start(&["fail"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();

    match client.invoke("s.fail", json!({}), CALL_TIMEOUT).await {
        Err(ProtocolError::InvokeError { target, message }) => {
            assert_eq!(target, "s.fail");
            assert_eq!(message, "backend down");
        }
        other => panic!("expected invoke error, got {other:?}"),
    }
    client.shutdown().await;
}

#[tokio::test]
async fn test_list_changed_refreshes_catalog() {
    let server = FakeServer::start(&["old_tool", "keep"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();
    let version = client.catalog_version();

    server.set_tools(&["keep", "new_tool"]);
    server.notify_list_changed();

    let refreshed = eventually(Duration::from_secs(3), || {
        client.list().iter().any(|d| d.qualified_name == "s.new_tool")
    })
    .await;
    assert!(refreshed);
    assert!(client.catalog_version() > version);
    assert!(matches!(
        client.invoke("s.old_tool", json!({}), CALL_TIMEOUT).await,
        Err(ProtocolError::CapabilityNotFound(_))
    ));
    assert!(client.invoke("s.new_tool", json!({}), CALL_TIMEOUT).await.is_ok());
    client.shutdown().await;
}

#[tokio::test]
async fn test_repeated_timeouts_do_not_leak_pending_calls() {
    let server = FakeServer::start(&["hang", "echo_back"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();

    for _ in 0..5 {
        let err = client
            .invoke("s.hang", json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvokeTimeout { .. }));
    }
    assert_eq!(client.pending_calls(), 0);
    assert!(eventually(Duration::from_secs(2), || server.cancelled().len() == 5).await);

    // 超时之后会话仍然可用
    assert!(client.invoke("s.echo_back", json!({}), CALL_TIMEOUT).await.is_ok());
    client.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_are_correlated() {
    let server = FakeServer::start(&["slow", "quick"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();

    let (slow, quick) = tokio::join!(
        client.invoke("s.slow", json!({}), CALL_TIMEOUT),
        client.invoke("s.quick", json!({"n": 1}), CALL_TIMEOUT),
    );
    assert_eq!(slow.unwrap(), json!("slow done"));
    assert!(quick.unwrap().as_str().unwrap().starts_with("quick:"));
    assert_eq!(client.pending_calls(), 0);
    client.shutdown().await;
}

#[tokio::test]
async fn test_registry_cancel_abandons_remote_call() {
    let server = FakeServer::start(&["hang"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();
    let registry = CapabilityRegistry::new(ToolRegistry::with_builtins(), client.clone());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });
    let err = registry
        .invoke("hang", json!({}), Duration::from_secs(10), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Cancelled));
    assert_eq!(client.pending_calls(), 0);
    assert!(eventually(Duration::from_secs(2), || server.cancelled().len() == 1).await);
    client.shutdown().await;
}

#[tokio::test]
async fn test_resources_listed_and_fetched() {
    let server = FakeServer::start(&["search"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("notes", server.entry())]))
        .await
        .unwrap();

    let resources = client.list_resources();
    assert_eq!(resources.len(), 1);
    assert_eq!(resources[0].uri, "mem://notes");

    match client.fetch_resource("mem://notes").await.unwrap() {
        ResourceContent::Text { text, .. } => assert_eq!(text, "remember the milk"),
        other => panic!("expected text resource, got {other:?}"),
    }
    assert!(matches!(
        client.fetch_resource("mem://missing").await,
        Err(ProtocolError::ResourceNotFound(_))
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_provider_does_not_block_others() {
    let good = FakeServer::start(&["search"]).await;
    let dead = ProviderEntry::remote(TransportKind::Socket, "ws://127.0.0.1:1");
    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[("dead", dead), ("good", good.entry())]))
        .await
        .unwrap();

    assert_eq!(report.ready, vec!["good".to_string()]);
    assert_eq!(report.degraded, vec!["dead".to_string()]);
    let states = client.session_states();
    let dead_state = states.iter().find(|s| s.provider == "dead").unwrap();
    assert_ne!(dead_state.liveness, Liveness::Ready);
    assert!(dead_state.last_error.is_some());

    let names: Vec<String> = client.list().into_iter().map(|d| d.qualified_name).collect();
    assert_eq!(names, vec!["good.search"]);
    assert!(client.invoke("search", json!({}), CALL_TIMEOUT).await.is_ok());
    client.shutdown().await;
}

#[tokio::test]
async fn test_invalid_provider_skipped_and_all_invalid_is_fatal() {
    let good = FakeServer::start(&["search"]).await;
    let broken = ProviderEntry::remote(TransportKind::Socket, "");

    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[("broken", broken.clone()), ("good", good.entry())]))
        .await
        .unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "broken");
    assert!(client.fatal_config_error().is_none());
    client.shutdown().await;

    let client = ProtocolClient::new(fast_settings());
    let err = client
        .initialize(&providers(&[("broken", broken)]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ConfigError { .. }));
    assert!(client.fatal_config_error().is_some());
}

#[tokio::test]
async fn test_shutdown_closes_sessions_and_fails_later_calls() {
    let server = FakeServer::start(&["search"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();
    assert_eq!(server.connections(), 1);

    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .unwrap();
    assert!(client.session_states().is_empty());
    assert!(client.list().is_empty());
    assert!(client.invoke("s.search", json!({}), CALL_TIMEOUT).await.is_err());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_reserved_builtin_provider_name_is_skipped() {
    let server = FakeServer::start(&["search"]).await;
    let good = FakeServer::start(&["fetch"]).await;
    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[("builtin", server.entry()), ("good", good.entry())]))
        .await
        .unwrap();
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].0, "builtin");
    assert_eq!(report.ready, vec!["good".to_string()]);

    let registry = CapabilityRegistry::new(ToolRegistry::with_builtins(), client.clone());
    let names: Vec<String> = registry.list().into_iter().map(|d| d.qualified_name).collect();
    assert_eq!(names, vec!["builtin.echo", "good.fetch"]);

    // 列出的每个能力都能调用
    let cancel = CancellationToken::new();
    for name in names {
        assert!(registry
            .invoke(&name, json!({"text": "x"}), CALL_TIMEOUT, &cancel)
            .await
            .is_ok());
    }
    client.shutdown().await;
}

#[tokio::test]
async fn test_session_reconnects_after_peer_drop() {
    let server = FakeServer::start(&["search"]).await;
    let client = ProtocolClient::new(fast_settings());
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();
    let version = client.catalog_version();

    server.drop_connections();

    let recovered = eventually(Duration::from_secs(3), || {
        server.connections() == 2
            && client.session_states()[0].liveness == Liveness::Ready
            && !client.list().is_empty()
    })
    .await;
    assert!(recovered);
    // 目录先被撤下（Degraded）再重新发布
    assert!(client.catalog_version() >= version + 2);
    assert!(client.session_states()[0].last_error.is_none());
    assert!(client.invoke("s.search", json!({}), CALL_TIMEOUT).await.is_ok());
    client.shutdown().await;
}

#[tokio::test]
async fn test_silent_socket_peer_detected_by_heartbeat() {
    let server = FakeServer::start(&["search"]).await;
    let settings = ProtocolSection {
        heartbeat_interval_secs: 1,
        ..fast_settings()
    };
    let client = ProtocolClient::new(settings);
    client
        .initialize(&providers(&[("s", server.entry())]))
        .await
        .unwrap();
    assert_eq!(client.session_states()[0].liveness, Liveness::Ready);

    server.set_frozen(true);

    let detected = eventually(Duration::from_secs(8), || {
        client.session_states()[0].liveness != Liveness::Ready
    })
    .await;
    assert!(detected);
    assert!(client.list().is_empty());
    assert!(matches!(
        client.invoke("s.search", json!({}), CALL_TIMEOUT).await,
        Err(ProtocolError::SessionUnavailable(_))
    ));
    assert_eq!(client.pending_calls(), 0);
    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_streamed_http_provider_end_to_end() {
    let server = FakeServer::start_http(&["search", "fetch", "summarize"]).await;
    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[("web", server.entry())]))
        .await
        .unwrap();
    assert_eq!(report.ready, vec!["web".to_string()]);
    assert_eq!(server.connections(), 1);

    let names: Vec<String> = client.list().into_iter().map(|d| d.qualified_name).collect();
    assert_eq!(names, vec!["web.fetch", "web.search", "web.summarize"]);

    let (slow, quick) = tokio::join!(
        client.invoke("web.search", json!({"query": "sse"}), CALL_TIMEOUT),
        client.invoke("summarize", json!({}), CALL_TIMEOUT),
    );
    assert!(slow.unwrap().as_str().unwrap().contains("sse"));
    assert!(quick.unwrap().as_str().unwrap().starts_with("summarize:"));

    match client.fetch_resource("mem://notes").await.unwrap() {
        ResourceContent::Text { text, .. } => assert_eq!(text, "remember the milk"),
        other => panic!("expected text resource, got {other:?}"),
    }
    assert_eq!(client.pending_calls(), 0);
    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .unwrap();
}
