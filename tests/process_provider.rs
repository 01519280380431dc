//! 本地进程 Provider：用 sh 脚本充当最小的 JSON-RPC 服务端

mod common;

use std::time::Duration;

use bee_engine::config::ProviderEntry;
use bee_engine::protocol::{Liveness, ProtocolClient};
use common::{fast_settings, providers};
use serde_json::json;

const SERVER: &str = r#"
while read -r line; do
  id=$(echo "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"protocolVersion\":\"2024-11-05\",\"capabilities\":{\"tools\":{}},\"serverInfo\":{\"name\":\"sh\",\"version\":\"0\"}}}" ;;
    *'"method":"tools/list"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"tools\":[{\"name\":\"greet\",\"description\":\"says hello\",\"inputSchema\":{\"type\":\"object\"}}]}}" ;;
    *'"method":"tools/call"'*)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"result\":{\"content\":[{\"type\":\"text\",\"text\":\"hello from sh\"}]}}" ;;
    *)
      echo "{\"jsonrpc\":\"2.0\",\"id\":$id,\"error\":{\"code\":-32601,\"message\":\"method not found\"}}" ;;
  esac
done
"#;

fn sh_entry() -> ProviderEntry {
    ProviderEntry::process("sh", vec!["-c".to_string(), SERVER.to_string()])
}

#[tokio::test]
async fn test_process_provider_discovery_and_invoke() {
    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[("local", sh_entry())]))
        .await
        .unwrap();
    assert_eq!(report.ready, vec!["local".to_string()]);

    let tools = client.list();
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].qualified_name, "local.greet");
    assert_eq!(tools[0].description, "says hello");

    let out = client
        .invoke("local.greet", json!({"name": "bee"}), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(out, json!("hello from sh"));

    let state = &client.session_states()[0];
    assert_eq!(state.liveness, Liveness::Ready);
    assert_eq!(state.tools, 1);

    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .unwrap();
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn test_missing_executable_is_degraded() {
    let client = ProtocolClient::new(fast_settings());
    let report = client
        .initialize(&providers(&[(
            "ghost",
            ProviderEntry::process("/definitely/not/here", vec![]),
        )]))
        .await
        .unwrap();
    assert_eq!(report.degraded, vec!["ghost".to_string()]);
    assert!(client.list().is_empty());
    client.shutdown().await;
}
