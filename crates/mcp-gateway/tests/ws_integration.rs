//! Integration test for the WebSocket hub with a real child: two clients
//! share one `add-mcp-server` and reuse the same request id.

use std::time::Duration;

use mcp_gateway::bridge::ws::WsHub;
use mcp_gateway::{ChildCommand, ChildHandle, ChildSpawner, CommandSpawner};
use serde_json::{Value, json};
use tokio::sync::mpsc;

async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let text = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    serde_json::from_str(&text).unwrap()
}

#[tokio::test]
async fn test_clients_share_one_child() {
    let spawner = CommandSpawner::new(ChildCommand::new(env!("CARGO_BIN_EXE_add-mcp-server")));
    let hub = WsHub::new(ChildHandle::start(1, spawner.spawn().unwrap()));
    let running = tokio::spawn(hub.clone().run());

    let (alice, mut alice_rx) = hub.connect();
    let (bob, mut bob_rx) = hub.connect();
    for (client, a) in [(&alice, 1), (&bob, 2)] {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "add", "arguments": {"a": a, "b": 10}}});
        hub.from_client(client, &request.to_string());
    }

    let reply = next(&mut alice_rx).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["content"][0]["text"], "The sum of 1 and 10 is 11.");
    let reply = next(&mut bob_rx).await;
    assert_eq!(reply["id"], 1);
    assert_eq!(reply["result"]["content"][0]["text"], "The sum of 2 and 10 is 12.");

    // Crashing the shared child stops the hub and closes every client.
    hub.from_client(&alice, r#"{"jsonrpc":"2.0","id":9,"method":"tools/call","params":{"name":"crash"}}"#);
    let info = tokio::time::timeout(Duration::from_secs(10), running)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(info.to_string(), "code=42");
    assert!(alice_rx.recv().await.is_none());
    assert!(bob_rx.recv().await.is_none());
}
