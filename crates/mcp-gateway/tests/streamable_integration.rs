//! Integration tests for the Streamable HTTP bridges against the
//! `add-mcp-server` fixture.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mcp_gateway::bridge::streamable::{StatefulBridge, StatefulOptions, StatelessBridge};
use mcp_gateway::http::{SESSION_HEADER, Server};
use mcp_gateway::remote::{RemoteEndpoint, StreamableRemote};
use mcp_gateway::{ChildCommand, CommandSpawner};
use mcp_gateway_core::envelope::{initialize_request, initialized_notification};
use mcp_gateway_core::{Envelope, RequestId};
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn add_server() -> Arc<CommandSpawner> {
    Arc::new(CommandSpawner::new(ChildCommand::new(env!("CARGO_BIN_EXE_add-mcp-server"))))
}

fn mcp_url(server: &Server) -> String {
    format!("http://127.0.0.1:{}/mcp", server.local_addr().port())
}

fn call(id: i64, tool: &str, arguments: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "method": "tools/call", "params": {"name": tool, "arguments": arguments}})
}

async fn post_json(client: &reqwest::Client, url: &str, body: &Value) -> (reqwest::StatusCode, Value) {
    let response = client
        .post(url)
        .header("accept", "application/json")
        .json(body)
        .send()
        .await
        .unwrap();
    let status = response.status();
    (status, response.json().await.unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_stateless_concurrent_sessions_are_isolated() {
    let bridge = StatelessBridge::new(add_server(), "2024-11-05");
    let server = Server::bind(0, bridge.router("/mcp")).await.unwrap();
    let url = mcp_url(&server);
    let client = reqwest::Client::new();

    let calls = (0..5).map(|n| {
        let client = client.clone();
        let url = url.clone();
        tokio::spawn(async move {
            let (status, sum) = post_json(&client, &url, &call(1, "add", json!({"a": n, "b": 100}))).await;
            assert_eq!(status, reqwest::StatusCode::OK);
            assert_eq!(sum["id"], 1);
            assert_eq!(
                sum["result"]["content"][0]["text"],
                format!("The sum of {n} and 100 is {}.", n + 100)
            );
            let (_, pid) = post_json(&client, &url, &call(1, "pid", json!({}))).await;
            pid["result"]["content"][0]["text"].as_str().unwrap().to_string()
        })
    });
    let pids: HashSet<String> = futures::future::join_all(calls)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();
    // Every request had its own child.
    assert_eq!(pids.len(), 5);

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_stateless_event_stream_reply() {
    let bridge = StatelessBridge::new(add_server(), "2024-11-05");
    let server = Server::bind(0, bridge.router("/mcp")).await.unwrap();
    let response = reqwest::Client::new()
        .post(mcp_url(&server))
        .header("accept", "application/json, text/event-stream")
        .json(&call(8, "add", json!({"a": 1, "b": 1})))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    let data: Vec<Value> = body
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["id"], 8);
    assert_eq!(data[0]["result"]["content"][0]["text"], "The sum of 1 and 1 is 2.");
    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_stateful_session_lifecycle() {
    let bridge = StatefulBridge::new(add_server(), &StatefulOptions::default());
    let server = Server::bind(0, bridge.router("/mcp")).await.unwrap();
    let url = mcp_url(&server);
    let client = reqwest::Client::new();

    let init = initialize_request(RequestId::from(1), "2025-03-26", "it");
    let response = client
        .post(&url)
        .header("accept", "application/json")
        .body(init.to_line())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let session = response.headers()[SESSION_HEADER].to_str().unwrap().to_string();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["protocolVersion"], "2025-03-26");

    let response = client
        .post(&url)
        .header("accept", "application/json")
        .header(SESSION_HEADER, &session)
        .json(&call(2, "add", json!({"a": 40, "b": 2})))
        .send()
        .await
        .unwrap();
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["result"]["content"][0]["text"], "The sum of 40 and 2 is 42.");

    let response = client
        .delete(&url)
        .header(SESSION_HEADER, &session)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(bridge.session_count(), 0);

    let response = client
        .post(&url)
        .header("accept", "application/json")
        .header(SESSION_HEADER, &session)
        .json(&call(3, "add", json!({"a": 1, "b": 1})))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop(Duration::from_secs(2)).await.unwrap();
}

#[tokio::test]
async fn test_stateful_session_ends_when_child_crashes() {
    let bridge = StatefulBridge::new(add_server(), &StatefulOptions::default());
    let server = Server::bind(0, bridge.router("/mcp")).await.unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let remote = StreamableRemote::new(&mcp_url(&server), HeaderMap::new(), tx).unwrap();

    remote
        .send(initialize_request(RequestId::from(1), "2024-11-05", "it"))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(10), rx.recv()).await.unwrap().unwrap();
    remote.send(initialized_notification()).await.unwrap();
    assert_eq!(bridge.session_count(), 1);

    remote
        .send(Envelope::request(2, "tools/call", Some(json!({"name": "crash", "arguments": {}}))))
        .await
        .unwrap();
    let reply = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.id(), Some(&RequestId::from(2)));
    assert_eq!(reply.to_value()["error"]["code"], -32000);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while bridge.session_count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "session outlived its child");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.stop(Duration::from_secs(2)).await.unwrap();
}
