#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Regression tests for pipecraft-gateway: full command-verb lifecycle,
//! the event-stream WebSocket, and worker configuration verbs.

use futures_util::StreamExt;
use pipecraft_gateway::GatewayServer;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

fn briefing_body() -> serde_json::Value {
    serde_json::json!({
        "mode": "implement_feature",
        "description": "Add feature X",
        "guidance": null,
        "working_dir": ".",
        "worker_configs": [],
        "supervisor_config": {
            "heartbeat_interval": {"secs": 5, "nanos": 0},
            "bridge_timeout": {"secs": 30, "nanos": 0},
            "max_retries_per_task": 2,
            "test_command": null,
            "max_turns": 5
        },
        "auto_start_workers": false
    })
}

async fn start_server() -> (String, tempfile::TempDir) {
    let tmp = tempfile::tempdir().unwrap();
    let app = GatewayServer::build(tmp.path().to_path_buf(), Duration::from_millis(50));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_str = format!("127.0.0.1:{}", listener.local_addr().unwrap().port());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    (addr_str, tmp)
}

#[tokio::test]
async fn test_follow_up_comment_and_approve_lifecycle() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();

    let run = client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();
    assert_eq!(run.status(), 200);

    let follow_up =
        client.post(format!("http://{addr}/worktrees/wt1/follow-up")).json(&serde_json::json!({"description": "also handle edge case Y"})).send().await.unwrap();
    assert_eq!(follow_up.status(), 200);

    let snapshot: serde_json::Value =
        client.get(format!("http://{addr}/worktrees/wt1/snapshot")).send().await.unwrap().json().await.unwrap();
    let task_id = snapshot["tasks"][0]["id"].as_str().unwrap().to_string();

    let comment = client
        .post(format!("http://{addr}/worktrees/wt1/tasks/{task_id}/comments"))
        .json(&serde_json::json!({"author": "alice", "message": "looks good"}))
        .send()
        .await
        .unwrap();
    assert_eq!(comment.status(), 200);
    let entry: serde_json::Value = comment.json().await.unwrap();
    assert_eq!(entry["message"], "looks good");

    let approve = client
        .post(format!("http://{addr}/worktrees/wt1/tasks/{task_id}/approve"))
        .json(&serde_json::json!({"approver": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(approve.status(), 200);
    let task: serde_json::Value = approve.json().await.unwrap();
    assert!(task["approvals"].as_array().unwrap().iter().any(|a| a == "alice"));
}

#[tokio::test]
async fn test_unknown_task_id_is_validation_error() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();
    client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();

    let resp = client
        .post(format!("http://{addr}/worktrees/wt1/tasks/not-a-uuid/approve"))
        .json(&serde_json::json!({"approver": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_stop_run_then_restart_is_allowed() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();
    client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();

    let stopped =
        client.post(format!("http://{addr}/worktrees/wt1/runs/stop")).json(&serde_json::json!({"failure": null})).send().await.unwrap();
    assert_eq!(stopped.status(), 200);
    let stopped_run: serde_json::Value = stopped.json().await.unwrap();
    assert_eq!(stopped_run["status"], "completed");

    let restarted = client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();
    assert_eq!(restarted.status(), 200);
}

#[tokio::test]
async fn test_agent_graph_reflects_seeded_tasks() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();
    client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();

    let graph: serde_json::Value =
        client.get(format!("http://{addr}/worktrees/wt1/agent-graph")).send().await.unwrap().json().await.unwrap();
    let nodes = graph["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 7);
}

#[tokio::test]
async fn test_event_stream_delivers_initial_snapshot() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();
    client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();

    let url = format!("ws://{addr}/worktrees/wt1/events");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let msg = ws.next().await.unwrap().unwrap();
    let event: serde_json::Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
    assert_eq!(event["type"], "snapshot");
    assert_eq!(event["worktree_id"].is_null(), false);
}

#[tokio::test]
async fn test_event_stream_emits_tasks_updated_on_follow_up() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();
    client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();

    let url = format!("ws://{addr}/worktrees/wt1/events");
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    ws.next().await.unwrap().unwrap(); // initial snapshot

    client.post(format!("http://{addr}/worktrees/wt1/workers/configure")).json(&serde_json::json!({"configs": []})).send().await.unwrap();

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_configure_and_stop_workers() {
    let (addr, _tmp) = start_server().await;
    let client = reqwest::Client::new();
    client.post(format!("http://{addr}/worktrees/wt1/runs")).json(&briefing_body()).send().await.unwrap();

    let configure = client
        .post(format!("http://{addr}/worktrees/wt1/workers/configure"))
        .json(&serde_json::json!({"configs": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(configure.status(), 200);

    let stop =
        client.post(format!("http://{addr}/worktrees/wt1/workers/stop")).json(&serde_json::json!({"roles": null})).send().await.unwrap();
    assert_eq!(stop.status(), 200);
}
