//! Gateway integration tests: start a real gateway and drive it over HTTP.
//!
//! Run with: `cargo test -p threadline-gateway --test integration`

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};

use threadline_agent::EchoRuntime;
use threadline_core::config::Config;
use threadline_core::store::{ConversationStore, JsonConversationStore};
use threadline_gateway::GatewayState;

/// Find an available port.
fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

struct TestGateway {
    state: Arc<GatewayState>,
    base: String,
    _dir: tempfile::TempDir,
}

/// Start a gateway backed by the echo runtime and a JSON store in a tempdir.
async fn start_test_gateway(word_delay: Duration) -> TestGateway {
    let port = find_free_port();
    let dir = tempfile::tempdir().unwrap();

    let store: Arc<dyn ConversationStore> =
        Arc::new(JsonConversationStore::new(dir.path().to_path_buf()));
    let runtime = Arc::new(EchoRuntime::new(word_delay));
    let state = Arc::new(GatewayState::new(Arc::new(Config::default()), store, runtime));

    let state_clone = state.clone();
    tokio::spawn(async move {
        let _ = threadline_gateway::start_gateway(state_clone, port).await;
    });

    let base = format!("http://127.0.0.1:{port}");
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if reqwest::get(format!("{base}/health")).await.is_ok() {
            break;
        }
    }

    TestGateway {
        state,
        base,
        _dir: dir,
    }
}

/// Parse the `data:` lines of an SSE body into JSON frames.
fn parse_frames(body: &str) -> Vec<Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).unwrap())
        .collect()
}

fn frame_types(frames: &[Value]) -> Vec<&str> {
    frames.iter().map(|f| f["type"].as_str().unwrap()).collect()
}

#[tokio::test]
async fn test_health_endpoint() {
    let gw = start_test_gateway(Duration::ZERO).await;

    let resp = reqwest::get(format!("{}/health", gw.base)).await.unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["active"], 0);
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_chat_returns_final_result() {
    let gw = start_test_gateway(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "hello world"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["response"], "hello world");
    assert!(body["thread_id"].is_string());
    assert!(body["duration_ms"].is_u64());

    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["metadata"]["order_index"], 1);
}

#[tokio::test]
async fn test_stream_emits_lifecycle_events() {
    let gw = start_test_gateway(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/chat/stream", gw.base))
        .json(&json!({"message": "one two three"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(
        resp.headers()[reqwest::header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream")
    );
    let thread_id = resp.headers()["x-thread-id"].to_str().unwrap().to_string();

    let frames = parse_frames(&resp.text().await.unwrap());
    assert_eq!(
        frame_types(&frames),
        vec!["message_start", "content", "content", "content", "message_end", "done"]
    );
    assert!(frames.iter().all(|f| f["thread_id"] == thread_id.as_str()));

    let done = frames.last().unwrap();
    assert_eq!(done["messages"].as_array().unwrap().len(), 2);
    assert!(gw.state.registry.list_active().is_empty());
}

#[tokio::test]
async fn test_conversation_continues_on_same_thread() {
    let gw = start_test_gateway(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let first: Value = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "first"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let thread_id = first["thread_id"].as_str().unwrap();

    let second: Value = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "second", "thread_id": thread_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(second["thread_id"], thread_id);
    // Only the current turn is returned.
    assert_eq!(second["messages"].as_array().unwrap().len(), 2);
    assert_eq!(second["messages"][0]["content"], "second");
}

#[tokio::test]
async fn test_unknown_thread_returns_404() {
    let gw = start_test_gateway(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "hi", "thread_id": "does-not-exist"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_found");

    let resp = client
        .post(format!("{}/chat/stop", gw.base))
        .json(&json!({"thread_id": "does-not-exist"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_stop_idle_thread_reports_not_running() {
    let gw = start_test_gateway(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let first: Value = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "hi"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let body: Value = client
        .post(format!("{}/chat/stop", gw.base))
        .json(&json!({"thread_id": first["thread_id"]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "not_running");
    assert_eq!(body["cancelled"], false);
}

#[tokio::test]
async fn test_stop_mid_stream_ends_with_stopped() {
    let gw = start_test_gateway(Duration::from_millis(200)).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{}/chat/stream", gw.base))
        .json(&json!({"message": "a b c d e f g h i j k l m n o p"}))
        .send()
        .await
        .unwrap();
    let thread_id = resp.headers()["x-thread-id"].to_str().unwrap().to_string();

    let active: Value = reqwest::get(format!("{}/chat/active", gw.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(active["count"], 1);
    assert_eq!(active["threads"][0], thread_id.as_str());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stop: Value = client
        .post(format!("{}/chat/stop", gw.base))
        .json(&json!({"thread_id": thread_id}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stop["status"], "stopped");
    assert_eq!(stop["cancelled"], true);

    let frames = parse_frames(&resp.text().await.unwrap());
    let types = frame_types(&frames);
    assert_eq!(types.last(), Some(&"stopped"));
    assert!(!types.contains(&"done"));
    assert!(gw.state.registry.list_active().is_empty());
}

#[tokio::test]
async fn test_stopped_run_once_returns_499() {
    let gw = start_test_gateway(Duration::from_millis(200)).await;
    let client = reqwest::Client::new();

    let created: Value = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "x"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let thread_id = created["thread_id"].as_str().unwrap().to_string();

    let chat = {
        let client = client.clone();
        let url = format!("{}/chat", gw.base);
        let thread_id = thread_id.clone();
        tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({"message": "a b c d e f g h i j", "thread_id": thread_id}))
                .send()
                .await
                .unwrap()
        })
    };

    for _ in 0..50 {
        if !gw.state.registry.list_active().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let stop: Value = client
        .post(format!("{}/chat/stop", gw.base))
        .json(&json!({"thread_id": thread_id, "force": true}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stop["cancelled"], true);

    let resp = chat.await.unwrap();
    assert_eq!(resp.status().as_u16(), 499);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "cancelled");
}

#[tokio::test]
async fn test_thread_settings_are_stored_and_listed() {
    let gw = start_test_gateway(Duration::ZERO).await;
    let client = reqwest::Client::new();

    let body: Value = client
        .post(format!("{}/chat", gw.base))
        .json(&json!({"message": "first thread"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let thread_id = body["thread_id"].as_str().unwrap().to_string();

    let resp = client
        .patch(format!("{}/conversations/{thread_id}/settings", gw.base))
        .json(&json!({"model": "small-model", "api_key": "sk-secret", "recursion_limit": 4}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "updated");

    let stored = gw.state.store.settings(&thread_id.as_str().into()).await.unwrap();
    let run = gw.state.config.run_config(&thread_id.as_str().into(), Some(&stored));
    assert_eq!(run.model.model, "small-model");
    assert_eq!(run.recursion_limit, 4);

    let listed: Value = reqwest::get(format!("{}/conversations", gw.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let listed = listed.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["thread_id"], thread_id.as_str());
    assert_eq!(listed[0]["settings"]["model"], "small-model");
    assert!(listed[0]["settings"].get("api_key").is_none());
}

#[tokio::test]
async fn test_settings_for_unknown_thread_returns_404() {
    let gw = start_test_gateway(Duration::ZERO).await;

    let resp = reqwest::Client::new()
        .patch(format!("{}/conversations/missing/settings", gw.base))
        .json(&json!({"model": "x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "not_found");
}
