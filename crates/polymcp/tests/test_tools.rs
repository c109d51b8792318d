mod common;

use std::time::Duration;

use common::{SseReader, TestClient, fixture_registry, spawn, test_config};
use serde_json::json;

#[tokio::test]
async fn echo_tool_round_trip() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let body = client
        .request(2, "tools/call", json!({"name": "echo", "arguments": {"message": "hi"}}))
        .await;
    assert_eq!(
        body["result"]["content"],
        json!([{"type": "text", "text": "Echo: hi"}])
    );
}

#[tokio::test]
async fn tools_list_is_idempotent_snapshot() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let first = client.request(2, "tools/list", json!({})).await;
    let second = client.request(3, "tools/list", json!({})).await;
    assert_eq!(first["result"], second["result"]);
    let names: Vec<&str> = first["result"]["tools"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|tool| tool["name"].as_str())
        .collect();
    assert!(names.contains(&"echo"));
}

#[tokio::test]
async fn schema_violation_is_invalid_params_with_path() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let body = client
        .request(2, "tools/call", json!({"name": "echo", "arguments": {"message": 42}}))
        .await;
    assert_eq!(body["error"]["code"], -32602);
    assert_eq!(body["error"]["data"]["path"], "/message");

    let body = client
        .request(3, "tools/call", json!({"name": "echo", "arguments": {}}))
        .await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn unknown_tool_is_invalid_params() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let body = client
        .request(2, "tools/call", json!({"name": "nope", "arguments": {}}))
        .await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn handler_panic_is_contained() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let body = client
        .request(2, "tools/call", json!({"name": "boom", "arguments": {}}))
        .await;
    assert_eq!(body["error"]["code"], -32603);
    // The panic payload stays on the server; the peer sees a correlation id.
    assert_eq!(body["error"]["message"], "internal server error");
    assert!(body["error"]["data"]["correlationId"].is_string());

    // The session survives a handler panic.
    let pong = client.request(3, "ping", json!({})).await;
    assert_eq!(pong["result"], json!({}));
}

#[tokio::test]
async fn resource_read_round_trip() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let listed = client.request(2, "resources/list", json!({})).await;
    assert_eq!(listed["result"]["resources"][0]["uri"], "memo://greeting");

    let body = client
        .request(3, "resources/read", json!({"uri": "memo://greeting"}))
        .await;
    assert_eq!(body["result"]["contents"][0]["text"], "hello from resource");
}

#[tokio::test]
async fn prompt_get_round_trip() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let listed = client.request(2, "prompts/list", json!({})).await;
    assert_eq!(listed["result"]["prompts"][0]["name"], "greet");

    let body = client.request(3, "prompts/get", json!({"name": "greet"})).await;
    assert_eq!(body["result"]["messages"][0]["role"], "user");
    assert_eq!(
        body["result"]["messages"][0]["content"]["text"],
        "Say hello"
    );
}

#[tokio::test]
async fn registry_replacement_notifies_list_changed() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let stream = client.open_stream(None).await;
    let mut reader = SseReader::new(stream);

    fixture.server.replace_registry(fixture_registry()).await;

    let event = reader.expect_event(Duration::from_secs(2)).await;
    assert_eq!(event.data["method"], "notifications/tools/list_changed");
    let event = reader.expect_event(Duration::from_secs(2)).await;
    assert_eq!(event.data["method"], "notifications/resources/list_changed");
    let event = reader.expect_event(Duration::from_secs(2)).await;
    assert_eq!(event.data["method"], "notifications/prompts/list_changed");
}

#[tokio::test]
async fn cancellation_is_cooperative() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let call_client = TestClient {
        http: client.http.clone(),
        base: client.base.clone(),
        session: client.session.clone(),
    };
    let call = tokio::spawn(async move {
        call_client
            .request(7, "tools/call", json!({"name": "waiter", "arguments": {}}))
            .await
    });

    // Give the handler a moment to start, then cancel request 7.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let accepted = client
        .notify("notifications/cancelled", json!({"requestId": 7}))
        .await;
    assert_eq!(accepted.status(), 202);

    let body = call.await.unwrap();
    assert_eq!(body["error"]["code"], -32800);
}
