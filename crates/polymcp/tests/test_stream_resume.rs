mod common;

use std::time::Duration;

use common::{SseReader, TestClient, spawn, test_config};
use futures::StreamExt;
use polymcp::SessionId;
use serde_json::json;

#[tokio::test]
async fn stream_delivers_in_cursor_order() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;
    let session: SessionId = client.session.clone().unwrap().into();

    for n in 1..=5 {
        fixture
            .server
            .send_notification(&session, "custom/test", Some(json!({ "n": n })))
            .await
            .unwrap();
    }

    let mut reader = SseReader::new(client.open_stream(None).await);
    let mut last = 0u64;
    for n in 1..=5 {
        let event = reader.expect_event(Duration::from_secs(2)).await;
        let cursor = event.id.expect("cursor on event");
        assert!(cursor > last, "cursors must be strictly increasing");
        last = cursor;
        assert_eq!(event.data["params"]["n"], n);
    }
}

#[tokio::test]
async fn resume_replays_strictly_after_cursor() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;
    let session: SessionId = client.session.clone().unwrap().into();

    for n in 1..=3 {
        fixture
            .server
            .send_notification(&session, "custom/test", Some(json!({ "n": n })))
            .await
            .unwrap();
    }

    // First connection reads everything, then disconnects.
    {
        let mut reader = SseReader::new(client.open_stream(None).await);
        for _ in 1..=3 {
            reader.expect_event(Duration::from_secs(2)).await;
        }
    }

    for n in 4..=6 {
        fixture
            .server
            .send_notification(&session, "custom/test", Some(json!({ "n": n })))
            .await
            .unwrap();
    }

    // Reconnect with the last observed cursor; only 4..=6 arrive.
    let mut reader = SseReader::new(client.open_stream(Some(3)).await);
    for n in 4..=6 {
        let event = reader.expect_event(Duration::from_secs(2)).await;
        assert!(event.id.unwrap() > 3);
        assert_eq!(event.data["params"]["n"], n);
    }
}

#[tokio::test]
async fn resume_then_live_tail() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;
    let session: SessionId = client.session.clone().unwrap().into();

    fixture
        .server
        .send_notification(&session, "custom/test", Some(json!({ "n": 1 })))
        .await
        .unwrap();

    let mut reader = SseReader::new(client.open_stream(None).await);
    let first = reader.expect_event(Duration::from_secs(2)).await;
    assert_eq!(first.data["params"]["n"], 1);

    // Published while connected: arrives over the live tail.
    fixture
        .server
        .send_notification(&session, "custom/test", Some(json!({ "n": 2 })))
        .await
        .unwrap();
    let second = reader.expect_event(Duration::from_secs(2)).await;
    assert_eq!(second.data["params"]["n"], 2);
    assert!(second.id.unwrap() > first.id.unwrap());
}

#[tokio::test]
async fn stale_cursor_requires_reinitialize() {
    let config = test_config().stream_retention(3);
    let fixture = spawn(config).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;
    let session: SessionId = client.session.clone().unwrap().into();

    for n in 1..=10 {
        fixture
            .server
            .send_notification(&session, "custom/test", Some(json!({ "n": n })))
            .await
            .unwrap();
    }

    // Cursor 1 fell out of the replay window.
    let response = client.open_stream(Some(1)).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn stream_requires_accept_header() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let response = client
        .http
        .get(&client.base)
        .header("Mcp-Session-Id", client.session.clone().unwrap())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 406);
}

#[tokio::test]
async fn stream_for_unknown_session_is_not_found() {
    let fixture = spawn(test_config()).await;
    let mut client = TestClient::new(&fixture.base);
    client.session = Some("no-such-session".to_string());
    let response = client.open_stream(None).await;
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn heartbeats_are_comment_frames() {
    let config = test_config().heartbeat_interval(Duration::from_millis(50));
    let fixture = spawn(config).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;

    let response = client.open_stream(None).await;
    let mut body = response.bytes_stream();
    let mut collected = String::new();
    let saw_heartbeat = |collected: &str| {
        collected
            .lines()
            .any(|line| line.starts_with(':') && line.contains("ping"))
    };
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout_at(deadline, body.next()).await {
            Ok(Some(Ok(chunk))) => {
                collected.push_str(&String::from_utf8_lossy(&chunk));
                if saw_heartbeat(&collected) {
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(
        saw_heartbeat(&collected),
        "expected a comment heartbeat, got: {collected:?}"
    );
}

#[tokio::test]
async fn overflow_terminates_session() {
    let config = test_config().stream_high_water(4);
    let fixture = spawn(config).await;
    let mut client = TestClient::new(&fixture.base);
    client.initialize().await;
    let session: SessionId = client.session.clone().unwrap().into();

    // No consumer attached: publishes past the high-water mark overflow.
    for n in 1..=10 {
        let _ = fixture
            .server
            .send_notification(&session, "custom/test", Some(json!({ "n": n })))
            .await;
    }

    let response = client
        .post(json!({"jsonrpc": "2.0", "id": 2, "method": "ping"}))
        .await;
    assert_eq!(response.status(), 404, "overflowed session must be gone");
}
