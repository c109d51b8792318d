mod common;

use std::num::NonZeroU32;

use common::{TestClient, fixture_registry, spawn_with, test_config};
use polymcp::middleware::{BearerAuth, RateLimit};
use serde_json::json;

#[tokio::test]
async fn bearer_auth_rejects_unauthenticated_requests() {
    let fixture = spawn_with(test_config(), fixture_registry(), |builder| {
        builder.middleware(BearerAuth::static_token("secret", "alice"))
    })
    .await;
    let client = TestClient::new(&fixture.base);

    let response = client
        .post(TestClient::initialize_body(json!({})))
        .await;
    assert_eq!(response.status(), 401);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32006);
}

#[tokio::test]
async fn bearer_auth_injects_principal() {
    let fixture = spawn_with(test_config(), fixture_registry(), |builder| {
        builder.middleware(BearerAuth::static_token("secret", "alice"))
    })
    .await;
    let http = reqwest::Client::builder()
        .default_headers({
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert(
                reqwest::header::AUTHORIZATION,
                "Bearer secret".parse().unwrap(),
            );
            headers
        })
        .build()
        .unwrap();
    let mut client = TestClient {
        http,
        base: fixture.base.clone(),
        session: None,
    };
    client.initialize().await;

    // The handler reads the principal the middleware attached.
    let body = client
        .request(2, "tools/call", json!({"name": "whoami", "arguments": {}}))
        .await;
    assert_eq!(body["result"]["content"][0]["text"], "alice");
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let fixture = spawn_with(test_config(), fixture_registry(), |builder| {
        builder.middleware(BearerAuth::static_token("secret", "alice"))
    })
    .await;
    let response = reqwest::Client::new()
        .post(&fixture.base)
        .header("content-type", "application/json")
        .header("authorization", "Bearer wrong")
        .body(TestClient::initialize_body(json!({})).to_string())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn rate_limit_maps_to_429() {
    let fixture = spawn_with(test_config(), fixture_registry(), |builder| {
        builder.middleware(RateLimit::per_minute(NonZeroU32::new(3).unwrap()))
    })
    .await;
    let mut client = TestClient::new(&fixture.base);
    // Initialize (1) + initialized notification (2).
    client.initialize().await;

    // Third message passes, fourth is rejected.
    let body = client.request(2, "ping", json!({})).await;
    assert_eq!(body["result"], json!({}));

    let response = client
        .post(json!({"jsonrpc": "2.0", "id": 3, "method": "ping"}))
        .await;
    assert_eq!(response.status(), 429);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32005);
}
