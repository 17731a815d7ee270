//! Integration tests for Lark Bot.
//!
//! Drives the webhook endpoints and the event processor end to end, with
//! wiremock standing in for the completion backend and the Feishu API.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use serde_json::{json, Value};
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use lark_bot::{
    build_router, create_state, spawn_processor, AppState, CompletionGateway, CompletionRequest,
    EventRouter, FeishuClient, GatewayError, InboundEvent, OpenAiGateway, ResilientGateway,
    RetryConfig, Speaker,
};
use lark_common::{Config, FeishuConfig, OpenAiConfig};

/// Canned backend for tests where the completion content does not matter.
struct EchoGateway;

#[async_trait::async_trait]
impl CompletionGateway for EchoGateway {
    async fn complete(&self, request: CompletionRequest) -> Result<String, GatewayError> {
        Ok(format!("echo: {}", request.user_text))
    }
}

/// Test helper to create a test router plus the state behind it.
fn create_test_app() -> (
    axum::Router,
    Arc<AppState>,
    tokio::sync::mpsc::Receiver<InboundEvent>,
) {
    let (state, rx) = create_state(&Config::default(), Arc::new(EchoGateway));
    (build_router(Arc::clone(&state)), state, rx)
}

/// Helper to make a JSON request.
async fn request_json(
    app: &axum::Router,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let request = if let Some(b) = body {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&b).unwrap()))
            .unwrap()
    } else {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);

    (status, json)
}

/// A v2 message-receive envelope as Feishu delivers it.
fn message_payload(event_id: &str, text: &str) -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "event_id": event_id,
            "event_type": "im.message.receive_v1",
            "create_time": "1700000000000"
        },
        "event": {
            "sender": {
                "sender_id": { "open_id": "ou_u1" },
                "sender_type": "user"
            },
            "message": {
                "message_id": "om_1",
                "chat_id": "oc_chat1",
                "chat_type": "p2p",
                "message_type": "text",
                "content": json!({ "text": text }).to_string()
            }
        }
    })
}

/// A card-action callback envelope.
fn card_payload(event_id: &str, value: Value, option: Option<&str>) -> Value {
    json!({
        "schema": "2.0",
        "header": {
            "event_id": event_id,
            "event_type": "card.action.trigger",
            "create_time": "1700000002000"
        },
        "event": {
            "operator": { "open_id": "ou_u1" },
            "action": {
                "tag": "select_static",
                "value": value,
                "option": option
            },
            "context": { "open_chat_id": "oc_chat1" }
        }
    })
}

/// Wait until the user's history holds `len` turns, or fail after 2 seconds.
async fn wait_for_history(state: &Arc<AppState>, user_id: &str, len: usize) -> Vec<lark_bot::Turn> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let history = state.sessions.history(user_id).await;
        if history.len() >= len {
            return history;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "history for {} never reached {} turns (got {})",
                user_id,
                len,
                history.len()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Check Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let (app, _state, _rx) = create_test_app();

    let (status, json) = request_json(&app, Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "lark-bot");
}

#[tokio::test]
async fn test_ready_check() {
    let (app, _state, _rx) = create_test_app();

    let (status, json) = request_json(&app, Method::GET, "/ready", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ready");
}

#[tokio::test]
async fn test_ready_check_closed_channel() {
    let (state, rx) = create_state(&Config::default(), Arc::new(EchoGateway));
    let app = build_router(state);

    // Drop the receiver to close the channel
    drop(rx);

    let (status, json) = request_json(&app, Method::GET, "/ready", None).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(json["status"], "not_ready");
}

#[tokio::test]
async fn test_ping() {
    let (app, _state, _rx) = create_test_app();

    let (status, json) = request_json(&app, Method::GET, "/ping", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["message"], "pong");
}

// ─────────────────────────────────────────────────────────────────────────────
// Event Webhook Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_url_verification_challenge() {
    let (app, _state, _rx) = create_test_app();

    let payload = json!({
        "challenge": "c-123",
        "token": "t",
        "type": "url_verification"
    });

    let (status, json) = request_json(&app, Method::POST, "/webhook/event", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["challenge"], "c-123");
}

#[tokio::test]
async fn test_message_event_is_queued() {
    let (app, _state, mut rx) = create_test_app();

    let (status, json) = request_json(
        &app,
        Method::POST,
        "/webhook/event",
        Some(message_payload("evt-q1", "hello")),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);

    match rx.try_recv().unwrap() {
        InboundEvent::MessageReceived { event_id, text, .. } => {
            assert_eq!(event_id, "evt-q1");
            assert_eq!(text, "hello");
        }
        other => panic!("expected message event, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unsupported_event_kind_is_acknowledged() {
    let (app, _state, mut rx) = create_test_app();

    let payload = json!({
        "schema": "2.0",
        "header": {
            "event_id": "evt-u1",
            "event_type": "im.chat.updated_v1",
            "create_time": "1700000000000"
        },
        "event": {}
    });

    let (status, json) = request_json(&app, Method::POST, "/webhook/event", Some(payload)).await;

    // Acknowledged so the platform stops redelivering, but nothing queued
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["success"], true);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_event_webhook_invalid_json() {
    let (app, _state, _rx) = create_test_app();

    let request = Request::builder()
        .method(Method::POST)
        .uri("/webhook/event")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("not valid json"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_message_flow_records_both_turns() {
    let (app, state, rx) = create_test_app();
    let processor = spawn_processor(Arc::clone(&state.router), None, rx);

    let (status, _) = request_json(
        &app,
        Method::POST,
        "/webhook/event",
        Some(message_payload("evt-f1", "hello")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let history = wait_for_history(&state, "ou_u1", 2).await;
    assert_eq!(history[0].speaker, Speaker::User);
    assert_eq!(history[0].text, "hello");
    assert_eq!(history[1].speaker, Speaker::Assistant);
    assert_eq!(history[1].text, "echo: hello");

    processor.abort();
}

#[tokio::test]
async fn test_redelivered_event_records_one_exchange() {
    let (app, state, rx) = create_test_app();
    let processor = spawn_processor(Arc::clone(&state.router), None, rx);

    // The platform redelivers with the same event id
    for _ in 0..2 {
        let (status, _) = request_json(
            &app,
            Method::POST,
            "/webhook/event",
            Some(message_payload("evt-d1", "once")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    wait_for_history(&state, "ou_u1", 2).await;
    // Give the duplicate a chance to land
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(state.sessions.history("ou_u1").await.len(), 2);
    assert_eq!(
        state.sessions.last_event_id("ou_u1").await.as_deref(),
        Some("evt-d1")
    );

    processor.abort();
}

// ─────────────────────────────────────────────────────────────────────────────
// Card Webhook Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_card_webhook_challenge() {
    let (app, _state, _rx) = create_test_app();

    let payload = json!({
        "challenge": "c-456",
        "type": "url_verification"
    });

    let (status, json) = request_json(&app, Method::POST, "/webhook/card", Some(payload)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["challenge"], "c-456");
}

#[tokio::test]
async fn test_card_select_role_updates_session() {
    let (app, state, _rx) = create_test_app();

    let (status, json) = request_json(
        &app,
        Method::POST,
        "/webhook/card",
        Some(card_payload(
            "card-1",
            json!({ "action": "select-role" }),
            Some("poet"),
        )),
    )
    .await;

    // The updated settings card comes back in the HTTP response
    assert_eq!(status, StatusCode::OK);
    assert!(json.to_string().contains("poet"));
    assert_eq!(state.sessions.role("ou_u1").await.as_deref(), Some("poet"));
}

#[tokio::test]
async fn test_card_reset_history_clears_turns() {
    let (app, state, _rx) = create_test_app();
    state
        .sessions
        .append_turn("ou_u1", Speaker::User, "hello")
        .await;
    state
        .sessions
        .append_turn("ou_u1", Speaker::Assistant, "hi")
        .await;

    let (status, json) = request_json(
        &app,
        Method::POST,
        "/webhook/card",
        Some(card_payload(
            "card-2",
            json!({ "action": "reset-history" }),
            None,
        )),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(json.to_string().contains("History cleared"));
    assert!(state.sessions.history("ou_u1").await.is_empty());
    // The role survives the reset
    assert!(state.sessions.role("ou_u1").await.is_some());
}

#[tokio::test]
async fn test_card_unknown_role_returns_error_card() {
    let (app, state, _rx) = create_test_app();

    let (status, json) = request_json(
        &app,
        Method::POST,
        "/webhook/card",
        Some(card_payload(
            "card-3",
            json!({ "action": "select-role" }),
            Some("pirate"),
        )),
    )
    .await;

    // 200 with an error card; the platform renders it in place
    assert_eq!(status, StatusCode::OK);
    assert!(json.to_string().contains("Action failed"));
    assert!(!state.sessions.contains("ou_u1"));
}

#[tokio::test]
async fn test_redelivered_card_action_gets_empty_ack() {
    let (app, state, _rx) = create_test_app();

    let payload = card_payload("card-4", json!({ "action": "select-role" }), Some("poet"));

    let (_, first) =
        request_json(&app, Method::POST, "/webhook/card", Some(payload.clone())).await;
    let (status, second) = request_json(&app, Method::POST, "/webhook/card", Some(payload)).await;

    assert!(first.to_string().contains("poet"));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second, json!({}));
    assert_eq!(state.sessions.role("ou_u1").await.as_deref(), Some("poet"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Completion Backend Tests
// ─────────────────────────────────────────────────────────────────────────────

fn gateway_config(base_url: &str) -> OpenAiConfig {
    OpenAiConfig {
        api_key: "test-key".to_string(),
        base_url: base_url.to_string(),
        model: "gpt-4o-mini".to_string(),
        timeout_secs: 5,
        max_retries: 2,
        base_backoff_ms: 1,
        max_backoff_ms: 5,
        ..OpenAiConfig::default()
    }
}

fn completion_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "choices": [
            {
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }
        ]
    })
}

#[tokio::test]
async fn test_completion_request_and_response_shape() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("mocked reply")))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = OpenAiGateway::new(&gateway_config(&server.uri()));
    let request = CompletionRequest {
        system_prompt: Some("You are a helpful assistant.".to_string()),
        history: vec![],
        user_text: "hello".to_string(),
    };

    let reply = gateway.complete(request).await.unwrap();
    assert_eq!(reply, "mocked reply");

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["model"], "gpt-4o-mini");
    let messages = body["messages"].as_array().unwrap();
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["role"], "user");
    assert_eq!(messages[1]["content"], "hello");
    let auth = requests[0].headers.get("authorization").unwrap();
    assert_eq!(auth.to_str().unwrap(), "Bearer test-key");
}

#[tokio::test]
async fn test_transient_upstream_error_is_retried() {
    let server = MockServer::start().await;
    // First attempt hits the 500; the retry falls through to the 200
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream exploded"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("recovered")))
        .expect(1)
        .mount(&server)
        .await;

    let config = gateway_config(&server.uri());
    let gateway = ResilientGateway::new(
        Arc::new(OpenAiGateway::new(&config)),
        RetryConfig::from_config(&config),
    );

    let reply = gateway
        .complete(CompletionRequest {
            system_prompt: None,
            history: vec![],
            user_text: "are you there".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(reply, "recovered");
}

#[tokio::test]
async fn test_upstream_rejection_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .expect(1)
        .mount(&server)
        .await;

    let config = gateway_config(&server.uri());
    let gateway = ResilientGateway::new(
        Arc::new(OpenAiGateway::new(&config)),
        RetryConfig::from_config(&config),
    );

    let err = gateway
        .complete(CompletionRequest {
            system_prompt: None,
            history: vec![],
            user_text: "hello".to_string(),
        })
        .await
        .unwrap_err();

    match err {
        GatewayError::Rejected { status, .. } => assert_eq!(status, 401),
        other => panic!("expected rejection, got {:?}", other),
    }
    // A single request proves no retry happened
    assert_eq!(server.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_slow_upstream_maps_to_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("too late"))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let config = OpenAiConfig {
        timeout_secs: 1,
        ..gateway_config(&server.uri())
    };
    let gateway = OpenAiGateway::new(&config);

    let err = gateway
        .complete(CompletionRequest {
            system_prompt: None,
            history: vec![],
            user_text: "hello".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Timeout(_)));
}

#[tokio::test]
async fn test_malformed_upstream_body_is_unavailable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
        .mount(&server)
        .await;

    let gateway = OpenAiGateway::new(&gateway_config(&server.uri()));

    let err = gateway
        .complete(CompletionRequest {
            system_prompt: None,
            history: vec![],
            user_text: "hello".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, GatewayError::Unavailable(_)));
}

#[tokio::test]
async fn test_message_flow_against_http_upstream() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hi there")))
        .expect(1)
        .mount(&server)
        .await;

    let config = Config {
        openai: gateway_config(&server.uri()),
        ..Config::default()
    };

    let gateway: Arc<dyn CompletionGateway> = Arc::new(ResilientGateway::new(
        Arc::new(OpenAiGateway::new(&config.openai)),
        RetryConfig::from_config(&config.openai),
    ));
    let (state, rx) = create_state(&config, gateway);
    let app = build_router(Arc::clone(&state));
    let processor = spawn_processor(Arc::clone(&state.router), None, rx);

    let (status, _) = request_json(
        &app,
        Method::POST,
        "/webhook/event",
        Some(message_payload("evt-h1", "hello")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let history = wait_for_history(&state, "ou_u1", 2).await;
    assert_eq!(history[1].text, "hi there");

    processor.abort();
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound Delivery Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_reply_is_delivered_to_platform() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/v3/tenant_access_token/internal"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "ok",
            "tenant_access_token": "tat-test",
            "expire": 7200
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/im/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 0,
            "msg": "success"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let feishu_config = FeishuConfig {
        app_id: "cli_test".to_string(),
        app_secret: "secret".to_string(),
        base_url: server.uri(),
        ..FeishuConfig::default()
    };
    let client = Arc::new(FeishuClient::new(&feishu_config));

    let (state, rx) = create_state(&Config::default(), Arc::new(EchoGateway));
    let app = build_router(Arc::clone(&state));
    let processor = spawn_processor(Arc::clone(&state.router), Some(client), rx);

    let (status, _) = request_json(
        &app,
        Method::POST,
        "/webhook/event",
        Some(message_payload("evt-out1", "hello")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Wait for the reply to land on the mocked platform API
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    let sent = loop {
        let requests = server.received_requests().await.unwrap();
        if let Some(send) = requests
            .into_iter()
            .find(|r| r.url.path() == "/im/v1/messages")
        {
            break send;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("reply never reached the platform API");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // Group chat id, so the receive_id_type query flips to chat_id
    assert_eq!(sent.url.query(), Some("receive_id_type=chat_id"));
    let body: Value = serde_json::from_slice(&sent.body).unwrap();
    assert_eq!(body["receive_id"], "oc_chat1");
    assert_eq!(body["msg_type"], "text");
    assert!(body["content"].as_str().unwrap().contains("echo: hello"));
    let auth = sent.headers.get("authorization").unwrap();
    assert_eq!(auth.to_str().unwrap(), "Bearer tat-test");

    processor.abort();
}

// Keep EventRouter in the public surface exercised from the outside
#[tokio::test]
async fn test_router_is_reachable_through_state() {
    let (_, state, _rx) = create_test_app();
    let router: &Arc<EventRouter> = &state.router;

    let outcome = router
        .dispatch(InboundEvent::MessageRead {
            event_id: "evt-r1".to_string(),
            user_id: "ou_u1".to_string(),
            timestamp: 0,
        })
        .await
        .unwrap();

    assert_eq!(outcome.label(), "acknowledged");
    assert_eq!(
        state.sessions.last_event_id("ou_u1").await.as_deref(),
        Some("evt-r1")
    );
}
