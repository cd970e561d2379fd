mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use common::*;
use serde_json::json;
use std::time::Duration;
use support_service::config::ChatConfig;
use support_service::models::TenantStatus;
use support_service::services::synthesizer::PROMPT_CONTRACT;
use tower::ServiceExt;

async fn open_session(app: &TestApp) -> String {
    let (status, body) = app
        .post_json("/api/chat/session", json!({ "employeeId": EMPLOYEE_ID }))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    body["sessionId"].as_str().expect("session id").to_string()
}

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let (status, body) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["relay"], "recording");
}

#[tokio::test]
async fn metrics_endpoint_is_plain_text() {
    let app = TestApp::spawn().await;

    let response = app
        .router()
        .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}

#[tokio::test]
async fn session_then_query_round_trip() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    let session_id = open_session(&app).await;

    let (status, body) = app
        .post_json(
            "/api/chat/query",
            json!({ "sessionId": session_id, "message": DENTAL_QUESTION }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["answer"], DEFAULT_ANSWER);
    assert_eq!(body["escalated"], false);
    assert_eq!(body["sessionId"], session_id.as_str());
    assert_eq!(body["sources"].as_array().unwrap().len(), 2);

    let (status, history) = app
        .get(&format!("/api/chat/history/{}", session_id))
        .await;
    assert_eq!(status, StatusCode::OK);
    let messages = history["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[1]["role"], "assistant");
}

#[tokio::test]
async fn body_domain_takes_precedence_over_headers() {
    let app = TestApp::spawn().await;

    let (status, body) = app
        .post_json(
            "/api/chat/session",
            json!({ "domain": "https://www.unknown-corp.com/", "employeeId": EMPLOYEE_ID }),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("unknown-corp.com"));
    assert!(body["hint"].as_str().is_some());
}

#[tokio::test]
async fn alternate_domain_resolves_the_tenant() {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .post_json(
            "/api/chat/session",
            json!({ "domain": "acme-benefits.com", "employeeId": EMPLOYEE_ID }),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn inactive_tenant_is_forbidden() {
    let app = TestApp::spawn().await;
    let mut dormant = acme_tenant();
    dormant.domain = "dormant.com".to_string();
    dormant.alternate_domains.clear();
    dormant.status = TenantStatus::Inactive;
    app.store.seed_tenant(dormant);

    let (status, body) = app
        .post_json(
            "/api/chat/session",
            json!({ "domain": "dormant.com", "employeeId": EMPLOYEE_ID }),
        )
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");
}

#[tokio::test]
async fn unknown_employee_is_not_found() {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .post_json("/api/chat/session", json!({ "employeeId": "E999" }))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn missing_session_is_not_found() {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .post_json(
            "/api/chat/query",
            json!({ "sessionId": "does-not-exist", "message": DENTAL_QUESTION }),
        )
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn empty_message_is_rejected() {
    let app = TestApp::spawn().await;
    let session_id = open_session(&app).await;

    let (status, body) = app
        .post_json(
            "/api/chat/query",
            json!({ "sessionId": session_id, "message": "" }),
        )
        .await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "validation_failed");
}

#[tokio::test]
async fn rate_limit_returns_retry_after() {
    let mut config = test_config();
    config.chat = ChatConfig {
        rate_limit_requests: 2,
        ..ChatConfig::default()
    };
    let app = TestApp::with_config(config).await;
    let session_id = open_session(&app).await;
    let body = json!({ "sessionId": session_id, "message": DENTAL_QUESTION });

    for _ in 0..2 {
        let (status, _) = app.post_json("/api/chat/query", body.clone()).await;
        assert_eq!(status, StatusCode::OK);
    }

    let request = Request::post("/api/chat/query")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ORIGIN, "https://acme.com")
        .body(Body::from(body.to_string()))
        .unwrap();
    let response = app.router().oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
}

#[tokio::test]
async fn second_log_request_conflicts() {
    let app = TestApp::spawn().await;
    let session_id = open_session(&app).await;
    let body = json!({ "sessionId": session_id, "notes": "Admission on Monday" });

    let (status, first) = app.post_json("/api/chat/log-request", body.clone()).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(first["status"], "pending");

    let (status, _) = app.post_json("/api/chat/log-request", body).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let events = app.relay.wait_for_events(1).await;
    assert_eq!(events.len(), 1);
}

#[tokio::test]
async fn escalated_answer_is_flagged_in_response() {
    let app = TestApp::spawn().await;
    let session_id = open_session(&app).await;
    app.completer.push_answer(PROMPT_CONTRACT.refusal);

    let (status, body) = app
        .post_json(
            "/api/chat/query",
            json!({ "sessionId": session_id, "message": UNKNOWN_QUESTION }),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["escalated"], true);
}

#[tokio::test]
async fn webhook_is_not_found_when_disabled() {
    let app = TestApp::spawn().await;

    let (status, _) = app
        .post_json("/api/relay/webhook", json!({ "update_id": 1 }))
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn responses_carry_request_id_and_security_headers() {
    let app = TestApp::spawn().await;

    let response = app
        .router()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert!(response.headers().contains_key("x-request-id"));
    assert!(response.headers().contains_key("x-content-type-options"));
}

#[tokio::test]
async fn query_completes_after_client_disconnects() {
    let app = TestApp::spawn().await;
    app.seed_dental_knowledge();
    let session = app.start_session().await;
    app.completer.set_delay(Duration::from_millis(200));

    let request = Request::post("/api/chat/query")
        .header(header::CONTENT_TYPE, "application/json")
        .header(header::ORIGIN, "https://acme.com")
        .body(Body::from(
            json!({ "sessionId": session.session_id, "message": DENTAL_QUESTION }).to_string(),
        ))
        .unwrap();
    let dropped = tokio::time::timeout(Duration::from_millis(50), app.router().oneshot(request)).await;
    assert!(dropped.is_err(), "request should still be waiting on the provider");

    tokio::time::sleep(Duration::from_millis(500)).await;

    let messages = app.store.messages(&app.partition(), session.conversation_id);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].content, DEFAULT_ANSWER);
}
