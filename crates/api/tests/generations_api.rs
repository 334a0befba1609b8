//! HTTP-level integration tests for generations, short links, credits, and
//! provider callbacks, run against in-memory stores.

mod common;

use axum::http::StatusCode;
use common::{
    body_json, build_test_app, get, get_auth, post_json, post_json_auth, post_json_with,
    token_for, ADMIN_TOKEN, CALLBACK_TOKEN,
};
use serde_json::json;

const ACCOUNT: i64 = 42;

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_check_returns_ok_without_database() {
    let app = build_test_app().await;
    let response = get(app.router.clone(), "/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-request-id").is_some());

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
    assert!(json.get("db_healthy").is_none());
}

// ---------------------------------------------------------------------------
// Generations
// ---------------------------------------------------------------------------

#[tokio::test]
async fn completed_generation_is_visible_through_short_link() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 10).await;
    let token = token_for(ACCOUNT);

    let response = post_json_auth(
        app.router.clone(),
        "/api/v1/generations",
        &token,
        json!({ "operation": "image-generation", "payload": { "prompt": "a cat" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let task_id = body_json(response).await["data"]["task_id"]
        .as_str()
        .expect("task_id should be a string")
        .to_string();

    app.orchestrator.drain().await;

    let response = get_auth(
        app.router.clone(),
        &format!("/api/v1/generations/{task_id}"),
        &token,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["state"], "completed");
    assert_eq!(json["data"]["result_url"], "https://cdn/x.png");
    assert!(json["data"].get("provider_job_handle").is_none());
    assert!(json["data"].get("receipt_id").is_none());

    let response = get(app.router.clone(), &format!("/api/v1/short-links/{task_id}")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["data"]["result_url"],
        "https://cdn/x.png"
    );

    let response = get_auth(app.router.clone(), "/api/v1/credits/balance", &token).await;
    assert_eq!(body_json(response).await["data"]["balance"], 2);
}

#[tokio::test]
async fn rejected_generation_is_refunded_and_has_no_link() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 10).await;
    let token = token_for(ACCOUNT);

    let response = post_json_auth(
        app.router.clone(),
        "/api/v1/generations",
        &token,
        json!({ "operation": "image-generation", "payload": { "prompt": "reject me" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let task_id = body_json(response).await["data"]["task_id"]
        .as_str()
        .expect("task_id should be a string")
        .to_string();

    app.orchestrator.drain().await;

    let json = body_json(
        get_auth(
            app.router.clone(),
            &format!("/api/v1/generations/{task_id}"),
            &token,
        )
        .await,
    )
    .await;
    assert_eq!(json["data"]["state"], "failed");
    assert_eq!(json["data"]["failure"]["code"], "provider_rejected");

    let response = get(app.router.clone(), &format!("/api/v1/short-links/{task_id}")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = get_auth(app.router.clone(), "/api/v1/credits/balance", &token).await;
    assert_eq!(body_json(response).await["data"]["balance"], 10);
}

#[tokio::test]
async fn insufficient_credits_returns_402() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 3).await;

    let response = post_json_auth(
        app.router.clone(),
        "/api/v1/generations",
        &token_for(ACCOUNT),
        json!({ "operation": "avatar" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body_json(response).await["code"], "INSUFFICIENT_CREDITS");
    assert_eq!(app.orchestrator.active_workers(), 0);
}

#[tokio::test]
async fn synchronous_rejections_map_to_client_errors() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 100).await;
    let token = token_for(ACCOUNT);

    let cases = [
        (json!({ "operation": "hologram" }), StatusCode::BAD_REQUEST, "UNKNOWN_OPERATION"),
        (json!({ "operation": "analysis" }), StatusCode::BAD_REQUEST, "UNROUTABLE_OPERATION"),
        (json!({ "operation": "" }), StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        (
            json!({ "operation": "sticker", "payload": [1, 2] }),
            StatusCode::BAD_REQUEST,
            "VALIDATION_ERROR",
        ),
        (
            json!({ "operation": "video-fast-720" }),
            StatusCode::SERVICE_UNAVAILABLE,
            "PROVIDER_NOT_CONFIGURED",
        ),
    ];

    for (body, status, code) in cases {
        let response =
            post_json_auth(app.router.clone(), "/api/v1/generations", &token, body.clone()).await;
        assert_eq!(response.status(), status, "body: {body}");
        assert_eq!(body_json(response).await["code"], code, "body: {body}");
    }

    let response = get_auth(app.router.clone(), "/api/v1/credits/balance", &token).await;
    assert_eq!(body_json(response).await["data"]["balance"], 100);
}

#[tokio::test]
async fn generations_require_authentication() {
    let app = build_test_app().await;

    let response = post_json(
        app.router.clone(),
        "/api/v1/generations",
        json!({ "operation": "sticker" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = get_auth(app.router.clone(), "/api/v1/credits/balance", "not-a-jwt").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn other_accounts_cannot_see_a_task() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 10).await;

    let response = post_json_auth(
        app.router.clone(),
        "/api/v1/generations",
        &token_for(ACCOUNT),
        json!({ "operation": "sticker" }),
    )
    .await;
    let task_id = body_json(response).await["data"]["task_id"]
        .as_str()
        .expect("task_id should be a string")
        .to_string();
    app.orchestrator.drain().await;

    let response = get_auth(
        app.router.clone(),
        &format!("/api/v1/generations/{task_id}"),
        &token_for(7),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn malformed_task_id_is_rejected() {
    let app = build_test_app().await;
    let response = get(app.router.clone(), "/api/v1/short-links/not-valid!").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Callbacks
// ---------------------------------------------------------------------------

#[tokio::test]
async fn callback_completes_task_and_duplicates_are_accepted() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 12).await;
    let token = token_for(ACCOUNT);

    let response = post_json_auth(
        app.router.clone(),
        "/api/v1/generations",
        &token,
        json!({ "operation": "music", "payload": { "prompt": "lofi" } }),
    )
    .await;
    let task_id = body_json(response).await["data"]["task_id"]
        .as_str()
        .expect("task_id should be a string")
        .to_string();

    // Wait for the submit to record the provider handle.
    for _ in 0..200 {
        let json = body_json(
            get_auth(
                app.router.clone(),
                &format!("/api/v1/generations/{task_id}"),
                &token,
            )
            .await,
        )
        .await;
        if json["data"]["state"] == "pending" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
    }

    let body = json!({ "task_id": "song-1", "result": { "audio_url": "https://cdn/song.mp3" } });
    let uri = format!("/api/v1/callbacks/suno?token={CALLBACK_TOKEN}");
    for _ in 0..2 {
        let response = post_json(app.router.clone(), &uri, body.clone()).await;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    app.orchestrator.drain().await;

    let response = get(app.router.clone(), &format!("/api/v1/short-links/{task_id}")).await;
    assert_eq!(
        body_json(response).await["data"]["result_url"],
        "https://cdn/song.mp3"
    );
    let response = get_auth(app.router.clone(), "/api/v1/credits/balance", &token).await;
    assert_eq!(body_json(response).await["data"]["balance"], 0);
}

#[tokio::test]
async fn callback_requires_token_and_known_provider() {
    let app = build_test_app().await;
    let body = json!({ "task_id": "song-1" });

    let response = post_json(app.router.clone(), "/api/v1/callbacks/suno", body.clone()).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = post_json(
        app.router.clone(),
        "/api/v1/callbacks/suno?token=wrong",
        body.clone(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = post_json(
        app.router.clone(),
        &format!("/api/v1/callbacks/midjourney?token={CALLBACK_TOKEN}"),
        body.clone(),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = post_json(
        app.router.clone(),
        &format!("/api/v1/callbacks/suno?token={CALLBACK_TOKEN}"),
        body,
    )
    .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Credits
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operator_grants_credits() {
    let app = build_test_app().await;

    let response = post_json_with(
        app.router.clone(),
        "/api/v1/admin/credits/5",
        ("x-admin-token", ADMIN_TOKEN),
        json!({ "amount": 25 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"]["balance"], 25);

    let response = post_json_with(
        app.router.clone(),
        "/api/v1/admin/credits/5",
        ("x-admin-token", ADMIN_TOKEN),
        json!({ "amount": 0 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = post_json(
        app.router.clone(),
        "/api/v1/admin/credits/5",
        json!({ "amount": 25 }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = get_auth(app.router.clone(), "/api/v1/credits/balance", &token_for(5)).await;
    assert_eq!(body_json(response).await["data"]["balance"], 25);
}

#[tokio::test]
async fn transaction_history_is_newest_first_and_paged() {
    let app = build_test_app().await;
    app.grant(ACCOUNT, 10).await;
    app.grant(7, 50).await;
    let token = token_for(ACCOUNT);

    let response = post_json_auth(
        app.router.clone(),
        "/api/v1/generations",
        &token,
        json!({ "operation": "image-generation", "payload": { "prompt": "reject me" } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    app.orchestrator.drain().await;

    let response = get_auth(app.router.clone(), "/api/v1/credits/transactions", &token).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let entries = json["data"].as_array().expect("data should be an array");
    let summary: Vec<_> = entries
        .iter()
        .map(|e| (e["kind"].as_str().unwrap(), e["amount"].as_i64().unwrap()))
        .collect();
    assert_eq!(summary, vec![("refund", 8), ("debit", -8), ("grant", 10)]);
    assert_eq!(entries[1]["operation"], "image-generation");
    assert_eq!(entries[1]["balance_after"], 2);
    assert!(entries[0].get("receipt_id").is_none());

    let response = get_auth(
        app.router.clone(),
        "/api/v1/credits/transactions?limit=1&offset=2",
        &token,
    )
    .await;
    let json = body_json(response).await;
    assert_eq!(json["data"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["data"][0]["kind"], "grant");

    // Out-of-range paging is clamped rather than rejected.
    let response = get_auth(
        app.router.clone(),
        "/api/v1/credits/transactions?limit=0&offset=-5",
        &token,
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["data"][0]["kind"], "refund");

    let response = get(app.router.clone(), "/api/v1/credits/transactions").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}
