use actix_web::{test, web, App};
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use buddyrelay::orchestrator::HttpUpstream;
use buddyrelay::server::config_routes;
use buddyrelay::util::AppState;
use buddyrelay::Settings;

const PASSWORD: &str = "test-secret";

#[derive(Clone, Debug)]
struct Captured {
    headers: HeaderMap,
    body: Value,
}

#[derive(Clone)]
struct UpstreamState {
    requests: Arc<AsyncMutex<Vec<Captured>>>,
    status: StatusCode,
    body: String,
}

async fn handle_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    state.requests.lock().await.push(Captured {
        headers,
        body: payload,
    });
    let content_type = if state.status.is_success() {
        "text/event-stream"
    } else {
        "application/json"
    };
    (
        state.status,
        [(header::CONTENT_TYPE, content_type)],
        state.body.clone(),
    )
}

struct MockUpstream {
    base_url: String,
    requests: Arc<AsyncMutex<Vec<Captured>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(status: StatusCode, body: String) -> Self {
        let requests = Arc::new(AsyncMutex::new(Vec::new()));
        let state = UpstreamState {
            requests: requests.clone(),
            status,
            body,
        };

        let app = Router::new()
            .route("/v2/chat/completions", post(handle_chat))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app)
                .await
                .expect("upstream server error");
        });

        Self {
            base_url,
            requests,
            join,
        }
    }

    async fn sse(chunks: &[Value]) -> Self {
        let mut body = String::new();
        for c in chunks {
            body.push_str(&format!("data: {}\n\n", c));
        }
        body.push_str("data: [DONE]\n\n");
        Self::start(StatusCode::OK, body).await
    }

    async fn captured(&self) -> Vec<Captured> {
        self.requests.lock().await.clone()
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn write_credential(dir: &Path, name: &str, token: &str, user: &str) {
    std::fs::write(
        dir.join(name),
        json!({"bearer_token": token, "user_id": user}).to_string(),
    )
    .expect("write credential");
}

fn settings(base_url: &str, creds: &TempDir, rotation_count: u64) -> Settings {
    Settings {
        password: Some(PASSWORD.to_string()),
        api_endpoint: base_url.to_string(),
        creds_dir: creds.path().to_path_buf(),
        rotation_count,
        timeout_seconds: 10,
        models: vec!["gpt-5".into(), "claude-4.0".into()],
        ..Settings::default()
    }
}

fn state(settings: Settings) -> AppState {
    let client = reqwest::Client::builder()
        .no_proxy()
        .build()
        .expect("client");
    AppState::with_upstream(settings, Arc::new(HttpUpstream::new(client))).expect("state")
}

fn chunk(delta: Value) -> Value {
    json!({
        "id": "chatcmpl-up",
        "object": "chat.completion.chunk",
        "created": 1,
        "model": "gpt-5",
        "choices": [{"index": 0, "delta": delta}]
    })
}

fn auth() -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", PASSWORD))
}

#[actix_web::test]
async fn non_streaming_request_is_folded_and_forwarded_with_backend_headers() {
    let upstream = MockUpstream::sse(&[
        chunk(json!({"role": "assistant", "content": "Hel"})),
        chunk(json!({"content": "lo"})),
    ])
    .await;
    let creds = TempDir::new().unwrap();
    write_credential(creds.path(), "a.json", "tok-a", "user-a");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(&upstream.base_url, &creds, 10))))
            .configure(config_routes),
    )
    .await;

    let payload = json!({
        "model": "gpt-5",
        "messages": [{"role": "user", "content": "Hi Claude"}],
        "max_tokens": 512,
        "top_p": 0.9,
        "tool_choice": "auto"
    });
    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(auth())
        .insert_header(("X-Conversation-ID", "conv-42"))
        .set_json(&payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["choices"][0]["message"]["content"], "Hello");
    assert_eq!(body["choices"][0]["finish_reason"], "stop");

    let captured = upstream.captured().await;
    assert_eq!(captured.len(), 1);
    let forwarded = &captured[0].body;
    assert_eq!(forwarded["stream"], true);
    assert_eq!(forwarded["max_tokens"], 512);
    assert_eq!(forwarded["top_p"], 0.9);
    assert_eq!(forwarded["tool_choice"], "auto");
    let messages = forwarded["messages"].as_array().expect("messages array");
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["role"], "system");
    assert_eq!(messages[1]["content"], "Hi CodeBuddy");

    let headers = &captured[0].headers;
    assert_eq!(headers["authorization"], "Bearer tok-a");
    assert_eq!(headers["x-conversation-id"], "conv-42");
    assert_eq!(headers["x-user-id"], "user-a");
    assert_eq!(headers["x-agent-intent"], "craft");
    assert_eq!(headers["x-request-id"].len(), 32);
}

#[actix_web::test]
async fn streaming_request_is_passed_through() {
    let upstream = MockUpstream::sse(&[chunk(json!({"content": "a"})), chunk(json!({"content": "b"}))])
        .await;
    let creds = TempDir::new().unwrap();
    write_credential(creds.path(), "a.json", "tok-a", "user-a");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(&upstream.base_url, &creds, 10))))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(auth())
        .set_json(json!({
            "model": "gpt-5",
            "stream": true,
            "messages": [
                {"role": "system", "content": "s"},
                {"role": "user", "content": "u"}
            ]
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert!(resp.status().is_success());
    let ct = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(ct.starts_with("text/event-stream"));
    assert_eq!(
        resp.headers().get("x-accel-buffering").unwrap(),
        "no"
    );
    let body = test::read_body(resp).await;
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"content\":\"a\""));
    assert!(text.contains("\"content\":\"b\""));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[actix_web::test]
async fn rotation_spreads_requests_and_is_counted() {
    let upstream = MockUpstream::sse(&[chunk(json!({"content": "ok"}))]).await;
    let creds = TempDir::new().unwrap();
    write_credential(creds.path(), "a.json", "tok-a", "user-a");
    write_credential(creds.path(), "b.json", "tok-b", "user-b");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(&upstream.base_url, &creds, 2))))
            .configure(config_routes),
    )
    .await;

    for _ in 0..5 {
        let req = test::TestRequest::post()
            .uri("/v1/chat/completions")
            .insert_header(auth())
            .set_json(json!({"model": "gpt-5", "messages": [{"role": "user", "content": "x"}]}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        let _ = test::read_body(resp).await;
    }

    let tokens: Vec<String> = upstream
        .captured()
        .await
        .iter()
        .map(|c| c.headers["authorization"].to_str().unwrap().to_string())
        .collect();
    assert_eq!(
        tokens,
        vec![
            "Bearer tok-a",
            "Bearer tok-a",
            "Bearer tok-b",
            "Bearer tok-b",
            "Bearer tok-a"
        ]
    );

    let req = test::TestRequest::get()
        .uri("/stats")
        .insert_header(auth())
        .to_request();
    let stats: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats["model_usage"]["gpt-5"], 5);
    assert_eq!(stats["credential_usage"]["a.json"], 3);
    assert_eq!(stats["credential_usage"]["b.json"], 2);
}

#[actix_web::test]
async fn backend_error_status_and_body_are_forwarded() {
    let upstream = MockUpstream::start(
        StatusCode::TOO_MANY_REQUESTS,
        json!({"error": {"message": "rate limited", "code": 11128}}).to_string(),
    )
    .await;
    let creds = TempDir::new().unwrap();
    write_credential(creds.path(), "a.json", "tok-a", "user-a");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(&upstream.base_url, &creds, 10))))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(auth())
        .set_json(json!({"model": "gpt-5", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 429);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["code"], 11128);
}

#[actix_web::test]
async fn in_stream_error_aborts_fold() {
    let upstream = MockUpstream::sse(&[
        chunk(json!({"content": "partial"})),
        json!({"error": {"message": "content filtered"}}),
    ])
    .await;
    let creds = TempDir::new().unwrap();
    write_credential(creds.path(), "a.json", "tok-a", "user-a");

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(&upstream.base_url, &creds, 10))))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(auth())
        .set_json(json!({"model": "gpt-5", "messages": [{"role": "user", "content": "x"}]}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 502);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["message"], "content filtered");
}

#[actix_web::test]
async fn missing_credentials_and_caller_auth_are_distinguished() {
    let creds = TempDir::new().unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(
                "http://127.0.0.1:9",
                &creds,
                10,
            ))))
            .configure(config_routes),
    )
    .await;
    let payload = json!({"model": "gpt-5", "messages": [{"role": "user", "content": "x"}]});

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(&payload)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 401);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("Authorization", "Bearer wrong"))
        .set_json(&payload)
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 403);

    let req = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(auth())
        .set_json(&payload)
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"]["message"], "no valid credentials available");

    let req = test::TestRequest::get().uri("/health").to_request();
    let health: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(health["status"], "healthy");
}

#[actix_web::test]
async fn unset_password_is_a_configuration_error() {
    let creds = TempDir::new().unwrap();
    let mut s = settings("http://127.0.0.1:9", &creds, 10);
    s.password = None;
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(s)))
            .configure(config_routes),
    )
    .await;
    let req = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(auth())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 500);
}

#[actix_web::test]
async fn credential_management_endpoints() {
    let creds = TempDir::new().unwrap();
    write_credential(creds.path(), "a.json", "tok-aaaaaaaaaaaaaaaa", "user-a");
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(
                "http://127.0.0.1:9",
                &creds,
                10,
            ))))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/v1/credentials")
        .insert_header(auth())
        .set_json(json!({"user_id": "nobody"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 422);

    let req = test::TestRequest::post()
        .uri("/v1/credentials")
        .insert_header(auth())
        .set_json(json!({"bearer_token": "tok-bbbbbbbbbbbbbbbb", "user_id": "user-b", "filename": "b"}))
        .to_request();
    let added: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(added["handle"], "b.json");
    assert!(creds.path().join("b.json").is_file());

    let req = test::TestRequest::get()
        .uri("/v1/credentials")
        .insert_header(auth())
        .to_request();
    let list: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(list["total"], 2);
    assert_eq!(list["credentials"][1]["token_preview"], "tok-bbbbbb...bbbb");
    assert!(!list.to_string().contains("tok-bbbbbbbbbbbbbbbb"));

    let req = test::TestRequest::post()
        .uri("/v1/credentials/select")
        .insert_header(auth())
        .set_json(json!({"index": 9}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 400);

    let req = test::TestRequest::post()
        .uri("/v1/credentials/select")
        .insert_header(auth())
        .set_json(json!({"index": 1}))
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());

    let req = test::TestRequest::get()
        .uri("/v1/credentials/status")
        .insert_header(auth())
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["mode"], "manual");
    assert_eq!(status["active"]["handle"], "b.json");

    let req = test::TestRequest::post()
        .uri("/v1/credentials/auto")
        .insert_header(auth())
        .to_request();
    let auto: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(auto["mode"], "auto");

    let req = test::TestRequest::delete()
        .uri("/v1/credentials/missing.json")
        .insert_header(auth())
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status().as_u16(), 404);

    let req = test::TestRequest::delete()
        .uri("/v1/credentials/b.json")
        .insert_header(auth())
        .to_request();
    assert!(test::call_service(&app, req).await.status().is_success());
    assert!(!creds.path().join("b.json").exists());
}

#[actix_web::test]
async fn settings_and_models_endpoints() {
    let creds = TempDir::new().unwrap();
    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(state(settings(
                "http://127.0.0.1:9",
                &creds,
                10,
            ))))
            .configure(config_routes),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(auth())
        .to_request();
    let models: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(models["object"], "list");
    assert_eq!(models["data"][0]["id"], "gpt-5");
    assert_eq!(models["data"].as_array().unwrap().len(), 2);

    let req = test::TestRequest::post()
        .uri("/settings")
        .insert_header(auth())
        .set_json(json!({"rotation_count": 0}))
        .to_request();
    let updated: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(updated["rotation_count"], 0);
    assert_eq!(updated["password_set"], true);
    assert!(!updated.to_string().contains(PASSWORD));

    let req = test::TestRequest::get()
        .uri("/v1/credentials/status")
        .insert_header(auth())
        .to_request();
    let status: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(status["rotation_quota"], 0);
}
