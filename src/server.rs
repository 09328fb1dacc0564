use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse, Responder, ResponseError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::verify_request;
use crate::credentials::CredentialRecord;
use crate::error::ProxyError;
use crate::models::chat::ChatCompletionRequest;
use crate::orchestrator::{Completion, ConversationHints};
use crate::util::{error_response, now_epoch, AppState};

const SERVICE_NAME: &str = "buddyrelay";
const BACKEND_OWNER: &str = "codebuddy";

const ROUTES: &[&str] = &[
    "/v1/chat/completions",
    "/v1/models",
    "/v1/credentials",
    "/v1/credentials/select",
    "/v1/credentials/auto",
    "/v1/credentials/status",
    "/stats",
    "/settings",
    "/health",
];

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .route("/", web::get().to(index))
            .route("/health", web::get().to(health))
            .route("/v1/chat/completions", web::post().to(chat_completions))
            .route("/v1/models", web::get().to(list_models))
            .route("/v1/credentials", web::get().to(list_credentials))
            .route("/v1/credentials", web::post().to(add_credential))
            .route("/v1/credentials/select", web::post().to(select_credential))
            .route("/v1/credentials/auto", web::post().to(auto_rotation))
            .route("/v1/credentials/status", web::get().to(rotation_status))
            .route(
                "/v1/credentials/{handle}",
                web::delete().to(delete_credential),
            )
            .route("/stats", web::get().to(stats))
            .route("/settings", web::get().to(get_settings))
            .route("/settings", web::post().to(update_settings)),
    );
}

/// Reject the request unless it carries the shared secret.
fn authorize(req: &HttpRequest, state: &AppState) -> Option<HttpResponse> {
    verify_request(req, state.settings.password.as_deref()).rejection()
}

fn header_value(req: &HttpRequest, name: &str) -> Option<String> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn conversation_hints(req: &HttpRequest) -> ConversationHints {
    ConversationHints {
        conversation_id: header_value(req, "x-conversation-id"),
        conversation_request_id: header_value(req, "x-conversation-request-id"),
        conversation_message_id: header_value(req, "x-conversation-message-id"),
        request_id: header_value(req, "x-request-id"),
    }
}

async fn index() -> impl Responder {
    HttpResponse::Ok().json(json!({
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ROUTES,
    }))
}

async fn health(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": SERVICE_NAME,
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "timestamp": now_epoch(),
    }))
}

async fn chat_completions(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Bytes,
) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }

    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                http::StatusCode::BAD_REQUEST,
                &format!("Invalid JSON request body: {}", e),
            )
        }
    };

    match state
        .orchestrator
        .complete(request, &conversation_hints(&req))
        .await
    {
        Ok(Completion::Stream(stream)) => HttpResponse::Ok()
            .content_type("text/event-stream")
            .insert_header((header::CACHE_CONTROL, "no-cache"))
            .insert_header(("x-accel-buffering", "no"))
            .streaming(stream),
        Ok(Completion::Folded(value)) => HttpResponse::Ok().json(value),
        Err(err) => {
            warn!("Chat completion failed: {}", err);
            err.error_response()
        }
    }
}

async fn list_models(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    let created = now_epoch();
    let data: Vec<Value> = state
        .settings
        .models
        .iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": BACKEND_OWNER,
            })
        })
        .collect();
    HttpResponse::Ok().json(json!({ "object": "list", "data": data }))
}

async fn list_credentials(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    let credentials = state.rotator.enumerate();
    HttpResponse::Ok().json(json!({
        "total": credentials.len(),
        "credentials": credentials,
    }))
}

async fn add_credential(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<Value>,
) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }

    let mut payload = body.into_inner();
    let filename = payload
        .as_object_mut()
        .and_then(|o| o.remove("filename"))
        .and_then(|f| f.as_str().map(|s| s.to_string()));

    let has_token = payload
        .get("bearer_token")
        .and_then(|t| t.as_str())
        .is_some_and(|t| !t.trim().is_empty());
    if !has_token {
        return error_response(
            http::StatusCode::UNPROCESSABLE_ENTITY,
            "bearer_token is required",
        );
    }

    let mut record: CredentialRecord = match serde_json::from_value(payload) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                http::StatusCode::UNPROCESSABLE_ENTITY,
                &format!("invalid credential: {}", e),
            )
        }
    };
    if record.created_at.is_none() {
        record.created_at = Some(now_epoch() as i64);
    }

    match state.rotator.persist(&record, filename.as_deref()) {
        Ok(handle) => {
            info!("Credential added via API: {}", handle);
            HttpResponse::Ok().json(json!({ "success": true, "handle": handle }))
        }
        Err(e) => ProxyError::from(e).error_response(),
    }
}

async fn delete_credential(
    req: HttpRequest,
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    let handle = path.into_inner();
    match state.rotator.delete(&handle) {
        Ok(()) => HttpResponse::Ok().json(json!({ "success": true, "handle": handle })),
        Err(e) => ProxyError::from(e).error_response(),
    }
}

#[derive(Debug, Deserialize)]
struct SelectRequest {
    index: usize,
}

async fn select_credential(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SelectRequest>,
) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    match state.rotator.set_manual(body.index) {
        Ok(credential) => HttpResponse::Ok().json(json!({
            "success": true,
            "index": body.index,
            "handle": credential.handle,
        })),
        Err(e) => ProxyError::from(e).error_response(),
    }
}

async fn auto_rotation(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    state.rotator.clear_manual();
    HttpResponse::Ok().json(json!({ "success": true, "mode": state.rotator.status().mode }))
}

async fn rotation_status(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    HttpResponse::Ok().json(state.rotator.status())
}

async fn stats(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    HttpResponse::Ok().json(state.usage.snapshot())
}

fn settings_view(state: &AppState) -> Value {
    let mut view = state.settings.redacted();
    if let Some(obj) = view.as_object_mut() {
        obj.insert("rotation_count".into(), json!(state.rotator.rotation_quota()));
    }
    view
}

async fn get_settings(req: HttpRequest, state: web::Data<AppState>) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    HttpResponse::Ok().json(settings_view(&state))
}

#[derive(Debug, Deserialize)]
struct SettingsUpdate {
    rotation_count: Option<u64>,
}

async fn update_settings(
    req: HttpRequest,
    state: web::Data<AppState>,
    body: web::Json<SettingsUpdate>,
) -> HttpResponse {
    if let Some(resp) = authorize(&req, &state) {
        return resp;
    }
    match body.rotation_count {
        Some(count) => {
            state.rotator.set_rotation_quota(count);
            HttpResponse::Ok().json(settings_view(&state))
        }
        None => error_response(
            http::StatusCode::BAD_REQUEST,
            "no adjustable setting provided (rotation_count)",
        ),
    }
}
