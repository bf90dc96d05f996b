//! HTTP control plane
//!
//! The Talk server drives transcription through these endpoints. There is
//! no authentication here; the host platform fronts this API.

use std::sync::Arc;

use axum::extract::{Json, State};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use lt_core::language;

use crate::error::ProviderError;
use crate::registry::RoomRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<RoomRegistry>,
}

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/heartbeat", get(heartbeat))
        .route("/health", get(health))
        .route("/api/v1/languages", get(languages))
        .route("/api/v1/call/transcribe", post(transcribe))
        .route("/api/v1/call/set-language", post(set_language))
        .route("/api/v1/call/leave", post(leave_call))
        .route("/api/v1/status", get(status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn heartbeat() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let settings = state.registry.settings();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "stt_configured": settings.is_stt_configured(),
        "hpb_configured": settings.is_hpb_configured(),
    }))
}

async fn languages() -> Json<Value> {
    Json(json!({"languages": language::supported_languages()}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TranscribeRequest {
    room_token: String,
    nc_session_id: String,
    #[serde(default = "default_enable")]
    enable: bool,
    #[serde(default)]
    lang_id: Option<String>,
}

fn default_enable() -> bool {
    true
}

/// Start or stop transcription for one participant.
async fn transcribe(
    State(state): State<AppState>,
    Json(request): Json<TranscribeRequest>,
) -> Result<Json<Value>, ProviderError> {
    tracing::info!(
        room = %request.room_token,
        nc_session_id = %request.nc_session_id,
        enable = request.enable,
        lang_id = request.lang_id.as_deref().unwrap_or(""),
        "transcription request received"
    );

    let settings = state.registry.settings();
    if !settings.is_hpb_configured() {
        return Err(ProviderError::Unavailable(
            "HPB not configured; set hpb_url and hpb_internal_secret".into(),
        ));
    }
    if !settings.is_stt_configured() {
        return Err(ProviderError::Unavailable(
            "speech service not configured; set stt_workspace, stt_key and stt_secret".into(),
        ));
    }

    if !request.enable {
        state
            .registry
            .disable(&request.room_token, &request.nc_session_id)
            .await;
        return Ok(Json(json!({"status": "ok", "enabled": false})));
    }

    let lang_id = match request.lang_id.as_deref() {
        Some(lang) if language::is_supported(lang) => lang.to_string(),
        Some(lang) => {
            tracing::warn!(
                requested = lang,
                default = language::DEFAULT_LANGUAGE,
                "unsupported language requested, using default"
            );
            language::DEFAULT_LANGUAGE.to_string()
        }
        None => language::DEFAULT_LANGUAGE.to_string(),
    };

    state
        .registry
        .enable(&request.room_token, &request.nc_session_id, &lang_id)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "enabled": true,
        "language": lang_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LanguageSetRequest {
    room_token: String,
    lang_id: String,
}

/// Change the transcription language of a room.
async fn set_language(
    State(state): State<AppState>,
    Json(request): Json<LanguageSetRequest>,
) -> Result<Json<Value>, ProviderError> {
    tracing::info!(
        room = %request.room_token,
        lang_id = %request.lang_id,
        "language change request received"
    );

    if !language::is_supported(&request.lang_id) {
        return Err(ProviderError::BadRequest(format!(
            "unsupported language: {}",
            request.lang_id
        )));
    }

    state
        .registry
        .set_language(&request.room_token, &request.lang_id)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "language": request.lang_id,
    })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LeaveRequest {
    room_token: String,
}

/// Explicitly leave a call.
async fn leave_call(
    State(state): State<AppState>,
    Json(request): Json<LeaveRequest>,
) -> Json<Value> {
    tracing::info!(room = %request.room_token, "leave call request received");
    state.registry.leave(&request.room_token).await;
    Json(json!({"status": "ok"}))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let settings = state.registry.settings();
    Json(json!({
        "active_rooms": state.registry.active_rooms().await,
        "version": env!("CARGO_PKG_VERSION"),
        "stt_configured": settings.is_stt_configured(),
        "hpb_configured": settings.is_hpb_configured(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use lt_config::Settings;
    use tower::ServiceExt;

    fn app(settings: Settings) -> Router {
        let registry = RoomRegistry::new(settings);
        create_router(AppState { registry })
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn heartbeat_is_ok() {
        let response = app(Settings::default())
            .oneshot(Request::get("/heartbeat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn health_reports_configuration_state() {
        let response = app(Settings::default())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["hpb_configured"], false);
        assert_eq!(body["stt_configured"], false);
    }

    #[tokio::test]
    async fn languages_lists_english_and_french() {
        let response = app(Settings::default())
            .oneshot(Request::get("/api/v1/languages").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        let codes: Vec<&str> = body["languages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|l| l["code"].as_str().unwrap())
            .collect();
        assert_eq!(codes, vec!["en", "fr"]);
    }

    #[tokio::test]
    async fn transcribe_without_configuration_is_unavailable() {
        let response = app(Settings::default())
            .oneshot(post_json(
                "/api/v1/call/transcribe",
                json!({"roomToken": "r1", "ncSessionId": "nc1"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert!(body["error"].as_str().unwrap().contains("HPB"));
    }

    #[tokio::test]
    async fn disable_requests_succeed_without_an_active_room() {
        let mut settings = Settings::default();
        settings.hpb_url = "wss://hpb.example.org".into();
        settings.hpb_internal_secret = "s".into();
        settings.stt_workspace = "w".into();
        settings.stt_key = "k".into();
        settings.stt_secret = "sec".into();

        let response = app(settings)
            .oneshot(post_json(
                "/api/v1/call/transcribe",
                json!({"roomToken": "r1", "ncSessionId": "nc1", "enable": false}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["enabled"], false);
    }

    #[tokio::test]
    async fn set_language_rejects_unsupported_languages() {
        let response = app(Settings::default())
            .oneshot(post_json(
                "/api/v1/call/set-language",
                json!({"roomToken": "r1", "langId": "xx"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn set_language_on_unknown_room_is_not_found() {
        let response = app(Settings::default())
            .oneshot(post_json(
                "/api/v1/call/set-language",
                json!({"roomToken": "missing", "langId": "fr"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn leave_is_ok_even_for_unknown_rooms() {
        let response = app(Settings::default())
            .oneshot(post_json("/api/v1/call/leave", json!({"roomToken": "r1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn status_lists_active_rooms() {
        let response = app(Settings::default())
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert!(body["active_rooms"].as_array().unwrap().is_empty());
    }
}
