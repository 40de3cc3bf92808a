use crate::{app::AppState, version};
use axum::{
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;

use super::verify::verify_handler;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/verificar-ura", get(verify_handler).post(verify_handler))
        // path kept for automations still pointing at the serverless deployment
        .route(
            "/.netlify/functions/verificar-ura",
            get(verify_handler).post(verify_handler),
        )
        .route("/health", get(health))
}

async fn health() -> Response {
    Json(json!({
        "status": "ok",
        "version": version::get_short_version(),
    }))
    .into_response()
}
