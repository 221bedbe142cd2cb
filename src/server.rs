use crate::logging::SharedLogger;
use crate::translate::openai_types::{ModelList, ModelObject, PUBLIC_MODEL_ID};
use crate::translate::streaming::{new_request_id, translate_fragments, StreamTranslator};
use crate::upstream::UpstreamAdapter;
use crate::validate::{authenticate, parse_chat_request, Rejection};

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::stream::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub const SERVICE_NAME: &str = "iflow-openai-compatible-api";

pub struct AppState {
    pub adapter: Arc<UpstreamAdapter>,
    pub auth_token: String,
    pub require_user_message: bool,
    pub logger: SharedLogger,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/models", get(handle_list_models))
        .route("/v1/models/:model_id", get(handle_retrieve_model))
        // Unprefixed aliases for clients configured without `/v1`.
        .route("/chat/completions", post(handle_chat_completions))
        .route("/models", get(handle_list_models))
        .route("/models/:model_id", get(handle_retrieve_model))
        .route("/health", get(handle_health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Err(rejection) = authenticate(&headers, &state.auth_token) {
        state.logger.warn("server", rejection.body.error.message.clone());
        return rejection.into_response();
    }

    let req = match parse_chat_request(&body, state.require_user_message) {
        Ok(r) => r,
        Err(rejection) => {
            state.logger.warn(
                "server",
                format!("Rejected chat request: {}", rejection.body.error.message),
            );
            return rejection.into_response();
        }
    };

    let request_id = new_request_id();
    tracing::info!(id = %request_id, messages = req.messages.len(), "Chat completion request");
    state.logger.info_for(
        "server",
        &request_id,
        format!("Request: messages={}", req.messages.len()),
    );

    let translator = StreamTranslator::new(request_id, PUBLIC_MODEL_ID);
    let adapter = Arc::clone(&state.adapter);
    let frames = translate_fragments(
        translator,
        req.messages,
        move |messages| adapter.exchange(messages),
        state.logger.clone(),
    )
    .map(Ok::<_, Infallible>);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

async fn handle_list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<ModelList>, Rejection> {
    authenticate(&headers, &state.auth_token)?;

    Ok(Json(ModelList {
        object: "list".to_string(),
        data: vec![ModelObject::iflow(chrono::Utc::now().timestamp())],
    }))
}

async fn handle_retrieve_model(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(model_id): Path<String>,
) -> Result<Json<ModelObject>, Rejection> {
    authenticate(&headers, &state.auth_token)?;

    if model_id != PUBLIC_MODEL_ID {
        return Err(Rejection::not_found(format!("Model '{}' not found", model_id)));
    }

    Ok(Json(ModelObject::iflow(chrono::Utc::now().timestamp())))
}

async fn handle_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVICE_NAME,
    }))
}

/// Resolve on Ctrl-C, or on SIGTERM on unix.
///
/// The SIGTERM handler is installed before this returns, so a signal that
/// arrives before the future is first polled is not lost.
pub fn shutdown_signal() -> std::io::Result<impl std::future::Future<Output = ()> + Send> {
    #[cfg(unix)]
    let mut terminate =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    Ok(async move {
        let ctrl_c = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let term = async move {
            terminate.recv().await;
        };
        #[cfg(not(unix))]
        let term = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => tracing::info!("Received Ctrl-C"),
            _ = term => tracing::info!("Received SIGTERM"),
        }
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_resolves_shutdown_signal() {
        let shutdown = shutdown_signal().unwrap();

        let status = std::process::Command::new("kill")
            .args(["-TERM", &std::process::id().to_string()])
            .status()
            .unwrap();
        assert!(status.success());

        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .expect("shutdown signal did not resolve on SIGTERM");
    }
}
