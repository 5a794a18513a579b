//! HTTP surface: `POST /synthesize` and `GET /health`.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::audio::wav_duration_seconds;
use crate::bridge::SynthesisBridge;
use crate::protocol::Verdict;
use crate::supervisor::{Liveness, ReadinessState};

const INVALID_REQUEST: &str = r#"Invalid request. "sentence" and "outputPath" are required."#;
const SYNTHESIS_FAILED: &str = "Synthesis failed. Check server logs for details.";

#[derive(Clone)]
pub struct AppState {
    bridge: SynthesisBridge,
    liveness: Arc<dyn Liveness>,
}

impl AppState {
    pub fn new(bridge: SynthesisBridge, liveness: Arc<dyn Liveness>) -> Self {
        Self { bridge, liveness }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeRequest {
    pub sentence: Option<String>,
    pub output_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
}

impl SynthesizeResponse {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
            duration_seconds: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct HealthResponse {
    pub ready: bool,
    pub state: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/synthesize", post(synthesize))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    info!("Starting HTTP server on http://{}", listener.local_addr()?);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Check required fields and make the output path absolute.
pub fn validate(request: SynthesizeRequest) -> Option<(String, PathBuf)> {
    let sentence = request.sentence.filter(|s| !s.trim().is_empty())?;
    let output_path = request.output_path.filter(|p| !p.trim().is_empty())?;
    let output_path = std::path::absolute(output_path).ok()?;
    Some((sentence, output_path))
}

async fn synthesize(
    State(state): State<AppState>,
    payload: Result<Json<SynthesizeRequest>, JsonRejection>,
) -> (StatusCode, Json<SynthesizeResponse>) {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!("Rejected synthesize request: {}", rejection);
            return bad_request();
        }
    };
    let Some((sentence, output_path)) = validate(request) else {
        return bad_request();
    };

    if let Some(dir) = output_path.parent() {
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            error!("Failed to create {}: {}", dir.display(), e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SynthesizeResponse::failure(format!(
                    "Cannot create output directory: {e}"
                ))),
            );
        }
    }

    match state.bridge.submit(sentence, output_path.clone()).await {
        Verdict::Success => {
            let duration_seconds = wav_duration_seconds(&output_path).ok();
            (
                StatusCode::OK,
                Json(SynthesizeResponse {
                    success: true,
                    error: None,
                    duration_seconds,
                }),
            )
        }
        Verdict::Failure(e) => {
            error!("Synthesis of {} failed: {}", output_path.display(), e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(SynthesizeResponse::failure(SYNTHESIS_FAILED)),
            )
        }
    }
}

async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let readiness = state.liveness.readiness();
    let ready = readiness == ReadinessState::Ready;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(HealthResponse {
            ready,
            state: readiness.to_string(),
        }),
    )
}

fn bad_request() -> (StatusCode, Json<SynthesizeResponse>) {
    (
        StatusCode::BAD_REQUEST,
        Json(SynthesizeResponse::failure(INVALID_REQUEST)),
    )
}
