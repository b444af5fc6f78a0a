//! Web server for the operator UI and API

use anyhow::Result;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rust_embed::RustEmbed;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::display::{DisplayRegion, PreviewStore};
use crate::runner::SessionHandle;
use crate::session::Event;

/// Embedded static files for the web UI
#[derive(RustEmbed)]
#[folder = "static/"]
struct StaticAssets;

/// Shared application state
pub struct AppState {
    /// Command channel into the event loop
    pub session: SessionHandle,
    /// Latest JPEG per display region
    pub previews: Arc<PreviewStore>,
}

impl AppState {
    pub fn new(session: SessionHandle, previews: Arc<PreviewStore>) -> Self {
        Self { session, previews }
    }

    /// Forward an event and answer with the resulting status
    async fn dispatch(&self, event: Event) -> Response {
        match self.session.send(event).await {
            Ok(status) => Json(status).into_response(),
            Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
        }
    }
}

/// Build the router with all UI and API routes
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Static files and UI
        .route("/", get(index_handler))
        .route("/static/*path", get(static_handler))
        // Session
        .route("/api/status", get(get_status))
        .route("/api/click", post(click))
        .route("/api/capture", post(capture))
        .route("/api/recording/start", post(start_recording))
        .route("/api/recording/stop", post(stop_recording))
        .route("/api/recording/toggle", post(toggle_recording))
        .route("/api/gain", post(set_gain))
        .route("/api/update/toggle", post(toggle_update))
        // Previews
        .route("/api/preview/stream", get(preview_stream))
        .route("/api/preview/:region", get(get_preview))
        .layer(cors)
        .with_state(state)
}

/// Run the web server
pub async fn run_server(addr: &str, state: Arc<AppState>) -> Result<()> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Web server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve the main index page
async fn index_handler() -> impl IntoResponse {
    match StaticAssets::get("index.html") {
        Some(content) => Html(content.data.to_vec()).into_response(),
        None => (StatusCode::NOT_FOUND, "Index not found").into_response(),
    }
}

/// Serve static files
async fn static_handler(Path(path): Path<String>) -> impl IntoResponse {
    let path = path.trim_start_matches('/');

    match StaticAssets::get(path) {
        Some(content) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            (
                [(axum::http::header::CONTENT_TYPE, mime.as_ref())],
                content.data.to_vec(),
            )
                .into_response()
        }
        None => (StatusCode::NOT_FOUND, "Not found").into_response(),
    }
}

async fn get_status(State(state): State<Arc<AppState>>) -> Response {
    match state.session.status().await {
        Ok(status) => Json(status).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

/// Click position relative to the raw display region's top-left corner
#[derive(Deserialize)]
struct ClickRequest {
    x: i32,
    y: i32,
}

async fn click(State(state): State<Arc<AppState>>, Json(req): Json<ClickRequest>) -> Response {
    state.dispatch(Event::Click { x: req.x, y: req.y }).await
}

async fn capture(State(state): State<Arc<AppState>>) -> Response {
    state.dispatch(Event::Capture).await
}

async fn start_recording(State(state): State<Arc<AppState>>) -> Response {
    state.dispatch(Event::StartRecording).await
}

async fn stop_recording(State(state): State<Arc<AppState>>) -> Response {
    state.dispatch(Event::StopRecording).await
}

async fn toggle_recording(State(state): State<Arc<AppState>>) -> Response {
    state.dispatch(Event::ToggleRecording).await
}

#[derive(Deserialize)]
struct GainRequest {
    value: i64,
}

async fn set_gain(State(state): State<Arc<AppState>>, Json(req): Json<GainRequest>) -> Response {
    state.dispatch(Event::SetGain(req.value)).await
}

/// Pause or resume acquisition
async fn toggle_update(State(state): State<Arc<AppState>>) -> Response {
    state.dispatch(Event::ToggleUpdate).await
}

/// Latest JPEG for one display region
async fn get_preview(
    State(state): State<Arc<AppState>>,
    Path(region): Path<String>,
) -> impl IntoResponse {
    let Some(region) = DisplayRegion::parse(&region) else {
        return (StatusCode::NOT_FOUND, "Unknown region").into_response();
    };

    let frame = state.previews.get(region);
    if frame.is_empty() {
        return (StatusCode::SERVICE_UNAVAILABLE, "No frame available").into_response();
    }

    (
        [(axum::http::header::CONTENT_TYPE, "image/jpeg")],
        frame.to_vec(),
    )
        .into_response()
}

/// MJPEG stream of the annotated raw view
async fn preview_stream(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    use axum::body::Body;
    use tokio_stream::StreamExt;

    let stream = tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(
        std::time::Duration::from_millis(100),
    ))
    .map(move |_| {
        let frame = state.previews.get(DisplayRegion::Raw);
        Ok::<_, std::convert::Infallible>(multipart_chunk(&frame))
    });

    let body = Body::from_stream(stream);

    (
        [(
            axum::http::header::CONTENT_TYPE,
            "multipart/x-mixed-replace; boundary=frame",
        )],
        body,
    )
}

fn multipart_chunk(frame: &[u8]) -> Vec<u8> {
    if frame.is_empty() {
        return b"--frame\r\nContent-Type: image/jpeg\r\n\r\n".to_vec();
    }

    let mut chunk = Vec::with_capacity(frame.len() + 80);
    chunk.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\nContent-Length: ");
    chunk.extend_from_slice(frame.len().to_string().as_bytes());
    chunk.extend_from_slice(b"\r\n\r\n");
    chunk.extend_from_slice(frame);
    chunk.extend_from_slice(b"\r\n");
    chunk
}
