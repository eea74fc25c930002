//! Session front-end: axum HTTP + WebSocket.
//!
//! - `WS /ws` - live `frame` and `camera_info` events
//! - `GET /api/status` - capture loop health
//! - `GET /api/camera` - cached camera metadata
//! - `GET /` - optional static UI directory

pub mod ws;

use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::pipeline::{StatusReport, StreamStatus};
use crate::publish::{BroadcastPublisher, Publisher};

/// Shared state for the web server
pub struct WebState {
    publisher: Arc<BroadcastPublisher>,
    status: Arc<StreamStatus>,
    start_time: Instant,
}

impl WebState {
    pub fn new(publisher: Arc<BroadcastPublisher>, status: Arc<StreamStatus>) -> Self {
        Self {
            publisher,
            status,
            start_time: Instant::now(),
        }
    }
}

#[derive(Serialize)]
struct StatusBody {
    #[serde(flatten)]
    report: StatusReport,
    subscribers: usize,
    uptime_secs: u64,
}

/// Build the router. `ui_dir`, when it exists, is served for every path the
/// API does not claim.
pub fn router(state: WebState, ui_dir: Option<&Path>) -> Router {
    let mut app = Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/api/status", get(api_status))
        .route("/api/camera", get(api_camera))
        .layer(CorsLayer::permissive())
        .with_state(Arc::new(state));

    if let Some(path) = ui_dir {
        if path.exists() {
            info!("Serving UI from {:?}", path);
            app = app.fallback_service(ServeDir::new(path).append_index_html_on_directories(true));
        } else {
            warn!("UI path {:?} does not exist, skipping static file serving", path);
        }
    }

    app
}

/// Serve `app` on `listener` until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!("Web server listening on http://{}", addr);
    }
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<WebState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| {
        ws::handle_ws(
            socket,
            Arc::clone(&state.publisher),
            Arc::clone(&state.status),
        )
    })
}

/// GET /api/status
async fn api_status(State(state): State<Arc<WebState>>) -> Json<StatusBody> {
    Json(StatusBody {
        report: state.status.report(),
        subscribers: state.publisher.subscriber_count(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

/// GET /api/camera, 204 until the first `camera_info` is published
async fn api_camera(State(state): State<Arc<WebState>>) -> Response {
    match state.publisher.snapshot().metadata {
        Some(record) => Json(&*record).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}
