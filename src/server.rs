//! HTTP front door.
//!
//! Upgrade requests on any path are handed to the relay. Everything else is
//! plain HTTP: the landing page at `/` and `404 Not Found` elsewhere.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        State,
    },
    http::{header, StatusCode, Uri},
    response::{Html, IntoResponse, Response},
    routing::any,
    Router,
};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::relay::{self, Acceptor};

/// Page served when no landing page file is configured
const DEFAULT_LANDING_PAGE: &str = include_str!("../static/index.html");

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub acceptor: Arc<Acceptor>,
    pub landing: Arc<LandingPage>,
}

impl AppState {
    pub fn new(acceptor: Acceptor, landing: LandingPage) -> Self {
        Self {
            acceptor: Arc::new(acceptor),
            landing: Arc::new(landing),
        }
    }
}

/// Landing page, either built in or read from disk on every request
#[derive(Debug, Clone, Default)]
pub struct LandingPage {
    path: Option<PathBuf>,
}

impl LandingPage {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    async fn render(&self) -> Response {
        let Some(path) = &self.path else {
            return Html(DEFAULT_LANDING_PAGE).into_response();
        };

        match tokio::fs::read(path).await {
            Ok(content) => ([(header::CONTENT_TYPE, "text/html")], content).into_response(),
            Err(e) => {
                error!("Failed to read landing page {}: {}", path.display(), e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Server Error").into_response()
            }
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", any(root_handler))
        .fallback(fallback_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn root_handler(
    State(state): State<AppState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => relay::upgrade(ws, uri, state.acceptor.clone()),
        Err(_) => state.landing.render().await,
    }
}

async fn fallback_handler(
    State(state): State<AppState>,
    uri: Uri,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    match ws {
        Ok(ws) => relay::upgrade(ws, uri, state.acceptor.clone()),
        Err(_) => (StatusCode::NOT_FOUND, "Not Found").into_response(),
    }
}

/// Serve until `shutdown` resolves
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = build_router(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
}

/// Resolves on Ctrl+C
pub async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
