use axum::extract::ws::WebSocketUpgrade;
use axum::http::Uri;
use axum::response::Response;
use std::sync::Arc;
use tracing::{debug, warn};

use super::acceptor::Acceptor;
use super::frame::split_axum;

/// Complete a WebSocket upgrade and hand the socket to the acceptor.
///
/// The request URI is kept so the acceptor can read the `target` parameter
/// once the handshake is done.
pub fn upgrade(ws: WebSocketUpgrade, uri: Uri, acceptor: Arc<Acceptor>) -> Response {
    ws.on_failed_upgrade(|e| warn!("WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| async move {
            let (sink, stream) = split_axum(socket);

            match acceptor.accept(uri.query(), sink, stream) {
                Ok(session) => session.run().await,
                Err(e) => debug!("Client rejected: {}", e),
            }
        })
}
