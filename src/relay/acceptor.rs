use futures_util::{Sink, Stream};
use std::fmt;
use tracing::{error, info, warn};

use super::connector::UpstreamConnector;
use super::frame::Frame;
use super::request::target_param;
use super::session::RelaySession;
use super::socket::{event_channel, spawn_open, Observer, Role, SocketHandle};
use crate::error::{RelayError, Result};
use crate::protocol::{ErrorPayload, SessionId};

/// Turns freshly upgraded client sockets into relay sessions
#[derive(Debug, Clone)]
pub struct Acceptor {
    connector: UpstreamConnector,
}

impl Acceptor {
    pub fn new(connector: UpstreamConnector) -> Self {
        Self { connector }
    }

    /// Bind a client socket to a new upstream connection.
    ///
    /// On rejection the client socket has already been told (if there is
    /// anything to tell) and is closing; the error is returned for logging
    /// only.
    pub fn accept<Si, St, E>(
        &self,
        query: Option<&str>,
        sink: Si,
        stream: St,
    ) -> Result<RelaySession>
    where
        Si: Sink<Frame> + Send + Unpin + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = std::result::Result<Frame, E>> + Send + Unpin + 'static,
        E: fmt::Display + Send,
    {
        let id = SessionId::next();
        let (tx, events) = event_channel();
        let client = spawn_open(sink, stream, Observer::new(Role::Client, tx.clone()));

        let Some(target) = target_param(query) else {
            warn!("[{}] Rejected client without target", id);
            reject_missing_target(&client);
            return Err(RelayError::MissingTarget);
        };

        info!("[{}] Client connected → Target: {}", id, target);

        let upstream = match self.connector.connect(&target, Observer::new(Role::Upstream, tx)) {
            Ok(upstream) => upstream,
            Err(e) => {
                error!("[{}] Upstream creation failed: {}", id, e);
                client.close();
                return Err(e);
            }
        };

        Ok(RelaySession::new(id, target, client, upstream, events))
    }
}

/// Tell the client what it forgot, then close it
fn reject_missing_target(client: &SocketHandle) {
    match ErrorPayload::missing_target().to_json() {
        Ok(json) => {
            client.send(Frame::Text(json));
        }
        Err(e) => error!("Failed to encode error payload: {}", e),
    }
    client.close();
}
