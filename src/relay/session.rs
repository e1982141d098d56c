//! Relay session: one client socket bound to one upstream socket.
//!
//! The session consumes the observer notifications of both sockets from a
//! single channel, so every handler below runs to completion before the next
//! event is looked at:
//! - a message from one side is forwarded verbatim if the other side is open,
//!   and dropped otherwise (no queueing, no retry)
//! - a close of either side closes both
//! - errors are only reported; the close that follows drives teardown

use tracing::{debug, error, info};

use super::frame::Frame;
use super::socket::{EventReceiver, Role, SessionEvent, SocketEvent, SocketHandle, SocketState};
use crate::protocol::SessionId;

/// Derived lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Neither socket has closed
    Active,
    /// One socket has closed, the other is being torn down
    Draining,
    /// Both sockets are closed
    Terminated,
}

pub struct RelaySession {
    id: SessionId,
    target: String,
    client: SocketHandle,
    upstream: SocketHandle,
    events: EventReceiver,
}

impl RelaySession {
    pub fn new(
        id: SessionId,
        target: impl Into<String>,
        client: SocketHandle,
        upstream: SocketHandle,
        events: EventReceiver,
    ) -> Self {
        Self {
            id,
            target: target.into(),
            client,
            upstream,
            events,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn socket(&self, role: Role) -> &SocketHandle {
        match role {
            Role::Client => &self.client,
            Role::Upstream => &self.upstream,
        }
    }

    pub fn state(&self) -> SessionState {
        let closed = [&self.client, &self.upstream]
            .iter()
            .filter(|s| s.state() == SocketState::Closed)
            .count();

        match closed {
            0 => SessionState::Active,
            1 => SessionState::Draining,
            _ => SessionState::Terminated,
        }
    }

    /// Process events until both sockets are closed
    pub async fn run(mut self) {
        debug!("[{}] Relaying to {}", self.id, self.target());

        while self.state() != SessionState::Terminated {
            match self.events.recv().await {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }

        debug!("[{}] Session terminated", self.id);
    }

    pub fn handle_event(&self, SessionEvent { role, event }: SessionEvent) {
        match event {
            SocketEvent::Opened => {
                if role == Role::Upstream {
                    info!("[{}] Upstream connected: {}", self.id, self.target());
                }
            }
            SocketEvent::Message(frame) => self.forward(role, frame),
            SocketEvent::Closed => {
                info!("[{}] {} disconnected", self.id, role);
                self.close_both();
            }
            SocketEvent::Error(e) => {
                error!("[{}] {} error: {}", self.id, role, e);
            }
        }
    }

    fn forward(&self, from: Role, frame: Frame) {
        let to = self.socket(from.peer());

        if !to.send(frame) {
            debug!(
                "[{}] Dropped message from {}: {} is {:?}",
                self.id,
                from,
                to.role(),
                to.state()
            );
        }
    }

    /// Close whichever sockets are still open. Safe to call any number of times.
    pub fn close_both(&self) {
        for socket in [&self.client, &self.upstream] {
            if socket.close() {
                debug!("[{}] Closing {}", self.id, socket.role());
            }
        }
    }
}
