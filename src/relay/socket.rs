//! Socket handles and the tasks that drive them.
//!
//! A socket is split in two halves:
//! - [`SocketHandle`] - held by the session; reads state, sends and closes
//! - a driver task - exclusively owns the transport and reports what happens
//!   on it through an [`Observer`]
//!
//! The driver is the only writer of the transport, so frames queued through a
//! handle go out in the order they were queued.

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

use super::frame::Frame;
use crate::error::{RelayError, Result};

/// How long a closing socket waits for the peer to finish the close handshake
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one side of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SocketState {
    fn as_u8(self) -> u8 {
        match self {
            SocketState::Connecting => 0,
            SocketState::Open => 1,
            SocketState::Closing => 2,
            SocketState::Closed => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => SocketState::Connecting,
            1 => SocketState::Open,
            2 => SocketState::Closing,
            _ => SocketState::Closed,
        }
    }
}

/// Which side of a session a socket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Upstream,
}

impl Role {
    pub fn peer(self) -> Self {
        match self {
            Role::Client => Role::Upstream,
            Role::Upstream => Role::Client,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "Client"),
            Role::Upstream => write!(f, "Upstream"),
        }
    }
}

/// Notifications a socket driver reports about its transport
#[derive(Debug)]
pub enum SocketEvent {
    Opened,
    Message(Frame),
    Closed,
    Error(RelayError),
}

/// A [`SocketEvent`] tagged with the side it came from
#[derive(Debug)]
pub struct SessionEvent {
    pub role: Role,
    pub event: SocketEvent,
}

/// Receiving end for every observer of a session
pub type EventReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Create the event channel a session listens on
pub fn event_channel() -> (mpsc::UnboundedSender<SessionEvent>, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Listener registered for one socket of a session
#[derive(Debug, Clone)]
pub struct Observer {
    role: Role,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Observer {
    pub fn new(role: Role, tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { role, tx }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Report an event; a session that has already finished is not an error
    pub fn notify(&self, event: SocketEvent) {
        let _ = self.tx.send(SessionEvent {
            role: self.role,
            event,
        });
    }
}

/// Work queued for a socket driver
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Command {
    Send(Frame),
    Close,
}

#[derive(Debug)]
struct SharedState(AtomicU8);

impl SharedState {
    fn new(state: SocketState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    fn get(&self) -> SocketState {
        SocketState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: SocketState) {
        self.0.store(state.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: SocketState, to: SocketState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// Session-side handle to a socket
#[derive(Debug, Clone)]
pub struct SocketHandle {
    role: Role,
    state: Arc<SharedState>,
    commands: mpsc::UnboundedSender<Command>,
}

impl SocketHandle {
    pub(crate) fn new(role: Role, state: SocketState) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let handle = Self {
            role,
            state: Arc::new(SharedState::new(state)),
            commands,
        };
        (handle, rx)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SocketState {
        self.state.get()
    }

    pub fn is_open(&self) -> bool {
        self.state() == SocketState::Open
    }

    /// Queue a frame if the socket is open. Returns `false` if it was dropped.
    pub fn send(&self, frame: Frame) -> bool {
        if !self.is_open() {
            return false;
        }
        self.commands.send(Command::Send(frame)).is_ok()
    }

    /// Start closing the socket.
    ///
    /// Only the first call on an open (or still connecting) socket does
    /// anything; every later call, and any call on a socket that is already
    /// closing or closed, returns `false`.
    pub fn close(&self) -> bool {
        let initiated = self
            .state
            .transition(SocketState::Open, SocketState::Closing)
            || self
                .state
                .transition(SocketState::Connecting, SocketState::Closing);

        if initiated {
            let _ = self.commands.send(Command::Close);
        }
        initiated
    }

    #[cfg(test)]
    pub(crate) fn set_state(&self, state: SocketState) {
        self.state.set(state);
    }
}

/// Spawn a driver for a socket whose handshake has already completed
pub fn spawn_open<Si, St, E>(sink: Si, stream: St, observer: Observer) -> SocketHandle
where
    Si: Sink<Frame> + Send + Unpin + 'static,
    Si::Error: fmt::Display + Send,
    St: Stream<Item = std::result::Result<Frame, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send,
{
    let (handle, commands) = SocketHandle::new(observer.role(), SocketState::Open);
    let state = handle.state.clone();

    tokio::spawn(async move {
        pump(sink, stream, &state, commands, &observer).await;
        state.set(SocketState::Closed);
        observer.notify(SocketEvent::Closed);
    });

    handle
}

/// Spawn a driver that first waits for `dial`, then runs like [`spawn_open`].
///
/// The returned handle is `Connecting` until the dial finishes. Closing it
/// before then abandons the dial.
pub fn spawn_dial<F, Si, St, E>(dial: F, observer: Observer) -> SocketHandle
where
    F: Future<Output = Result<(Si, St)>> + Send + 'static,
    Si: Sink<Frame> + Send + Unpin + 'static,
    Si::Error: fmt::Display + Send,
    St: Stream<Item = std::result::Result<Frame, E>> + Send + Unpin + 'static,
    E: fmt::Display + Send,
{
    let (handle, mut commands) = SocketHandle::new(observer.role(), SocketState::Connecting);
    let state = handle.state.clone();

    tokio::spawn(async move {
        let dialed = tokio::select! {
            result = dial => Some(result),
            // Nothing can be sent before the socket opens, so any command
            // (or a dropped handle) means the dial was abandoned.
            _ = commands.recv() => None,
        };

        match dialed {
            Some(Ok((sink, stream))) => {
                if state.transition(SocketState::Connecting, SocketState::Open) {
                    observer.notify(SocketEvent::Opened);
                    pump(sink, stream, &state, commands, &observer).await;
                } else {
                    debug!("{} dial finished after close was requested", observer.role());
                    close_transport(sink, stream).await;
                }
            }
            Some(Err(e)) => {
                let e = match e {
                    RelayError::UpstreamConnect(_) => e,
                    other => RelayError::UpstreamConnect(other.to_string()),
                };
                observer.notify(SocketEvent::Error(e));
            }
            None => {
                debug!("{} dial abandoned", observer.role());
            }
        }

        state.set(SocketState::Closed);
        observer.notify(SocketEvent::Closed);
    });

    handle
}

async fn pump<Si, St, E>(
    mut sink: Si,
    mut stream: St,
    state: &SharedState,
    mut commands: mpsc::UnboundedReceiver<Command>,
    observer: &Observer,
) where
    Si: Sink<Frame> + Unpin,
    Si::Error: fmt::Display,
    St: Stream<Item = std::result::Result<Frame, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send(frame)) => {
                    if let Err(e) = sink.send(frame).await {
                        observer.notify(SocketEvent::Error(RelayError::Transport(e.to_string())));
                        break;
                    }
                }
                // A dropped handle means nobody can use this socket any more.
                Some(Command::Close) | None => {
                    state.set(SocketState::Closing);
                    close_transport(sink, stream).await;
                    return;
                }
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Frame::Close)) => {
                    // The transport answers the close itself; keep reading
                    // until it reports the end of the stream.
                    state.set(SocketState::Closing);
                }
                Some(Ok(frame)) => observer.notify(SocketEvent::Message(frame)),
                Some(Err(e)) => {
                    observer.notify(SocketEvent::Error(RelayError::Transport(e.to_string())));
                    break;
                }
                None => break,
            },
        }
    }
}

/// Send a close frame and wait for the peer to finish the handshake
async fn close_transport<Si, St, E>(mut sink: Si, mut stream: St)
where
    Si: Sink<Frame> + Unpin,
    Si::Error: fmt::Display,
    St: Stream<Item = std::result::Result<Frame, E>> + Unpin,
{
    if let Err(e) = sink.send(Frame::Close).await {
        debug!("Close frame not sent: {}", e);
        return;
    }

    let drained = tokio::time::timeout(CLOSE_TIMEOUT, async {
        while let Some(Ok(_)) = stream.next().await {}
    })
    .await;

    if drained.is_err() {
        debug!("Peer did not finish close handshake in {:?}", CLOSE_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::frame::split_tungstenite;
    use tokio::io::duplex;
    use tokio_tungstenite::tungstenite::protocol::Role as WsRole;
    use tokio_tungstenite::tungstenite::Message;
    use tokio_tungstenite::WebSocketStream;

    type NoSink = futures_util::sink::Drain<Frame>;
    type NoStream = futures_util::stream::Empty<std::result::Result<Frame, RelayError>>;

    async fn ws_pair() -> (
        WebSocketStream<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = duplex(64 * 1024);
        let server = WebSocketStream::from_raw_socket(a, WsRole::Server, None).await;
        let client = WebSocketStream::from_raw_socket(b, WsRole::Client, None).await;
        (server, client)
    }

    async fn next_event(rx: &mut EventReceiver) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[test]
    fn test_close_is_idempotent() {
        let (handle, mut rx) = SocketHandle::new(Role::Client, SocketState::Open);

        assert!(handle.close());
        assert!(!handle.close());
        assert_eq!(handle.state(), SocketState::Closing);
        assert_eq!(rx.try_recv().unwrap(), Command::Close);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_close_on_closed_socket_is_noop() {
        let (handle, mut rx) = SocketHandle::new(Role::Upstream, SocketState::Closed);

        assert!(!handle.close());
        assert_eq!(handle.state(), SocketState::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_requires_open_socket() {
        let (handle, mut rx) = SocketHandle::new(Role::Upstream, SocketState::Connecting);

        assert!(!handle.send(Frame::Text("early".into())));
        assert!(rx.try_recv().is_err());

        handle.set_state(SocketState::Open);
        assert!(handle.send(Frame::Text("late".into())));
        assert_eq!(
            rx.try_recv().unwrap(),
            Command::Send(Frame::Text("late".into()))
        );
    }

    #[test]
    fn test_role_peer() {
        assert_eq!(Role::Client.peer(), Role::Upstream);
        assert_eq!(Role::Upstream.peer(), Role::Client);
    }

    #[tokio::test]
    async fn test_driver_reports_messages_in_order() {
        let (server, mut peer) = ws_pair().await;
        let (tx, mut rx) = event_channel();
        let (sink, stream) = split_tungstenite(server);
        let _handle = spawn_open(sink, stream, Observer::new(Role::Client, tx));

        for i in 0..5 {
            peer.send(Message::Text(format!("msg-{}", i).into()))
                .await
                .unwrap();
        }

        for i in 0..5 {
            let event = next_event(&mut rx).await;
            assert_eq!(event.role, Role::Client);
            match event.event {
                SocketEvent::Message(Frame::Text(text)) => {
                    assert_eq!(text, format!("msg-{}", i))
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_driver_sends_and_closes() {
        let (server, mut peer) = ws_pair().await;
        let (tx, mut rx) = event_channel();
        let (sink, stream) = split_tungstenite(server);
        let handle = spawn_open(sink, stream, Observer::new(Role::Upstream, tx));

        assert!(handle.send(Frame::Binary(vec![1, 2, 3])));
        assert!(handle.close());

        let msg = peer.next().await.unwrap().unwrap();
        assert_eq!(msg, Message::Binary(vec![1u8, 2, 3].into()));
        let msg = peer.next().await.unwrap().unwrap();
        assert!(matches!(msg, Message::Close(_)));
        // Let the peer answer the close so the driver can finish.
        while let Some(Ok(_)) = peer.next().await {}

        let event = next_event(&mut rx).await;
        assert!(matches!(event.event, SocketEvent::Closed));
        assert_eq!(handle.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_driver_reports_peer_close() {
        let (server, mut peer) = ws_pair().await;
        let (tx, mut rx) = event_channel();
        let (sink, stream) = split_tungstenite(server);
        let handle = spawn_open(sink, stream, Observer::new(Role::Client, tx));

        peer.close(None).await.unwrap();

        let event = next_event(&mut rx).await;
        assert!(matches!(event.event, SocketEvent::Closed));
        assert_eq!(handle.state(), SocketState::Closed);
        assert!(!handle.close());
    }

    #[tokio::test]
    async fn test_dial_failure_reports_error_then_close() {
        let (tx, mut rx) = event_channel();
        let dial = async { Err::<(NoSink, NoStream), _>(RelayError::ProxyTunnel("refused".into())) };
        let handle = spawn_dial(dial, Observer::new(Role::Upstream, tx));

        let event = next_event(&mut rx).await;
        match event.event {
            SocketEvent::Error(RelayError::UpstreamConnect(msg)) => {
                assert!(msg.contains("refused"))
            }
            other => panic!("unexpected event: {:?}", other),
        }
        let event = next_event(&mut rx).await;
        assert!(matches!(event.event, SocketEvent::Closed));
        assert_eq!(handle.state(), SocketState::Closed);
    }

    #[tokio::test]
    async fn test_close_while_connecting_abandons_dial() {
        let (tx, mut rx) = event_channel();
        let dial = std::future::pending::<Result<(NoSink, NoStream)>>();
        let handle = spawn_dial(dial, Observer::new(Role::Upstream, tx));
        assert_eq!(handle.state(), SocketState::Connecting);

        assert!(handle.close());

        let event = next_event(&mut rx).await;
        assert!(matches!(event.event, SocketEvent::Closed));
        assert_eq!(handle.state(), SocketState::Closed);
    }
}
