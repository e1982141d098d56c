//! The relay's view of WebSocket traffic.
//!
//! Both the client side (axum) and the upstream side (tungstenite) are adapted
//! into the same [`Frame`] model so a socket driver never needs to know which
//! library owns the transport. Ping and pong are answered by each endpoint
//! itself and never surface as frames.

use axum::extract::ws::Message as AxumMessage;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

/// A frame passed between a socket driver and its transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl Frame {
    pub fn from_tungstenite(msg: Message) -> Option<Self> {
        match msg {
            Message::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            Message::Binary(data) => Some(Frame::Binary(data.to_vec())),
            Message::Close(_) => Some(Frame::Close),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => None,
        }
    }

    pub fn into_tungstenite(self) -> Message {
        match self {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Close => Message::Close(None),
        }
    }

    pub fn from_axum(msg: AxumMessage) -> Option<Self> {
        match msg {
            AxumMessage::Text(text) => Some(Frame::Text(text.as_str().to_owned())),
            AxumMessage::Binary(data) => Some(Frame::Binary(data.to_vec())),
            AxumMessage::Close(_) => Some(Frame::Close),
            AxumMessage::Ping(_) | AxumMessage::Pong(_) => None,
        }
    }

    pub fn into_axum(self) -> AxumMessage {
        match self {
            Frame::Text(text) => AxumMessage::Text(text.into()),
            Frame::Binary(data) => AxumMessage::Binary(data.into()),
            Frame::Close => AxumMessage::Close(None),
        }
    }
}

/// Split a tungstenite stream into a frame sink and a frame stream
#[allow(clippy::type_complexity)]
pub fn split_tungstenite<S>(
    ws: WebSocketStream<S>,
) -> (
    impl Sink<Frame, Error = tungstenite::Error> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame, tungstenite::Error>> + Send + Unpin + 'static,
)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (sink, stream) = ws.split();

    let sink = sink.with(|frame: Frame| {
        future::ready(Ok::<_, tungstenite::Error>(frame.into_tungstenite()))
    });
    let stream = stream.filter_map(|result| {
        future::ready(match result {
            Ok(msg) => Frame::from_tungstenite(msg).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });

    (sink, stream)
}

/// Split an axum WebSocket into a frame sink and a frame stream
#[allow(clippy::type_complexity)]
pub fn split_axum(
    ws: axum::extract::ws::WebSocket,
) -> (
    impl Sink<Frame, Error = axum::Error> + Send + Unpin + 'static,
    impl Stream<Item = Result<Frame, axum::Error>> + Send + Unpin + 'static,
) {
    let (sink, stream) = ws.split();

    let sink =
        sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(frame.into_axum())));
    let stream = stream.filter_map(|result| {
        future::ready(match result {
            Ok(msg) => Frame::from_axum(msg).map(Ok),
            Err(e) => Some(Err(e)),
        })
    });

    (sink, stream)
}
