use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::{
    client_async, client_async_tls, connect_async, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info};
use url::Url;

use super::frame::split_tungstenite;
use super::proxy_tunnel::ProxyTunnel;
use super::request::RelayRequest;
use super::socket::{spawn_dial, Observer, SocketHandle};
use crate::error::{RelayError, Result};

/// Default forward proxy (Burp's default listener)
pub const DEFAULT_PROXY_ADDRESS: &str = "http://127.0.0.1:8080";

/// Default bound on establishing an upstream connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub type UpstreamStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Process-wide settings for outbound connections, fixed at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    pub use_proxy_tunnel: bool,
    pub proxy_address: Url,
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            use_proxy_tunnel: false,
            proxy_address: Url::parse(DEFAULT_PROXY_ADDRESS)
                .expect("default proxy address is valid"),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// How an upstream connection is routed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tunnel {
    /// Dial the target directly
    Direct,
    /// CONNECT through the proxy, then a cleartext WebSocket handshake
    Plain(ProxyTunnel),
    /// CONNECT through the proxy, then TLS to the target, then the handshake
    Secure(ProxyTunnel),
}

impl Tunnel {
    pub fn select(config: &TransportConfig, secure: bool) -> Self {
        if !config.use_proxy_tunnel {
            return Tunnel::Direct;
        }

        let proxy = ProxyTunnel::new(config.proxy_address.clone());
        if secure {
            Tunnel::Secure(proxy)
        } else {
            Tunnel::Plain(proxy)
        }
    }

    pub async fn dial(&self, request: &RelayRequest) -> Result<UpstreamStream> {
        let (ws_stream, response) = match self {
            Tunnel::Direct => connect_async(request.as_str()).await?,
            Tunnel::Plain(proxy) => {
                let tcp = proxy.open(request.host(), request.port()).await?;
                client_async(request.as_str(), MaybeTlsStream::Plain(tcp)).await?
            }
            Tunnel::Secure(proxy) => {
                let tcp = proxy.open(request.host(), request.port()).await?;
                client_async_tls(request.as_str(), tcp).await?
            }
        };

        debug!(
            "Upstream handshake with {} completed, status: {}",
            request.as_str(),
            response.status()
        );
        Ok(ws_stream)
    }
}

impl std::fmt::Display for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tunnel::Direct => write!(f, "direct"),
            Tunnel::Plain(proxy) => write!(f, "plain tunnel via {}", proxy.address()),
            Tunnel::Secure(proxy) => write!(f, "secure tunnel via {}", proxy.address()),
        }
    }
}

/// Opens upstream WebSocket connections
#[derive(Debug, Clone)]
pub struct UpstreamConnector {
    config: Arc<TransportConfig>,
}

impl UpstreamConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn tunnel_for(&self, request: &RelayRequest) -> Tunnel {
        Tunnel::select(&self.config, request.is_secure())
    }

    /// Validate `target` and start dialing it in the background.
    ///
    /// Returns immediately with a `Connecting` handle. Invalid targets fail
    /// here, before any network activity; everything that goes wrong while
    /// dialing is reported to `observer` instead.
    pub fn connect(&self, target: &str, observer: Observer) -> Result<SocketHandle> {
        let request = RelayRequest::parse(target)?;
        let tunnel = self.tunnel_for(&request);
        let timeout = self.config.connect_timeout;

        info!("Dialing upstream {} ({})", request.as_str(), tunnel);

        let dial = async move {
            let ws_stream = tokio::time::timeout(timeout, tunnel.dial(&request))
                .await
                .map_err(|_| {
                    RelayError::UpstreamConnect(format!(
                        "timed out after {:?} connecting to {}",
                        timeout,
                        request.as_str()
                    ))
                })??;
            Ok(split_tungstenite(ws_stream))
        };

        Ok(spawn_dial(dial, observer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::frame::Frame;
    use crate::relay::socket::{event_channel, Role, SocketEvent, SocketState};
    use futures_util::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    fn proxied_config() -> TransportConfig {
        TransportConfig {
            use_proxy_tunnel: true,
            ..Default::default()
        }
    }

    #[test]
    fn test_direct_when_tunnel_disabled() {
        let config = TransportConfig::default();

        assert_eq!(Tunnel::select(&config, false), Tunnel::Direct);
        assert_eq!(Tunnel::select(&config, true), Tunnel::Direct);
    }

    #[test]
    fn test_tunnel_selected_by_scheme() {
        let connector = UpstreamConnector::new(proxied_config());
        let proxy = ProxyTunnel::new(Url::parse(DEFAULT_PROXY_ADDRESS).unwrap());

        let secure = RelayRequest::parse("wss://example.com/ws").unwrap();
        let plain = RelayRequest::parse("ws://example.com/ws").unwrap();

        assert_eq!(connector.tunnel_for(&secure), Tunnel::Secure(proxy.clone()));
        assert_eq!(connector.tunnel_for(&plain), Tunnel::Plain(proxy));
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_target() {
        let connector = UpstreamConnector::new(TransportConfig::default());
        let (tx, mut rx) = event_channel();

        let result = connector.connect("", Observer::new(Role::Upstream, tx));

        assert!(matches!(result, Err(RelayError::MissingTarget)));
        // No driver was spawned, so nothing will ever be reported.
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_target() {
        let connector = UpstreamConnector::new(TransportConfig::default());
        let (tx, _rx) = event_channel();

        let observer = Observer::new(Role::Upstream, tx);

        let result = connector.connect("http://example.com", observer);

        assert!(matches!(result, Err(RelayError::InvalidTarget { .. })));
    }

    #[tokio::test]
    async fn test_connect_returns_connecting_then_opens() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Text("ready".into())).await.unwrap();
            while let Some(Ok(_)) = ws.next().await {}
        });

        let connector = UpstreamConnector::new(TransportConfig::default());
        let (tx, mut rx) = event_channel();
        let handle = connector
            .connect(&format!("ws://{}/", addr), Observer::new(Role::Upstream, tx))
            .unwrap();
        assert_eq!(handle.state(), SocketState::Connecting);

        let event = rx.recv().await.unwrap();
        assert!(matches!(event.event, SocketEvent::Opened));
        assert_eq!(handle.state(), SocketState::Open);

        let event = rx.recv().await.unwrap();
        match event.event {
            SocketEvent::Message(frame) => assert_eq!(frame, Frame::Text("ready".into())),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_asynchronously() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = UpstreamConnector::new(TransportConfig::default());
        let (tx, mut rx) = event_channel();
        let handle = connector
            .connect(&format!("ws://{}/", addr), Observer::new(Role::Upstream, tx))
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(
            event.event,
            SocketEvent::Error(RelayError::UpstreamConnect(_))
        ));
        let event = rx.recv().await.unwrap();
        assert!(matches!(event.event, SocketEvent::Closed));
        assert_eq!(handle.state(), SocketState::Closed);
    }
}
