use base64::Engine;
use http::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;

use crate::error::{RelayError, Result};

/// Upper bound on the proxy's response head to a CONNECT request
const MAX_RESPONSE_HEAD: usize = 8 * 1024;

/// HTTP forward proxy reached with `CONNECT`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTunnel {
    address: Url,
}

impl ProxyTunnel {
    pub fn new(address: Url) -> Self {
        Self { address }
    }

    pub fn address(&self) -> &Url {
        &self.address
    }

    /// `host:port` of the proxy itself
    fn authority(&self) -> Result<String> {
        let host = self
            .address
            .host_str()
            .ok_or_else(|| RelayError::ProxyTunnel(format!("no host in {}", self.address)))?;
        let port = self.address.port_or_known_default().unwrap_or(8080);
        Ok(format!("{}:{}", host, port))
    }

    /// `Proxy-Authorization` value built from credentials in the proxy URL
    fn authorization(&self) -> Option<String> {
        let user = self.address.username();
        if user.is_empty() {
            return None;
        }
        let pass = self.address.password().unwrap_or_default();
        let credentials =
            base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", user, pass));
        Some(format!("Basic {}", credentials))
    }

    /// Open a TCP connection to the proxy and ask it to tunnel to `host:port`
    pub async fn open(&self, host: &str, port: u16) -> Result<TcpStream> {
        let authority = self.authority()?;
        debug!("Opening proxy tunnel via {} to {}:{}", authority, host, port);

        let mut stream = TcpStream::connect(&authority).await.map_err(|e| {
            RelayError::ProxyTunnel(format!("cannot reach proxy {}: {}", authority, e))
        })?;
        stream.set_nodelay(true)?;

        handshake(&mut stream, host, port, self.authorization().as_deref()).await?;
        Ok(stream)
    }
}

/// Send a CONNECT request and wait for the proxy to accept it
async fn handshake<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    authorization: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n",
        host = host,
        port = port
    );
    if let Some(auth) = authorization {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).await?;
    stream.flush().await?;

    let head = read_response_head(stream).await?;
    let status = parse_status(&head)?;

    if status != StatusCode::OK {
        return Err(RelayError::ProxyTunnel(format!(
            "proxy rejected CONNECT to {}:{}: {}",
            host, port, status
        )));
    }

    Ok(())
}

/// Read up to and including the blank line that ends the response head.
///
/// Reads a byte at a time so nothing belonging to the tunnelled stream is
/// consumed.
async fn read_response_head<S>(stream: &mut S) -> Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut head = Vec::with_capacity(256);
    let mut byte = [0u8; 1];

    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_RESPONSE_HEAD {
            return Err(RelayError::ProxyTunnel(
                "proxy response head too large".to_string(),
            ));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(RelayError::ProxyTunnel(
                "proxy closed connection during CONNECT".to_string(),
            ));
        }
        head.push(byte[0]);
    }

    Ok(head)
}

/// Status code from an `HTTP/1.x NNN Reason` status line
fn parse_status(head: &[u8]) -> Result<StatusCode> {
    let text = String::from_utf8_lossy(head);
    let line = text.lines().next().unwrap_or_default();
    let mut parts = line.split_whitespace();

    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(RelayError::ProxyTunnel(format!(
            "malformed proxy response: {}",
            line
        )));
    }

    parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| {
            RelayError::ProxyTunnel(format!("malformed proxy response: {}", line))
        })
}
