//! WebSocket relay.
//!
//! Every accepted client socket is paired with exactly one upstream socket:
//! - [`Acceptor`] - Reads the requested target and builds the pair
//! - [`UpstreamConnector`] - Dials the target, directly or through a proxy tunnel
//! - [`RelaySession`] - Forwards frames between the pair and tears both down together
//! - [`upgrade`] - Glue between the HTTP server and the acceptor

mod acceptor;
mod bridge;
mod connector;
mod frame;
mod proxy_tunnel;
mod request;
mod session;
mod socket;

pub use acceptor::Acceptor;
pub use bridge::upgrade;
pub use connector::{TransportConfig, UpstreamConnector, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROXY_ADDRESS};
