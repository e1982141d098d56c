//! Configuration management for the relay.
//!
//! Settings are layered: command line and environment first, then the config
//! file (`config.toml` in the platform config directory unless `--config`
//! says otherwise), then built-in defaults.

use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::relay::{TransportConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PROXY_ADDRESS};

pub const DEFAULT_PORT: u16 = 9000;
pub const DEFAULT_BIND: IpAddr = IpAddr::V4(Ipv4Addr::UNSPECIFIED);

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub landing_page: Option<PathBuf>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub enabled: Option<bool>,
    pub address: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub connect_timeout_secs: Option<u64>,
}

impl Config {
    /// Config file with every setting spelled out at its default
    pub fn with_defaults() -> Self {
        Self {
            server: ServerConfig {
                port: Some(DEFAULT_PORT),
                bind: Some(DEFAULT_BIND),
                landing_page: None,
            },
            proxy: ProxyConfig {
                enabled: Some(false),
                address: Some(DEFAULT_PROXY_ADDRESS.to_string()),
            },
            upstream: UpstreamConfig {
                connect_timeout_secs: Some(DEFAULT_CONNECT_TIMEOUT.as_secs()),
            },
        }
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from `path`; a missing file is an empty config
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))
    }

    pub fn config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("", "", "ws-relay")
            .context("Could not determine config directory")?;

        Ok(proj_dirs.config_dir().join("config.toml"))
    }
}

/// Values given on the command line or through the environment
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub use_proxy: Option<bool>,
    pub proxy_address: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub landing_page: Option<PathBuf>,
}

/// Fully resolved settings, fixed for the life of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub listen: SocketAddr,
    pub landing_page: Option<PathBuf>,
    pub transport: TransportConfig,
}

impl Settings {
    pub fn resolve(overrides: Overrides, config: &Config) -> Result<Self> {
        let port = overrides
            .port
            .or(config.server.port)
            .unwrap_or(DEFAULT_PORT);
        let bind = overrides
            .bind
            .or(config.server.bind)
            .unwrap_or(DEFAULT_BIND);

        let use_proxy_tunnel = overrides
            .use_proxy
            .or(config.proxy.enabled)
            .unwrap_or(false);
        let proxy_address = overrides
            .proxy_address
            .or_else(|| config.proxy.address.clone())
            .unwrap_or_else(|| DEFAULT_PROXY_ADDRESS.to_string());
        let proxy_address = parse_proxy_address(&proxy_address)?;

        let connect_timeout = overrides
            .connect_timeout_secs
            .or(config.upstream.connect_timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        if connect_timeout.is_zero() {
            bail!("Connect timeout must be at least one second");
        }

        Ok(Self {
            listen: SocketAddr::new(bind, port),
            landing_page: overrides
                .landing_page
                .or_else(|| config.server.landing_page.clone()),
            transport: TransportConfig {
                use_proxy_tunnel,
                proxy_address,
                connect_timeout,
            },
        })
    }
}

impl fmt::Display for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "listen          = {}", self.listen)?;
        match &self.landing_page {
            Some(path) => writeln!(f, "landing_page    = {}", path.display())?,
            None => writeln!(f, "landing_page    = (built in)")?,
        }
        writeln!(f, "proxy.enabled   = {}", self.transport.use_proxy_tunnel)?;
        writeln!(f, "proxy.address   = {}", self.transport.proxy_address)?;
        write!(
            f,
            "connect_timeout = {}s",
            self.transport.connect_timeout.as_secs()
        )
    }
}

fn parse_proxy_address(address: &str) -> Result<Url> {
    let url = Url::parse(address).with_context(|| format!("Invalid proxy address: {}", address))?;

    if url.scheme() != "http" {
        bail!(
            "Unsupported proxy address {}: only http:// proxies are supported",
            address
        );
    }
    if url.host_str().map_or(true, str::is_empty) {
        bail!("Proxy address {} has no host", address);
    }

    Ok(url)
}
