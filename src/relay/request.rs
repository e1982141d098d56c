use url::Url;

use crate::error::{RelayError, Result};

/// Name of the query parameter that carries the upstream URL
pub const TARGET_PARAM: &str = "target";

/// Upstream target requested by a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    url: Url,
    secure: bool,
}

impl RelayRequest {
    /// Parse and validate a `ws://` or `wss://` target URL
    pub fn parse(target: &str) -> Result<Self> {
        let target = target.trim();
        if target.is_empty() {
            return Err(RelayError::MissingTarget);
        }

        let url =
            Url::parse(target).map_err(|e| RelayError::invalid_target(target, e.to_string()))?;

        let secure = match url.scheme() {
            "wss" => true,
            "ws" => false,
            other => {
                return Err(RelayError::invalid_target(
                    target,
                    format!("unsupported scheme '{}', expected ws or wss", other),
                ))
            }
        };

        if url.host_str().map_or(true, str::is_empty) {
            return Err(RelayError::invalid_target(target, "missing host"));
        }

        Ok(Self { url, secure })
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host as it appears in an authority (IPv6 addresses keep their brackets)
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Explicit port, or 80/443 for ws/wss
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.secure { 443 } else { 80 })
    }
}

/// Extract the `target` query parameter. Empty values count as absent.
pub fn target_param(query: Option<&str>) -> Option<String> {
    let query = query?;

    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TARGET_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_target() {
        let req = RelayRequest::parse("ws://localhost:9999/echo").unwrap();

        assert!(!req.is_secure());
        assert_eq!(req.host(), "localhost");
        assert_eq!(req.port(), 9999);
        assert_eq!(req.as_str(), "ws://localhost:9999/echo");
    }

    #[test]
    fn test_parse_secure_target_default_port() {
        let req = RelayRequest::parse("wss://example.com/socket?x=1").unwrap();

        assert!(req.is_secure());
        assert_eq!(req.port(), 443);
        assert_eq!(req.as_str(), "wss://example.com/socket?x=1");
    }

    #[test]
    fn test_parse_ipv6_host_keeps_brackets() {
        let req = RelayRequest::parse("ws://[::1]:8000/").unwrap();

        assert_eq!(req.host(), "[::1]");
        assert_eq!(req.port(), 8000);
    }

    #[test]
    fn test_parse_empty_is_missing() {
        assert!(matches!(
            RelayRequest::parse("  "),
            Err(RelayError::MissingTarget)
        ));
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        let err = RelayRequest::parse("http://example.com/").unwrap_err();

        assert!(matches!(err, RelayError::InvalidTarget { .. }));
        assert!(err.to_string().contains("unsupported scheme 'http'"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(
            RelayRequest::parse("not a url"),
            Err(RelayError::InvalidTarget { .. })
        ));
    }

    #[test]
    fn test_target_param_decodes_value() {
        let query = "target=ws%3A%2F%2Fhost%3A1234%2Fpath%3Fa%3Db&other=1";

        assert_eq!(
            target_param(Some(query)),
            Some("ws://host:1234/path?a=b".to_string())
        );
    }

    #[test]
    fn test_target_param_missing_or_empty() {
        assert_eq!(target_param(None), None);
        assert_eq!(target_param(Some("")), None);
        assert_eq!(target_param(Some("foo=bar")), None);
        assert_eq!(target_param(Some("target=")), None);
    }

    #[test]
    fn test_target_param_first_wins() {
        assert_eq!(
            target_param(Some("target=ws://a/&target=ws://b/")),
            Some("ws://a/".to_string())
        );
    }
}
