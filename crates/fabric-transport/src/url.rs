//! Contact URLs: `fabric://host:port/?ptag=N&cookie=M`.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::nic::Credentials;

/// URL scheme of a contact URL.
pub const SCHEME: &str = "fabric";

/// A parsed contact URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FabricUrl {
    /// Host name or address of the rendezvous listener.
    pub host: String,
    /// Rendezvous port.
    pub port: u16,
    /// Protection domain the peer expects.
    pub credentials: Credentials,
}

fn bad(url: &str, reason: impl Into<String>) -> TransportError {
    TransportError::InvalidUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
}

impl FabricUrl {
    /// Builds a URL from its parts.
    pub fn new(host: impl Into<String>, port: u16, credentials: Credentials) -> Self {
        Self {
            host: host.into(),
            port,
            credentials,
        }
    }

    /// Parses `fabric://host:port/?ptag=N&cookie=M`; both query keys are
    /// required.
    pub fn parse(url: &str) -> Result<Self> {
        let rest = url
            .strip_prefix(SCHEME)
            .and_then(|r| r.strip_prefix("://"))
            .ok_or_else(|| bad(url, format!("expected {SCHEME}:// scheme")))?;

        let authority_end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(authority_end);

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let close = bracketed
                .find(']')
                .ok_or_else(|| bad(url, "unterminated IPv6 address"))?;
            let port = bracketed[close + 1..]
                .strip_prefix(':')
                .ok_or_else(|| bad(url, "missing port"))?;
            (&bracketed[..close], port)
        } else {
            authority
                .rsplit_once(':')
                .ok_or_else(|| bad(url, "missing port"))?
        };
        if host.is_empty() {
            return Err(bad(url, "missing host"));
        }
        let port: u16 = port.parse().map_err(|_| bad(url, "bad port"))?;
        if port == 0 {
            return Err(bad(url, "port must be nonzero"));
        }

        let query = tail.strip_prefix('/').unwrap_or(tail);
        let query = match query.strip_prefix('?') {
            Some(q) => q,
            None if query.is_empty() => "",
            None => return Err(bad(url, "unexpected path")),
        };

        let mut ptag = None;
        let mut cookie = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| bad(url, format!("malformed query pair {pair:?}")))?;
            let value: u32 = value
                .parse()
                .map_err(|_| bad(url, format!("{key} is not a number")))?;
            match key {
                "ptag" => ptag = Some(value),
                "cookie" => cookie = Some(value),
                other => return Err(bad(url, format!("unknown parameter {other:?}"))),
            }
        }

        Ok(Self {
            host: host.to_string(),
            port,
            credentials: Credentials {
                ptag: ptag.ok_or_else(|| bad(url, "missing ptag"))?,
                cookie: cookie.ok_or_else(|| bad(url, "missing cookie"))?,
            },
        })
    }

    /// Resolves the host to its first socket address.
    pub fn resolve(&self) -> Result<SocketAddr> {
        let resolution = |reason: String| TransportError::NameResolution {
            host: self.host.clone(),
            reason,
        };
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|e| resolution(e.to_string()))?
            .next()
            .ok_or_else(|| resolution("no addresses".to_string()))
    }
}

impl fmt::Display for FabricUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        write!(
            f,
            "{SCHEME}://{host}:{}/?ptag={}&cookie={}",
            self.port, self.credentials.ptag, self.credentials.cookie
        )
    }
}

impl FromStr for FabricUrl {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    #[test]
    fn test_parse_full_url() {
        let url = FabricUrl::parse("fabric://node7:4710/?ptag=3&cookie=99").unwrap();
        assert_eq!(url.host, "node7");
        assert_eq!(url.port, 4710);
        assert_eq!(url.credentials, Credentials { ptag: 3, cookie: 99 });
    }

    #[test]
    fn test_display_parses_back() {
        let url = FabricUrl::new("127.0.0.1", 9000, Credentials { ptag: 1, cookie: 0 });
        let text = url.to_string();
        assert_eq!(text, "fabric://127.0.0.1:9000/?ptag=1&cookie=0");
        assert_eq!(text.parse::<FabricUrl>().unwrap(), url);
    }

    #[test]
    fn test_ipv6_host() {
        let url = FabricUrl::parse("fabric://[::1]:9000?ptag=1&cookie=2").unwrap();
        assert_eq!(url.host, "::1");
        assert_eq!(url.to_string(), "fabric://[::1]:9000/?ptag=1&cookie=2");
    }

    #[test]
    fn test_malformed_urls_are_einval() {
        for bad_url in [
            "tcp://host:1/?ptag=1&cookie=1",
            "fabric://host/?ptag=1&cookie=1",
            "fabric://:4000/?ptag=1&cookie=1",
            "fabric://host:0/?ptag=1&cookie=1",
            "fabric://host:99999/?ptag=1&cookie=1",
            "fabric://host:4000/?ptag=x&cookie=1",
            "fabric://host:4000/?ptag=1",
            "fabric://host:4000/?ptag=1&cookie=1&colour=red",
            "fabric://host:4000/path",
        ] {
            let err = FabricUrl::parse(bad_url).unwrap_err();
            assert_eq!(err.code(), ResultCode::InvalidArgument, "{bad_url}");
        }
    }

    #[test]
    fn test_resolve_localhost() {
        let url = FabricUrl::parse("fabric://127.0.0.1:4000/?ptag=1&cookie=1").unwrap();
        let addr = url.resolve().unwrap();
        assert_eq!(addr.port(), 4000);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn test_resolve_failure_is_enoent() {
        let url = FabricUrl::parse("fabric://no-such-host.invalid:4000/?ptag=1&cookie=1").unwrap();
        assert_eq!(url.resolve().unwrap_err().code(), ResultCode::NoEntry);
    }
}
