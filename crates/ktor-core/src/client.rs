//! HTTP client handle: direct connection or a per-circuit SOCKS proxy.
//!
//! libcurl easy handles are cheap and per-request, so the "client" is the
//! configuration applied to each handle: proxy route, user agent, connect
//! timeout. One `HttpClient` per circuit; cloning shares the route.

use curl::easy::Easy;
use std::time::Duration;

/// User-Agent sent on every request.
pub const USER_AGENT: &str = "kerbetor";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REDIRECTIONS: u32 = 10;

/// Route for outbound requests: direct, or through one circuit's SOCKS
/// listener. `socks5h` so name resolution happens on the proxy side; a
/// locally unresolvable host (e.g. an onion address) must never leak a DNS
/// query outside the circuit.
#[derive(Debug, Clone)]
pub struct HttpClient {
    proxy: Option<String>,
}

impl HttpClient {
    /// Client that connects directly (no circuit). libcurl still honors
    /// proxy environment variables, matching a plain environment-proxied
    /// client.
    pub fn direct() -> Self {
        Self { proxy: None }
    }

    /// Client routing every request through `socks5h://localhost:<port>`.
    pub fn socks5(port: u16) -> Self {
        Self {
            proxy: Some(format!("socks5h://localhost:{}", port)),
        }
    }

    /// True when this client routes through a circuit.
    pub fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }

    /// Apply this client's configuration to a fresh easy handle.
    pub(crate) fn apply(&self, easy: &mut Easy) -> Result<(), curl::Error> {
        easy.useragent(USER_AGENT)?;
        easy.follow_location(true)?;
        easy.max_redirections(MAX_REDIRECTIONS)?;
        easy.connect_timeout(CONNECT_TIMEOUT)?;
        if let Some(proxy) = &self.proxy {
            easy.proxy(proxy)?;
        }
        Ok(())
    }
}
