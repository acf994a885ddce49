use crate::headers;
use axum::http::HeaderMap;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

/// Sentinel used when no valid client address can be determined
pub const UNKNOWN_IP: &str = "unknown";

/// Case-insensitive header access
pub trait HeaderLookup {
    fn header(&self, name: &str) -> Option<&str>;
}

impl HeaderLookup for HeaderMap {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| v.to_str().ok())
    }
}

impl HeaderLookup for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Who a request is attributed to for admission control
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    pub ip: String,
    pub reporter_id: Option<String>,
    pub app_name: Option<String>,
}

impl Identifier {
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            reporter_id: None,
            app_name: None,
        }
    }

    pub fn with_reporter(mut self, reporter_id: impl Into<String>) -> Self {
        self.reporter_id = Some(reporter_id.into());
        self
    }

    pub fn with_app(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = Some(app_name.into());
        self
    }

    /// Build an identifier from request headers and the peer address
    pub fn from_request<H: HeaderLookup + ?Sized>(
        headers: &H,
        peer: Option<IpAddr>,
        trust_proxy_headers: bool,
    ) -> Self {
        Self {
            ip: client_ip(headers, peer, trust_proxy_headers),
            reporter_id: non_empty(headers.header(headers::REPORTER_ID)),
            app_name: non_empty(headers.header(headers::SOURCE)),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Resolve the client address
///
/// Without `trust_proxy_headers` only the socket peer counts. Otherwise the
/// first present source wins (`x-forwarded-for` first hop, `x-real-ip`,
/// `cf-connecting-ip`, then the socket peer). A present but malformed value
/// yields [`UNKNOWN_IP`] instead of falling through to the next source.
pub fn client_ip<H: HeaderLookup + ?Sized>(
    headers: &H,
    peer: Option<IpAddr>,
    trust_proxy_headers: bool,
) -> String {
    let peer_ip = || peer.map_or_else(|| UNKNOWN_IP.to_string(), |ip| ip.to_string());
    if !trust_proxy_headers {
        return peer_ip();
    }

    let forwarded = headers
        .header(headers::FORWARDED_FOR)
        .and_then(|v| v.split(',').next());

    let candidate = forwarded
        .or_else(|| headers.header(headers::REAL_IP))
        .or_else(|| headers.header(headers::CF_CONNECTING_IP))
        .map(str::trim)
        .filter(|v| !v.is_empty());

    match candidate {
        Some(raw) => parse_ip(raw).map_or_else(|| UNKNOWN_IP.to_string(), |ip| ip.to_string()),
        None => peer_ip(),
    }
}

fn parse_ip(raw: &str) -> Option<IpAddr> {
    raw.parse::<IpAddr>()
        .ok()
        .or_else(|| raw.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
