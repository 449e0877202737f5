//! Client address extraction

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderMap, Request},
};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Address the GeoIP lookup is run against.
///
/// The TCP peer is used unless forwarded headers are trusted, in which case
/// the first parseable address from `Forwarded`, `X-Forwarded-For` and
/// `X-Real-IP` (in that order) wins.
pub fn client_ip<B>(request: &Request<B>, trust_forwarded: bool) -> Option<IpAddr> {
    if trust_forwarded {
        if let Some(ip) = forwarded_ip(request.headers()) {
            return Some(ip);
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
}

fn forwarded_ip(headers: &HeaderMap) -> Option<IpAddr> {
    // RFC 7239: Forwarded: for=192.0.2.60;proto=http, for="[2001:db8::1]:4711"
    if let Some(forwarded) = headers.get(header::FORWARDED).and_then(|v| v.to_str().ok()) {
        let first = forwarded.split(',').next().unwrap_or("");
        for part in first.split(';') {
            let Some(value) = part.trim().strip_prefix("for=") else {
                continue;
            };
            if let Some(ip) = parse_node(value.trim().trim_matches('"')) {
                return Some(ip);
            }
        }
    }

    if let Some(forwarded_for) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(ip) = forwarded_for
            .split(',')
            .next()
            .and_then(|first| IpAddr::from_str(first.trim()).ok())
        {
            return Some(ip);
        }
    }

    headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| IpAddr::from_str(v.trim()).ok())
}

/// Parse a Forwarded node, stripping brackets and ports
fn parse_node(node: &str) -> Option<IpAddr> {
    if let Some(rest) = node.strip_prefix('[') {
        let end = rest.find(']')?;
        return IpAddr::from_str(&rest[..end]).ok();
    }

    if let Ok(ip) = IpAddr::from_str(node) {
        return Some(ip);
    }

    // IPv4 with port
    let (host, _port) = node.rsplit_once(':')?;
    IpAddr::from_str(host).ok()
}
