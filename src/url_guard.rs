//! Classifies URL destinations as public or private before any outgoing request.
//!
//! Remote servers can hand us arbitrary URLs (actor ids, inboxes, key ids), so
//! every fetch runs through [classify] or [verify_url] first. This prevents
//! server-side request forgery against loopback services and internal networks.

use crate::error::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use url::{Host, Url};

/// Where a URL points, as far as can be told from the URL itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UrlKind {
    /// Routable public address or a hostname that needs DNS resolution to judge.
    Public,
    /// Loopback, link-local, RFC 1918, unique-local or an equivalent hostname.
    Private,
}

/// Classify the destination of `url` without performing any network I/O.
///
/// Non-`http(s)` schemes fail with [Error::NonHttpUrl]. IP literals are
/// classified exactly (compressed IPv6 forms are expanded by the address
/// parser). Hostnames that are by definition local (`localhost`,
/// `*.localhost`, `*.local`) are private; all other hostnames classify as
/// public here and get resolved in [verify_url].
pub fn classify(url: &Url) -> Result<UrlKind, Error> {
    match url.scheme() {
        "http" | "https" => {}
        _ => return Err(Error::NonHttpUrl(url.clone())),
    }
    let host = url
        .host()
        .ok_or(Error::UrlVerification("url has no host"))?;
    Ok(match host {
        Host::Ipv4(addr) => classify_ipv4(addr),
        Host::Ipv6(addr) => classify_ipv6(addr),
        Host::Domain(name) => classify_hostname(name),
    })
}

/// Verify that `url` may be fetched, resolving hostnames through DNS.
///
/// Every address a hostname resolves to is classified; a single private
/// address makes the whole hostname private. With `allow_private` the
/// private check is skipped but the scheme check still applies.
pub async fn verify_url(url: &Url, allow_private: bool) -> Result<(), Error> {
    let kind = classify(url)?;
    if allow_private {
        return Ok(());
    }
    if kind == UrlKind::Private {
        return Err(Error::UrlVerification("url points at a private address"));
    }
    if let Some(Host::Domain(name)) = url.host() {
        let port = url.port_or_known_default().unwrap_or(443);
        let addrs = tokio::net::lookup_host((name, port))
            .await
            .map_err(|_| Error::UrlVerification("hostname did not resolve"))?;
        for addr in addrs {
            let kind = match addr.ip() {
                IpAddr::V4(v4) => classify_ipv4(v4),
                IpAddr::V6(v6) => classify_ipv6(v6),
            };
            if kind == UrlKind::Private {
                return Err(Error::UrlVerification(
                    "hostname resolves to a private address",
                ));
            }
        }
    }
    Ok(())
}

fn classify_ipv4(addr: Ipv4Addr) -> UrlKind {
    let o = addr.octets();
    let private = addr.is_loopback()
        || addr.is_unspecified()
        || o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254);
    if private {
        UrlKind::Private
    } else {
        UrlKind::Public
    }
}

fn classify_ipv6(addr: Ipv6Addr) -> UrlKind {
    // An IPv4-mapped address inherits the classification of its v4 form.
    if let Some(v4) = addr.to_ipv4_mapped() {
        return classify_ipv4(v4);
    }
    let seg = addr.segments();
    let private = addr.is_loopback()
        || addr.is_unspecified()
        // fc00::/7 unique local
        || (seg[0] & 0xfe00) == 0xfc00
        // fe80::/10 link local
        || (seg[0] & 0xffc0) == 0xfe80;
    if private {
        UrlKind::Private
    } else {
        UrlKind::Public
    }
}

fn classify_hostname(name: &str) -> UrlKind {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.eq_ignore_ascii_case("localhost") {
        return UrlKind::Private;
    }
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".localhost") || lower.ends_with(".local") {
        return UrlKind::Private;
    }
    UrlKind::Public
}
