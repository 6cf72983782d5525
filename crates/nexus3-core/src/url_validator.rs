//! SSRF guard for outbound URLs used by any skill that reaches back to the
//! agent pool (the `nexus_*` skills). Blocks cloud metadata endpoints,
//! private/link-local ranges, loopback (unless explicitly allowed) and
//! multicast, and defends against DNS rebinding by requiring every resolved
//! address for a hostname to be public.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use url::Url;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum UrlSecurityError {
    #[error("url could not be parsed: {0}")]
    Unparseable(String),
    #[error("url scheme '{0}' is not permitted")]
    SchemeNotAllowed(String),
    #[error("url has no host")]
    NoHost,
    #[error("url resolves to a blocked cloud metadata address: {0}")]
    CloudMetadata(String),
    #[error("url resolves to a blocked private/reserved address: {0}")]
    Blocked(String),
    #[error("url resolves to localhost, which is blocked by default: {0}")]
    Localhost(String),
    #[error("hostname did not resolve to any address")]
    NoResolution,
}

const CLOUD_METADATA_V4: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

fn is_cloud_metadata(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4 == CLOUD_METADATA_V4,
        IpAddr::V6(_) => false,
    }
}

fn is_localhost(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

fn is_multicast(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_multicast(),
    }
}

/// Everything that isn't cloud-metadata, loopback or multicast but is still
/// private/reserved: 10/8, 172.16/12, 192.168/16, link-local 169.254/16,
/// and the IPv6 unique-local (`fc00::/7`) and link-local (`fe80::/10`)
/// equivalents.
fn is_private_or_reserved(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_private()
                || v4.is_link_local()
                || v4.octets()[0] == 0 // 0.0.0.0/8
                || v4.is_broadcast()
        }
        IpAddr::V6(v6) => {
            let segs = v6.segments();
            let is_unique_local = (segs[0] & 0xfe00) == 0xfc00;
            let is_link_local = (segs[0] & 0xffc0) == 0xfe80;
            is_unique_local || is_link_local || v6.is_unspecified()
        }
    }
}

fn classify(ip: IpAddr, allow_localhost: bool) -> Result<(), UrlSecurityError> {
    if is_cloud_metadata(ip) {
        return Err(UrlSecurityError::CloudMetadata(ip.to_string()));
    }
    if is_multicast(ip) {
        return Err(UrlSecurityError::Blocked(ip.to_string()));
    }
    if is_localhost(ip) {
        if allow_localhost {
            return Ok(());
        }
        return Err(UrlSecurityError::Localhost(ip.to_string()));
    }
    if is_private_or_reserved(ip) {
        return Err(UrlSecurityError::Blocked(ip.to_string()));
    }
    Ok(())
}

/// Resolves every address a hostname maps to, rather than the first one a
/// naive `gethostbyname`-style call would return, so an attacker can't hide
/// a blocked address behind a round-robin DNS rebinding trick — every
/// resolved address must be public, not just one of them.
fn resolve_all(host: &str, port: u16) -> Result<Vec<IpAddr>, UrlSecurityError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let addrs = (host, port)
        .to_socket_addrs()
        .map_err(|e| UrlSecurityError::Unparseable(e.to_string()))?;
    let ips: Vec<IpAddr> = addrs.map(|a| a.ip()).collect();
    if ips.is_empty() {
        return Err(UrlSecurityError::NoResolution);
    }
    Ok(ips)
}

/// Validates a URL before it's fetched by any Nexus skill. `allow_localhost`
/// is an explicit opt-in; private ranges other than localhost/metadata have
/// no opt-in in this guard (callers needing `allow_private` pass it through
/// a separate policy check upstream, not by weakening this function).
pub fn validate_url(url: &str, allow_localhost: bool) -> Result<(), UrlSecurityError> {
    let parsed = Url::parse(url).map_err(|e| UrlSecurityError::Unparseable(e.to_string()))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(UrlSecurityError::SchemeNotAllowed(parsed.scheme().to_string()));
    }

    let host = parsed.host_str().ok_or(UrlSecurityError::NoHost)?;
    let port = parsed.port_or_known_default().unwrap_or(443);

    let addrs = resolve_all(host, port)?;
    for ip in addrs {
        classify(ip, allow_localhost)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_cloud_metadata() {
        assert!(matches!(
            validate_url("http://169.254.169.254/latest/meta-data", false),
            Err(UrlSecurityError::CloudMetadata(_))
        ));
    }

    #[test]
    fn blocks_private_ranges() {
        for host in ["http://10.0.0.1/", "http://172.16.0.1/", "http://192.168.1.1/"] {
            assert!(validate_url(host, false).is_err(), "{host} should be blocked");
        }
    }

    #[test]
    fn blocks_loopback_unless_allowed() {
        assert!(matches!(
            validate_url("http://127.0.0.1/", false),
            Err(UrlSecurityError::Localhost(_))
        ));
        assert!(validate_url("http://127.0.0.1/", true).is_ok());
    }

    #[test]
    fn blocks_multicast() {
        assert!(validate_url("http://224.0.0.1/", false).is_err());
    }

    #[test]
    fn blocks_ipv6_equivalents() {
        assert!(validate_url("http://[::1]/", false).is_err());
        assert!(validate_url("http://[fe80::1]/", false).is_err());
        assert!(validate_url("http://[fc00::1]/", false).is_err());
        assert!(validate_url("http://[ff02::1]/", false).is_err());
    }

    #[test]
    fn allows_public_ip() {
        assert!(validate_url("http://93.184.216.34/", false).is_ok());
    }

    #[test]
    fn rejects_non_http_scheme() {
        assert!(matches!(
            validate_url("file:///etc/passwd", false),
            Err(UrlSecurityError::SchemeNotAllowed(_))
        ));
    }
}
