//! Parsers for configuration values and negotiation documents.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A relay endpoint as host and port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressSpec {
    /// Host name or literal address, without brackets
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl AddressSpec {
    /// Create an address from parts.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse a literal `a.b.c.d:port` or `[v6]:port` spec.
    pub fn parse(spec: &str) -> Result<Self> {
        parse_address(spec)
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Parse an address in the form `host:port`.
///
/// The host must be a dotted IPv4 address or a bracketed IPv6 address.
/// Names are not accepted.
pub fn parse_address(spec: &str) -> Result<AddressSpec> {
    let invalid = || Error::InvalidAddress(spec.to_string());

    let (host, port) = if let Some(rest) = spec.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        host.parse::<Ipv6Addr>().map_err(|_| invalid())?;
        (host, port)
    } else {
        let (host, port) = spec.rsplit_once(':').ok_or_else(invalid)?;
        host.parse::<Ipv4Addr>().map_err(|_| invalid())?;
        (host, port)
    };

    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;

    Ok(AddressSpec::new(host, port))
}

/// Parse a count of bytes such as `100`, `1.5m` or `2G`.
///
/// Suffixes `k`, `m` and `g` (either case) scale by powers of 1024.
pub fn parse_byte_count(spec: &str) -> Result<u64> {
    let invalid = || Error::InvalidByteCount(spec.to_string());

    let int_end = spec
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(spec.len());
    if int_end == 0 {
        return Err(invalid());
    }

    let mut num_end = int_end;
    if spec[int_end..].starts_with('.') {
        num_end = spec[int_end + 1..]
            .find(|c: char| !c.is_ascii_digit())
            .map_or(spec.len(), |i| int_end + 1 + i);
    }

    let count: f64 = spec[..num_end].parse().map_err(|_| invalid())?;
    let units: u64 = match &spec[num_end..] {
        "" => 1,
        "k" | "K" => 1024,
        "m" | "M" => 1024 * 1024,
        "g" | "G" => 1024 * 1024 * 1024,
        _ => return Err(invalid()),
    };

    let total = count * units as f64;
    if !total.is_finite() || total > u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(total as u64)
}

/// Extract the address from the connection line (`c=`) of an SDP document.
///
/// IPv4 lines are preferred over IPv6 lines.
pub fn ip_from_sdp(sdp: &str) -> Option<IpAddr> {
    let lines = || sdp.lines().map(|l| l.trim_end_matches('\r'));

    let v4 = lines()
        .filter_map(|l| l.strip_prefix("c=IN IP4 "))
        .find_map(|rest| connection_host(rest).parse::<Ipv4Addr>().ok())
        .map(IpAddr::V4);

    v4.or_else(|| {
        lines()
            .filter_map(|l| l.strip_prefix("c=IN IP6 "))
            .find_map(|rest| connection_host(rest).parse::<Ipv6Addr>().ok())
            .map(IpAddr::V6)
    })
}

// Strips a multicast `/ttl[/count]` suffix.
fn connection_host(rest: &str) -> &str {
    let token = rest.split_whitespace().next().unwrap_or("");
    token.split('/').next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_address() {
        let addr = parse_address("127.0.0.1:9001").unwrap();
        assert_eq!(addr.host, "127.0.0.1");
        assert_eq!(addr.port, 9001);
    }

    #[test]
    fn test_parse_ipv6_address() {
        let addr = parse_address("[::1]:443").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 443);
        assert_eq!(addr.to_string(), "[::1]:443");
    }

    #[test]
    fn test_parse_address_rejects() {
        for spec in [
            "not-an-address",
            "example.com:443",
            "127.0.0.1",
            "127.0.0.1:",
            "127.0.0.1:65536",
            "127.0.0.1:-1",
            "127.0.0.1:+80",
            "::1:443",
            "[::1]443",
            "[zz::1]:443",
        ] {
            assert!(parse_address(spec).is_err(), "accepted {spec:?}");
        }

        assert_eq!(parse_address("0.0.0.0:0").unwrap().port, 0);
        assert_eq!(parse_address("10.0.0.1:65535").unwrap().port, 65535);
    }

    #[test]
    fn test_parse_byte_count() {
        assert_eq!(parse_byte_count("1.5m").unwrap(), 1_572_864);
        assert_eq!(parse_byte_count("100").unwrap(), 100);
        assert_eq!(parse_byte_count("10k").unwrap(), 10 * 1024);
        assert_eq!(parse_byte_count("10K").unwrap(), 10 * 1024);
        assert_eq!(parse_byte_count("2G").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_byte_count("3.").unwrap(), 3);
    }

    #[test]
    fn test_parse_byte_count_rejects() {
        for spec in ["abc", "", "k", ".5m", "10kb", "10 k", "1.5.5", "-1"] {
            assert!(parse_byte_count(spec).is_err(), "accepted {spec:?}");
        }
    }

    #[test]
    fn test_ip_from_sdp() {
        let sdp = "v=0\r\no=- 1 2 IN IP4 127.0.0.1\r\nc=IN IP4 203.0.113.7\r\nm=application 9 UDP/DTLS/SCTP webrtc-datachannel\r\n";
        assert_eq!(ip_from_sdp(sdp), Some("203.0.113.7".parse().unwrap()));

        let sdp = "v=0\nc=IN IP4 224.2.1.1/127/3\n";
        assert_eq!(ip_from_sdp(sdp), Some("224.2.1.1".parse().unwrap()));

        let sdp = "v=0\nc=IN IP6 2001:db8::1\n";
        assert_eq!(ip_from_sdp(sdp), Some("2001:db8::1".parse().unwrap()));

        assert_eq!(ip_from_sdp("v=0\nc=IN IP4 nonsense\n"), None);
        assert_eq!(ip_from_sdp(""), None);
    }
}
