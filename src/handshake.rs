//! Handshake parsing: identity extraction, subprotocol negotiation, CORS/IP
//! matching, and close-code validation (spec §4.10, §6, §8).

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use percent_encoding::percent_decode_str;

/// Immutable, set once the upgrade completes (spec §3 "Handshake info").
#[derive(Debug, Clone)]
pub struct HandshakeInfo {
    pub identity: String,
    pub pathname: String,
    pub params: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub remote_address: IpAddr,
    pub tls: Option<TlsInfo>,
    pub password: Option<Vec<u8>>,
    pub requested_protocols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TlsInfo {
    pub authorized: bool,
    pub cert: Option<Vec<u8>>,
}

/// Extract `identity`: the last non-empty URL path segment, percent-decoded.
/// Returns `None` for a path with no non-empty segment (caller rejects 404).
pub fn extract_identity(pathname: &str) -> Option<String> {
    let last = pathname.trim_matches('/').rsplit('/').next()?;
    if last.is_empty() {
        return None;
    }
    Some(
        percent_decode_str(last)
            .decode_utf8()
            .map(|c| c.into_owned())
            .unwrap_or_else(|_| last.to_string()),
    )
}

/// Parse a `Sec-WebSocket-Protocol` header value into its comma-separated
/// tokens, per RFC 6455 + the RFC 7230 token grammar. Whitespace around
/// commas is accepted; a repeated token is a protocol error.
pub fn parse_subprotocols(header: &str) -> Result<Vec<String>, String> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for raw in header.split(',') {
        let tok = raw.trim();
        if tok.is_empty() {
            return Err("empty subprotocol token".to_string());
        }
        if !tok.chars().all(is_rfc7230_tchar) {
            return Err(format!("invalid subprotocol token: {tok}"));
        }
        if !seen.insert(tok.to_string()) {
            return Err(format!("duplicate subprotocol token: {tok}"));
        }
        out.push(tok.to_string());
    }
    Ok(out)
}

pub fn serialize_subprotocols(protocols: &[String]) -> String {
    protocols.join(", ")
}

fn is_rfc7230_tchar(c: char) -> bool {
    c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c)
}

/// Negotiate the first protocol in `offered` that `accepted` also allows.
/// An empty `accepted` list means "accept the first offered protocol".
pub fn negotiate(offered: &[String], accepted: &[String]) -> Option<String> {
    if accepted.is_empty() {
        return offered.first().cloned();
    }
    offered.iter().find(|p| accepted.contains(p)).cloned()
}

/// Close codes valid for emission, per spec §8:
/// `[1000,1014] \ {1004,1005,1006} ∪ [3000,4999]`. Anything else is
/// normalized to 1000.
pub fn validate_close_code(code: u16) -> u16 {
    let in_core_range = (1000..=1014).contains(&code) && ![1004, 1005, 1006].contains(&code);
    let in_app_range = (3000..=4999).contains(&code);
    if in_core_range || in_app_range {
        code
    } else {
        1000
    }
}

/// An IP allow-list rule: exact address or CIDR block. IPv4-mapped IPv6
/// addresses (`::ffff:x.x.x.x`) are normalized to their IPv4 form before
/// matching so the same rule set matches both forms identically.
#[derive(Debug, Clone)]
pub enum IpRule {
    ExactV4(Ipv4Addr),
    CidrV4(Ipv4Addr, u8),
    ExactV6(Ipv6Addr),
    CidrV6(Ipv6Addr, u8),
}

impl IpRule {
    pub fn parse(spec: &str) -> Result<Self, String> {
        if let Some((addr, prefix)) = spec.split_once('/') {
            let prefix: u8 = prefix
                .parse()
                .map_err(|_| format!("invalid CIDR prefix: {spec}"))?;
            return match addr.parse::<IpAddr>() {
                Ok(IpAddr::V4(a)) if prefix <= 32 => Ok(IpRule::CidrV4(a, prefix)),
                Ok(IpAddr::V6(a)) if prefix <= 128 => Ok(IpRule::CidrV6(a, prefix)),
                _ => Err(format!("invalid CIDR rule: {spec}")),
            };
        }
        match spec.parse::<IpAddr>() {
            Ok(IpAddr::V4(a)) => Ok(IpRule::ExactV4(a)),
            Ok(IpAddr::V6(a)) => Ok(IpRule::ExactV6(a)),
            Err(_) => Err(format!("invalid IP address: {spec}")),
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        let normalized = normalize_v4_mapped(addr);
        match (self, normalized) {
            (IpRule::ExactV4(r), IpAddr::V4(a)) => *r == a,
            (IpRule::CidrV4(r, prefix), IpAddr::V4(a)) => v4_in_cidr(a, *r, *prefix),
            (IpRule::ExactV6(r), IpAddr::V6(a)) => *r == a,
            (IpRule::CidrV6(r, prefix), IpAddr::V6(a)) => v6_in_cidr(a, *r, *prefix),
            _ => false,
        }
    }
}

fn normalize_v4_mapped(addr: &IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(*v6),
        },
        IpAddr::V4(v4) => IpAddr::V4(*v4),
    }
}

fn v4_in_cidr(addr: Ipv4Addr, network: Ipv4Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u32::MAX << (32 - prefix as u32);
    (u32::from(addr) & mask) == (u32::from(network) & mask)
}

fn v6_in_cidr(addr: Ipv6Addr, network: Ipv6Addr, prefix: u8) -> bool {
    if prefix == 0 {
        return true;
    }
    let mask = u128::MAX << (128 - prefix as u32);
    (u128::from(addr) & mask) == (u128::from(network) & mask)
}

/// Scheme whitelist check: only `ws` and `wss` are acceptable upgrade schemes.
pub fn is_allowed_scheme(scheme: &str) -> bool {
    matches!(scheme, "ws" | "wss")
}

/// Origin whitelist check. A missing `Origin` header is allowed (non-browser
/// chargers don't send one); a present origin must appear in `allowed`
/// verbatim, or `allowed` must be empty (meaning "no restriction").
pub fn is_allowed_origin(origin: Option<&str>, allowed: &[String]) -> bool {
    match origin {
        None => true,
        Some(o) => allowed.is_empty() || allowed.iter().any(|a| a == o),
    }
}

/// Constant-time byte comparison for Basic Auth password checks (spec §6
/// security profiles 1/2). The library has no opinion on credential storage,
/// so this is exposed for an embedder's auth callback to compare
/// `handshake.password` against its own secret without leaking timing.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_is_last_nonempty_segment_decoded() {
        assert_eq!(
            extract_identity("/ocpp/CP%2F001"),
            Some("CP/001".to_string())
        );
        assert_eq!(extract_identity("/ocpp/CP001/"), Some("CP001".to_string()));
        assert_eq!(extract_identity("///"), None);
    }

    #[test]
    fn subprotocol_round_trip() {
        let parsed = parse_subprotocols("ocpp1.6, ocpp2.0.1").unwrap();
        assert_eq!(parsed, vec!["ocpp1.6", "ocpp2.0.1"]);
        assert_eq!(serialize_subprotocols(&parsed), "ocpp1.6, ocpp2.0.1");
    }

    #[test]
    fn duplicate_subprotocol_is_rejected() {
        assert!(parse_subprotocols("ocpp1.6, ocpp1.6").is_err());
    }

    #[test]
    fn close_code_validation() {
        assert_eq!(validate_close_code(1000), 1000);
        assert_eq!(validate_close_code(1001), 1001);
        assert_eq!(validate_close_code(1004), 1000);
        assert_eq!(validate_close_code(1005), 1000);
        assert_eq!(validate_close_code(1006), 1000);
        assert_eq!(validate_close_code(3000), 3000);
        assert_eq!(validate_close_code(4999), 4999);
        assert_eq!(validate_close_code(5000), 1000);
        assert_eq!(validate_close_code(2000), 1000);
    }

    #[test]
    fn ipv4_mapped_ipv6_matches_v4_rules() {
        let rule = IpRule::parse("192.168.1.0/24").unwrap();
        let mapped: IpAddr = "::ffff:192.168.1.42".parse().unwrap();
        assert!(rule.matches(&mapped));
        let plain: IpAddr = "192.168.1.42".parse().unwrap();
        assert!(rule.matches(&plain));
        let outside: IpAddr = "192.168.2.1".parse().unwrap();
        assert!(!rule.matches(&outside));
    }

    #[test]
    fn exact_v6_rule_matches() {
        let rule = IpRule::parse("2001:db8::1").unwrap();
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        assert!(rule.matches(&addr));
    }

    #[test]
    fn negotiate_picks_first_mutually_accepted() {
        let offered = vec!["ocpp1.6".to_string(), "ocpp2.0.1".to_string()];
        let accepted = vec!["ocpp2.0.1".to_string()];
        assert_eq!(negotiate(&offered, &accepted), Some("ocpp2.0.1".to_string()));
        assert_eq!(negotiate(&offered, &[]), Some("ocpp1.6".to_string()));
    }

    #[test]
    fn constant_time_eq_matches_and_rejects() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"short"));
    }
}
