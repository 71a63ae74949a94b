//! Target-URL egress filter for outbound webhook deliveries. The checks here
//! are pure; DNS resolution happens in the delivery worker, which feeds every
//! resolved address back through [`forbidden_ip_reason`].

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use url::{Host, Url};

pub const TARGET_URL_MAX_CHARS: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct EgressPolicy {
    pub allow_http: bool,
    pub allow_loopback: bool,
}

#[derive(Debug, Clone)]
pub struct ParsedTarget {
    pub url: Url,
    pub host: String,
    pub port: u16,
    /// Set when the host is an IP literal; such targets skip DNS.
    pub literal_ip: Option<IpAddr>,
}

/// Syntactic and address-literal validation. Returns a reason code suitable
/// for `egress_blocked:<reason>` on rejection.
pub fn validate_target_url(raw: &str, policy: &EgressPolicy) -> Result<ParsedTarget, &'static str> {
    if raw.len() > TARGET_URL_MAX_CHARS {
        return Err("url_too_long");
    }
    let url = Url::parse(raw).map_err(|_| "url_invalid")?;
    match url.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        "http" => return Err("http_not_allowed"),
        _ => return Err("scheme_not_allowed"),
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err("userinfo_not_allowed");
    }
    let (host, literal_ip) = match url.host() {
        Some(Host::Domain(d)) => (d.to_string(), None),
        Some(Host::Ipv4(v4)) => (v4.to_string(), Some(IpAddr::V4(v4))),
        Some(Host::Ipv6(v6)) => (v6.to_string(), Some(IpAddr::V6(v6))),
        None => return Err("host_missing"),
    };
    if let Some(ip) = literal_ip {
        if let Some(reason) = forbidden_ip_reason(ip, policy.allow_loopback) {
            return Err(reason);
        }
    }
    let port = url
        .port_or_known_default()
        .ok_or("port_missing")?;
    Ok(ParsedTarget {
        host,
        port,
        literal_ip,
        url,
    })
}

/// Classifies an IP as forbidden for egress. Loopback is gated behind the
/// explicit allow flag; everything else on the list is always refused.
pub fn forbidden_ip_reason(ip: IpAddr, allow_loopback: bool) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => forbidden_v4_reason(v4, allow_loopback),
        IpAddr::V6(v6) => forbidden_v6_reason(v6, allow_loopback),
    }
}

fn forbidden_v4_reason(ip: Ipv4Addr, allow_loopback: bool) -> Option<&'static str> {
    let o = ip.octets();
    if ip == Ipv4Addr::new(169, 254, 169, 254) {
        return Some("metadata_endpoint");
    }
    if ip.is_unspecified() {
        return Some("unspecified");
    }
    if ip.is_loopback() {
        return (!allow_loopback).then_some("loopback");
    }
    if ip.is_private() {
        return Some("private");
    }
    if ip.is_link_local() {
        return Some("link_local");
    }
    if o[0] == 100 && (64..128).contains(&o[1]) {
        return Some("cgnat");
    }
    if ip.is_multicast() {
        return Some("multicast");
    }
    if o[0] >= 240 || ip.is_broadcast() {
        return Some("reserved");
    }
    None
}

fn forbidden_v6_reason(ip: Ipv6Addr, allow_loopback: bool) -> Option<&'static str> {
    if let Some(mapped) = ip.to_ipv4_mapped() {
        return forbidden_v4_reason(mapped, allow_loopback);
    }
    if ip.is_unspecified() {
        return Some("unspecified");
    }
    if ip.is_loopback() {
        return (!allow_loopback).then_some("loopback");
    }
    let seg0 = ip.segments()[0];
    if seg0 & 0xfe00 == 0xfc00 {
        return Some("private");
    }
    if seg0 & 0xffc0 == 0xfe80 {
        return Some("link_local");
    }
    if seg0 & 0xff00 == 0xff00 {
        return Some("multicast");
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: EgressPolicy = EgressPolicy {
        allow_http: false,
        allow_loopback: false,
    };
    const LAX: EgressPolicy = EgressPolicy {
        allow_http: true,
        allow_loopback: true,
    };

    #[test]
    fn https_public_host_passes() {
        let target = validate_target_url("https://hooks.example.com/joygate", &STRICT).unwrap();
        assert_eq!(target.host, "hooks.example.com");
        assert_eq!(target.port, 443);
        assert!(target.literal_ip.is_none());
    }

    #[test]
    fn http_and_loopback_require_allow_flags() {
        assert_eq!(
            validate_target_url("http://example.com/", &STRICT).unwrap_err(),
            "http_not_allowed"
        );
        assert!(validate_target_url("http://example.com/", &LAX).is_ok());
        assert!(validate_target_url("https://127.0.0.1/hook", &STRICT).is_err());
        assert!(validate_target_url("http://127.0.0.1:9/hook", &LAX).is_ok());
    }

    #[test]
    fn userinfo_and_bad_schemes_are_rejected() {
        assert!(validate_target_url("https://user@example.com/", &LAX).is_err());
        assert!(validate_target_url("https://u:p@example.com/", &LAX).is_err());
        assert!(validate_target_url("ftp://example.com/", &LAX).is_err());
        assert!(validate_target_url("file:///etc/passwd", &LAX).is_err());
    }

    #[test]
    fn forbidden_ranges() {
        let cases: [(&str, &str); 8] = [
            ("10.1.2.3", "private"),
            ("172.16.0.9", "private"),
            ("192.168.1.1", "private"),
            ("169.254.169.254", "metadata_endpoint"),
            ("169.254.0.7", "link_local"),
            ("100.64.0.1", "cgnat"),
            ("224.0.0.1", "multicast"),
            ("0.0.0.0", "unspecified"),
        ];
        for (ip, reason) in cases {
            let parsed: Ipv4Addr = ip.parse().unwrap();
            assert_eq!(
                forbidden_v4_reason(parsed, true),
                Some(reason),
                "ip {ip} should be {reason}"
            );
        }
        assert_eq!(forbidden_v4_reason("100.128.0.1".parse().unwrap(), true), None);
        assert_eq!(forbidden_v4_reason("8.8.8.8".parse().unwrap(), false), None);
    }

    #[test]
    fn ipv6_forbidden_ranges() {
        assert_eq!(forbidden_ip_reason("::1".parse().unwrap(), false), Some("loopback"));
        assert_eq!(forbidden_ip_reason("::1".parse().unwrap(), true), None);
        assert_eq!(forbidden_ip_reason("fc00::1".parse().unwrap(), true), Some("private"));
        assert_eq!(forbidden_ip_reason("fe80::1".parse().unwrap(), true), Some("link_local"));
        assert_eq!(forbidden_ip_reason("ff02::1".parse().unwrap(), true), Some("multicast"));
        // v4-mapped addresses classify as their v4 form
        assert_eq!(
            forbidden_ip_reason("::ffff:192.168.0.1".parse().unwrap(), true),
            Some("private")
        );
        assert_eq!(forbidden_ip_reason("2001:4860:4860::8888".parse().unwrap(), false), None);
    }

    #[test]
    fn overlong_urls_are_rejected() {
        let long = format!("https://example.com/{}", "a".repeat(TARGET_URL_MAX_CHARS));
        assert!(validate_target_url(&long, &LAX).is_err());
    }
}
