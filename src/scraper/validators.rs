use std::net::IpAddr;
use std::sync::OnceLock;

use regex::Regex;
use url::Url;

use crate::error::ScrapeError;

fn domain_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)*$")
            .expect("static regex")
    })
}

/// Validate URL syntax and return the normalized form: http(s) scheme,
/// non-empty host matching the domain grammar, fragment stripped.
pub fn validate_url_format(raw: &str) -> Result<Url, ScrapeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(ScrapeError::InvalidUrl("URL cannot be empty".to_string()));
    }

    let mut url = Url::parse(raw).map_err(|e| ScrapeError::InvalidUrl(e.to_string()))?;

    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(ScrapeError::InvalidUrl(format!(
                "invalid scheme '{other}', must be http or https"
            )))
        }
    }

    let host = url
        .host_str()
        .ok_or_else(|| ScrapeError::InvalidUrl("URL must have a host".to_string()))?
        .to_ascii_lowercase();

    // IP-literal hosts skip the domain grammar; the SSRF check handles them.
    if host.parse::<IpAddr>().is_err() && !domain_re().is_match(&host) {
        return Err(ScrapeError::InvalidUrl(format!(
            "invalid domain format: {host}"
        )));
    }

    url.set_fragment(None);
    Ok(url)
}

/// Extract the registrable host of a URL: lowercased, port and `www.` stripped.
pub fn extract_domain(url: &Url) -> String {
    let host = url.host_str().unwrap_or("").to_ascii_lowercase();
    host.strip_prefix("www.").unwrap_or(&host).to_string()
}

/// Private / internal address ranges blocked for SSRF protection.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            o[0] == 10
                || (o[0] == 172 && (16..=31).contains(&o[1]))
                || (o[0] == 192 && o[1] == 168)
                || o[0] == 127
                || (o[0] == 169 && o[1] == 254)
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            let seg = v6.segments();
            v6.is_loopback()
                || v6.is_unspecified()
                || (seg[0] & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (seg[0] & 0xffc0) == 0xfe80 // fe80::/10 link local
                || v6.to_ipv4_mapped().is_some_and(|v4| is_private_ip(IpAddr::V4(v4)))
        }
    }
}

/// Resolve the URL's host and reject when any address is private (SSRF guard).
/// Runs before any HTTP fetch.
pub async fn ensure_public_host(url: &Url) -> Result<(), ScrapeError> {
    let host = url
        .host_str()
        .ok_or_else(|| ScrapeError::InvalidUrl("URL must have a host".to_string()))?;

    // Literal IPs need no resolution.
    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(ScrapeError::PrivateIp(ip.to_string()));
        }
        return Ok(());
    }

    let port = url.port_or_known_default().unwrap_or(443);
    let addrs = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| ScrapeError::InvalidUrl(format!("DNS resolution failed for {host}: {e}")))?;

    for addr in addrs {
        if is_private_ip(addr.ip()) {
            return Err(ScrapeError::PrivateIp(addr.ip().to_string()));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_and_normalizes_product_urls() {
        let url = validate_url_format("https://www.amazon.ca/dp/B123?ref=x#reviews").unwrap();
        assert_eq!(url.fragment(), None);
        assert_eq!(extract_domain(&url), "amazon.ca");
    }

    #[test]
    fn rejects_bad_schemes_and_hosts() {
        assert!(matches!(
            validate_url_format("ftp://example.com/a"),
            Err(ScrapeError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url_format("https://bad_host_/x"),
            Err(ScrapeError::InvalidUrl(_))
        ));
        assert!(matches!(
            validate_url_format(""),
            Err(ScrapeError::InvalidUrl(_))
        ));
    }

    #[test]
    fn private_ranges_are_detected() {
        for ip in [
            "10.0.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.10.10",
        ] {
            assert!(is_private_ip(ip.parse().unwrap()), "{ip}");
        }
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("172.32.0.1".parse().unwrap()));
        assert!(!is_private_ip("2607:f8b0::1".parse().unwrap()));
    }

    #[tokio::test]
    async fn loopback_literal_fails_ssrf_guard() {
        let url = validate_url_format("http://127.0.0.1/admin").unwrap();
        assert!(matches!(
            ensure_public_host(&url).await,
            Err(ScrapeError::PrivateIp(_))
        ));
    }
}
