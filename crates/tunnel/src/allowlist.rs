//! CONNECT admission policy.

use regex::Regex;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::LazyLock;

/// Exact hostnames the tunnel will dial.
const ALLOWED_HOSTS: &[&str] = &[
    "auth.itunes.apple.com",
    "buy.itunes.apple.com",
    "init.itunes.apple.com",
];

/// Regional storefront purchase hosts (p25-buy.itunes.apple.com etc.).
static STOREFRONT_HOST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^p\d+-buy\.itunes\.apple\.com$").expect("valid regex"));

/// Whether a CONNECT hostname is admissible.
///
/// Literal IPs are rejected outright, before any pattern match: a dotted-quad
/// or bracketed IPv6 address can never be one of the allowlisted Apple hosts.
pub fn host_allowed(hostname: &str) -> bool {
    if hostname.is_empty() || is_ip_literal(hostname) {
        return false;
    }
    let lower = hostname.to_ascii_lowercase();
    ALLOWED_HOSTS.contains(&lower.as_str()) || STOREFRONT_HOST.is_match(&lower)
}

fn is_ip_literal(hostname: &str) -> bool {
    if hostname.parse::<Ipv4Addr>().is_ok() || hostname.parse::<Ipv6Addr>().is_ok() {
        return true;
    }
    // Bracketed IPv6, as it appears in URLs.
    if let Some(inner) = hostname
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
    {
        return inner.parse::<Ipv6Addr>().is_ok();
    }
    false
}
